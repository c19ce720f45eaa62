//! Tracking session controller.
//!
//! A [`Session`] owns three kinds of threads while connected:
//!
//! - the sensor ingest reader ([`SensorIngest`]),
//! - the tracking thread, which runs the estimator and relocalization
//!   engine and publishes an immutable snapshot after every tick,
//! - at most one save worker.
//!
//! All UI-facing reads clone an `Arc` of the latest snapshot under a short
//! read lock and never wait on the tracking thread.

use crate::area_map::AreaMap;
use crate::config::TrackerTuning;
use crate::error::{ConnectError, SaveError};
use crate::estimator::{PoseEstimator, TickOutput};
use crate::events::{self, EventLog};
use crate::geometry;
use crate::reloc::{RelocUpdate, RelocalizationEngine};
use crate::sensor::{self, PlatformService, SensorIngest, SensorPacket};
use crate::store::{AdfStore, KEY_DATE, KEY_NAME};
use crate::types::{
    AdfRecord, CameraView, FramePair, Pose, PoseReport, SessionConfig, TrackingStatus,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Upper bound on one blocking receive in the tracking loop.
const TRACK_POLL: Duration = Duration::from_millis(50);

const CONTROL_CAPACITY: usize = 4;

/// At most one connected session per process.
static SESSION_ACTIVE: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

struct ProcessGuard;

impl ProcessGuard {
    fn acquire() -> Result<ProcessGuard, ConnectError> {
        SESSION_ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ProcessGuard)
            .map_err(|_| ConnectError::AlreadyConnected)
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        SESSION_ACTIVE.store(false, Ordering::SeqCst);
    }
}

/// Snapshot published by the tracking thread.
#[derive(Debug, Clone, Default)]
struct Published {
    status: TrackingStatus,
    poses: HashMap<FramePair, Pose>,
    reports: HashMap<FramePair, PoseReport>,
    relocalized: bool,
    adf_uuid: Option<String>,
}

struct Shared {
    published: RwLock<Arc<Published>>,
    state: Mutex<SessionState>,
    events: EventLog,
    /// Held while connected. Released by teardown or by the tracking thread
    /// when the sensor stream is lost.
    guard: Mutex<Option<ProcessGuard>>,
}

enum Control {
    ResetMotionTracking,
}

struct SaveJob {
    cancel: Arc<AtomicBool>,
    /// Set by the worker before it hands back its result.
    done: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Resources held while connected.
struct Active {
    config: SessionConfig,
    ingest: SensorIngest,
    stop_flag: Arc<AtomicBool>,
    control: Sender<Control>,
    tracker: Option<JoinHandle<()>>,
    map: Arc<RwLock<AreaMap>>,
    save: Option<SaveJob>,
}

/// Handle to one tracking session.
pub struct Session {
    store: Arc<AdfStore>,
    tuning: TrackerTuning,
    camera_view: Mutex<CameraView>,
    shared: Arc<Shared>,
    active: Mutex<Option<Active>>,
}

impl Session {
    pub fn new(store: Arc<AdfStore>, tuning: TrackerTuning) -> Session {
        Session {
            store,
            tuning,
            camera_view: Mutex::new(CameraView::default()),
            shared: Arc::new(Shared {
                published: RwLock::new(Arc::new(Published::default())),
                state: Mutex::new(SessionState::Disconnected),
                events: EventLog::new(),
                guard: Mutex::new(None),
            }),
            active: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<AdfStore> {
        &self.store
    }

    pub fn tuning(&self) -> &TrackerTuning {
        &self.tuning
    }

    /// Bind the sensor stream and start tracking.
    ///
    /// With `LOAD_ADF_ON_START` the requested record (or the most recently
    /// saved one) is loaded for relocalization before the sensor is bound.
    pub fn connect(
        &self,
        service: &mut dyn PlatformService,
        config: SessionConfig,
    ) -> Result<(), ConnectError> {
        let mut slot = self.active.lock();
        if let Some(stale) = slot.take() {
            if self.state() == SessionState::Connected {
                *slot = Some(stale);
                return Err(ConnectError::AlreadyConnected);
            }
            // The sensor failed underneath a previous connection.
            self.teardown(stale);
        }

        *self.shared.guard.lock() = Some(ProcessGuard::acquire()?);
        self.set_state(SessionState::Connecting);
        match self.start(service, &config) {
            Ok(active) => {
                *slot = Some(active);
                *self.camera_view.lock() = config.camera_view;
                log::info!("Session connected (flags {:?})", config.flags);
                Ok(())
            }
            Err(e) => {
                self.set_state(SessionState::Disconnected);
                self.shared.guard.lock().take();
                log::warn!("Connect failed: {}", e);
                Err(e)
            }
        }
    }

    fn start(
        &self,
        service: &mut dyn PlatformService,
        config: &SessionConfig,
    ) -> Result<Active, ConnectError> {
        let found = service.version()?;
        let required = self.tuning.min_service_version;
        if found < required {
            return Err(ConnectError::VersionMismatch { found, required });
        }
        log::debug!("Platform service version {}", found);

        let engine = self.build_engine(config)?;
        let map = engine.shared_map();

        let stream = service.open_stream()?;
        let ingest = SensorIngest::start(stream, self.tuning.ingest_capacity)?;

        let stop_flag = Arc::new(AtomicBool::new(false));
        let (control, control_rx) = crossbeam_channel::bounded(CONTROL_CAPACITY);

        let working = Published {
            adf_uuid: engine.current_adf_uuid(),
            ..Published::default()
        };
        *self.shared.published.write() = Arc::new(working.clone());

        let tracker = Tracker {
            estimator: PoseEstimator::new(self.tuning.clone(), config.auto_recovery()),
            engine,
            packets: ingest.receiver(),
            control: control_rx,
            stop_flag: stop_flag.clone(),
            shared: self.shared.clone(),
            frame_timeout: self.tuning.frame_timeout,
            working,
            last_ts: HashMap::new(),
        };
        // Set before the thread runs so an early sensor loss is not overwritten.
        self.set_state(SessionState::Connected);
        let tracker = std::thread::Builder::new()
            .name("areatrack-track".into())
            .spawn(move || tracker.run())
            .map_err(|e| ConnectError::ThreadSpawn(format!("tracking: {}", e)))?;

        Ok(Active {
            config: config.clone(),
            ingest,
            stop_flag,
            control,
            tracker: Some(tracker),
            map,
            save: None,
        })
    }

    fn build_engine(&self, config: &SessionConfig) -> Result<RelocalizationEngine, ConnectError> {
        let learning = config.area_learning();
        if !config.load_adf_on_start() {
            return Ok(RelocalizationEngine::new(self.tuning.clone(), learning));
        }
        let uuid = match config.adf_uuid.clone().or_else(|| self.store.latest()) {
            Some(uuid) => uuid,
            None => {
                log::warn!("No area description to load; starting without one");
                return Ok(RelocalizationEngine::new(self.tuning.clone(), learning));
            }
        };
        let record = self.store.load(&uuid)?;
        let map = AreaMap::decode(&record.payload)?;
        Ok(RelocalizationEngine::with_loaded(
            self.tuning.clone(),
            learning,
            uuid,
            map,
        ))
    }

    /// Stop tracking and release the sensor. Safe to call when not connected.
    pub fn disconnect(&self) {
        let active = self.active.lock().take();
        match active {
            Some(active) => {
                self.teardown(active);
                log::info!("Session disconnected");
            }
            None => self.set_state(SessionState::Disconnected),
        }
    }

    fn teardown(&self, active: Active) {
        let grace = self.tuning.disconnect_grace;
        let Active {
            ingest,
            stop_flag,
            tracker,
            save,
            ..
        } = active;

        if let Some(job) = save {
            job.cancel.store(true, Ordering::SeqCst);
            if !sensor::join_within(job.thread, grace) {
                log::warn!("Save worker still running after {:?}; result discarded", grace);
            }
        }

        stop_flag.store(true, Ordering::SeqCst);
        if let Some(thread) = tracker {
            if !sensor::join_within(thread, grace) {
                log::warn!("Tracking thread did not stop within {:?}; detaching", grace);
            }
        }
        ingest.stop(grace);

        // The stop flag is set, so a detached tracker can no longer publish.
        *self.shared.published.write() = Arc::new(Published::default());
        self.set_state(SessionState::Disconnected);
        self.shared.guard.lock().take();
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    fn set_state(&self, state: SessionState) {
        *self.shared.state.lock() = state;
    }

    pub fn set_camera_view(&self, view: CameraView) {
        *self.camera_view.lock() = view;
    }

    pub fn camera_view(&self) -> CameraView {
        *self.camera_view.lock()
    }

    fn snapshot(&self) -> Arc<Published> {
        self.shared.published.read().clone()
    }

    pub fn current_status(&self) -> TrackingStatus {
        self.snapshot().status
    }

    pub fn current_pose(&self, pair: FramePair) -> Option<Pose> {
        self.snapshot().poses.get(&pair).copied()
    }

    pub fn pose_report(&self, pair: FramePair) -> Option<PoseReport> {
        self.snapshot().reports.get(&pair).copied()
    }

    pub fn is_relocalized(&self) -> bool {
        self.snapshot().relocalized
    }

    pub fn current_adf_uuid(&self) -> Option<String> {
        self.snapshot().adf_uuid.clone()
    }

    pub fn events(&self) -> &EventLog {
        &self.shared.events
    }

    /// Ask the tracking thread to drop its state and re-initialize.
    ///
    /// Returns `false` when not connected.
    pub fn reset_motion_tracking(&self) -> bool {
        let active = self.active.lock();
        match active.as_ref() {
            Some(a) => a.control.try_send(Control::ResetMotionTracking).is_ok(),
            None => false,
        }
    }

    /// Start saving the current map on a worker thread.
    pub fn begin_save(&self, name: &str) -> Result<PendingSave, SaveError> {
        let mut slot = self.active.lock();
        let active = match slot.as_mut() {
            Some(a) if self.state() == SessionState::Connected => a,
            _ => return Err(SaveError::NotConnected),
        };
        if !active.config.area_learning() {
            return Err(SaveError::LearningDisabled);
        }
        if !self.is_relocalized() {
            return Err(SaveError::NotRelocalized);
        }
        if let Some(job) = active.save.take() {
            if !job.done.load(Ordering::SeqCst) {
                active.save = Some(job);
                return Err(SaveError::SaveInProgress);
            }
            sensor::join_within(job.thread, self.tuning.disconnect_grace);
        }

        let (result_tx, result_rx) = crossbeam_channel::bounded(1);
        let cancel = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicBool::new(false));
        let done_flag = done.clone();
        let worker = SaveWorker {
            store: self.store.clone(),
            map: active.map.clone(),
            name: name.to_string(),
            cancel: cancel.clone(),
            shared: self.shared.clone(),
        };
        let thread = std::thread::Builder::new()
            .name("areatrack-save".into())
            .spawn(move || {
                let result = worker.run();
                done_flag.store(true, Ordering::SeqCst);
                let _ = result_tx.send(result);
            })
            .map_err(|e| {
                SaveError::Persistence(crate::error::PersistenceError::Encode(format!(
                    "failed to spawn save worker: {}",
                    e
                )))
            })?;

        active.save = Some(SaveJob {
            cancel: cancel.clone(),
            done,
            thread,
        });
        log::info!("Saving area description {:?}", name);
        Ok(PendingSave {
            result: result_rx,
            cancel,
        })
    }

    /// Save and wait for the result. Tracking continues meanwhile.
    pub fn save_adf(&self, name: &str) -> Result<AdfRecord, SaveError> {
        self.begin_save(name)?.wait()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// An in-flight save started by [`Session::begin_save`].
pub struct PendingSave {
    result: Receiver<Result<AdfRecord, SaveError>>,
    cancel: Arc<AtomicBool>,
}

impl PendingSave {
    pub fn wait(self) -> Result<AdfRecord, SaveError> {
        self.result.recv().unwrap_or(Err(SaveError::Cancelled))
    }

    /// `None` if the save is still running after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<AdfRecord, SaveError>> {
        match self.result.recv_timeout(timeout) {
            Ok(r) => Some(r),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(SaveError::Cancelled)),
        }
    }

    pub fn try_result(&self) -> Option<Result<AdfRecord, SaveError>> {
        match self.result.try_recv() {
            Ok(r) => Some(r),
            Err(crossbeam_channel::TryRecvError::Empty) => None,
            Err(crossbeam_channel::TryRecvError::Disconnected) => Some(Err(SaveError::Cancelled)),
        }
    }

    /// Request cancellation. Honoured only before the record is written.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

struct SaveWorker {
    store: Arc<AdfStore>,
    map: Arc<RwLock<AreaMap>>,
    name: String,
    cancel: Arc<AtomicBool>,
    shared: Arc<Shared>,
}

impl SaveWorker {
    fn run(self) -> Result<AdfRecord, SaveError> {
        let result = self.save();
        match &result {
            Ok(record) => log::info!("Saved area description {} ({:?})", record.uuid, self.name),
            Err(e) => {
                log::warn!("Save of {:?} failed: {}", self.name, e);
                self.shared.events.push(events::KEY_SAVE_PROGRESS, "failed");
            }
        }
        result
    }

    fn save(&self) -> Result<AdfRecord, SaveError> {
        self.progress(0);
        // Clone under the lock, encode outside it.
        let snapshot = self.map.read().clone();
        self.check_cancel()?;

        let payload = snapshot.encode()?;
        self.progress(33);
        self.check_cancel()?;

        let mut record = self.store.persist(&payload)?;
        self.progress(66);

        // The record exists now; cancellation is no longer honoured.
        let date = now_ms().to_string();
        let tagged = self
            .store
            .set_metadata(&record.uuid, KEY_NAME, &self.name)
            .and_then(|_| self.store.set_metadata(&record.uuid, KEY_DATE, &date));
        if let Err(e) = tagged {
            if let Err(d) = self.store.delete(&record.uuid) {
                log::warn!("Failed to roll back unnamed record {}: {}", record.uuid, d);
            }
            return Err(e.into());
        }
        record.metadata.insert(KEY_NAME.to_string(), self.name.clone());
        record.metadata.insert(KEY_DATE.to_string(), date);
        self.progress(100);
        Ok(record)
    }

    fn progress(&self, percent: u32) {
        self.shared.events.push(events::KEY_SAVE_PROGRESS, percent.to_string());
    }

    fn check_cancel(&self) -> Result<(), SaveError> {
        if self.cancel.load(Ordering::SeqCst) {
            Err(SaveError::Cancelled)
        } else {
            Ok(())
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// State owned by the tracking thread.
struct Tracker {
    estimator: PoseEstimator,
    engine: RelocalizationEngine,
    packets: Receiver<SensorPacket>,
    control: Receiver<Control>,
    stop_flag: Arc<AtomicBool>,
    shared: Arc<Shared>,
    frame_timeout: Duration,
    working: Published,
    last_ts: HashMap<FramePair, u64>,
}

impl Tracker {
    fn run(mut self) {
        log::info!("Tracking thread started");
        let poll = self.frame_timeout.min(TRACK_POLL);
        let mut last_frame = Instant::now();
        let mut timed_out = false;

        loop {
            if self.stop_flag.load(Ordering::SeqCst) {
                log::info!("Tracking thread stopping (stop flag set)");
                break;
            }

            while let Ok(Control::ResetMotionTracking) = self.control.try_recv() {
                self.estimator.reset();
                self.set_status(self.estimator.status());
                self.publish();
            }

            match self.packets.recv_timeout(poll) {
                Ok(SensorPacket::Imu(sample)) => self.estimator.process_imu(sample),
                Ok(SensorPacket::Frame(frame)) => {
                    if let Some(out) = self.estimator.process_frame(&frame) {
                        last_frame = Instant::now();
                        timed_out = false;
                        let update = self.engine.process(&out, &frame);
                        self.on_tick(&out, &update);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    if !self.stop_flag.load(Ordering::SeqCst) {
                        self.on_sensor_lost();
                    }
                    break;
                }
            }

            if !timed_out && last_frame.elapsed() >= self.frame_timeout {
                timed_out = true;
                let status = self.estimator.process_timeout();
                self.shared.events.push(
                    events::KEY_SENSOR_TIMEOUT,
                    format!("no camera frame for {} ms", self.frame_timeout.as_millis()),
                );
                self.set_status(status);
                self.publish();
            }
        }
    }

    fn on_tick(&mut self, out: &TickOutput, update: &RelocUpdate) {
        let ts = out.pose.timestamp_us;
        let confidence = out.pose.confidence;
        self.set_status(out.status);
        self.record(out.pose);

        match update.adf_t_sos {
            Some(adf_t_sos) => {
                let sos_t_device = geometry::isometry_from_pose(&out.pose);
                self.record(geometry::pose_from_isometry(
                    &adf_t_sos,
                    FramePair::ADF_SOS,
                    ts,
                    out.status,
                    confidence,
                ));
                self.record(geometry::pose_from_isometry(
                    &(adf_t_sos * sos_t_device),
                    FramePair::ADF_DEVICE,
                    ts,
                    out.status,
                    confidence,
                ));
            }
            None => {
                self.working.poses.remove(&FramePair::ADF_SOS);
                self.working.poses.remove(&FramePair::ADF_DEVICE);
            }
        }

        if update.newly_relocalized {
            let value = self
                .engine
                .current_adf_uuid()
                .unwrap_or_else(|| "learned map".to_string());
            self.shared.events.push(events::KEY_RELOCALIZED, value);
        }
        self.working.relocalized = self.engine.is_relocalized();
        self.publish();
    }

    fn record(&mut self, pose: Pose) {
        let pair = pose.frames;
        let report = self.working.reports.entry(pair).or_default();
        if let Some(prev) = self.last_ts.insert(pair, pose.timestamp_us) {
            report.delta_ms = pose.timestamp_us.saturating_sub(prev) as f64 / 1000.0;
        }
        report.count += 1;
        report.status = pose.status;
        self.working.poses.insert(pair, pose);
    }

    fn set_status(&mut self, status: TrackingStatus) {
        if status != self.working.status {
            self.shared
                .events
                .push(events::KEY_TRACKING_STATUS, status.to_string());
        }
        self.working.status = status;
    }

    fn on_sensor_lost(&mut self) {
        log::error!("Sensor stream lost; session disconnected");
        self.shared
            .events
            .push(events::KEY_SENSOR_ERROR, "sensor stream ended");
        self.set_status(TrackingStatus::Invalid);
        self.publish();

        // The stop flag is set before teardown releases the slot, so a
        // tracker that sees it clear still owns the current guard.
        let mut guard = self.shared.guard.lock();
        if !self.stop_flag.load(Ordering::SeqCst) {
            *self.shared.state.lock() = SessionState::Disconnected;
            guard.take();
        }
    }

    fn publish(&self) {
        let mut slot = self.shared.published.write();
        // Checked under the lock so nothing lands after a teardown reset.
        if self.stop_flag.load(Ordering::SeqCst) {
            return;
        }
        *slot = Arc::new(self.working.clone());
    }
}

#[cfg(test)]
pub(crate) static SESSION_TEST_LOCK: Mutex<()> = parking_lot::const_mutex(());

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::channel_service;
    use crate::types::{ServiceVersion, SessionFlags};
    use tempfile::TempDir;

    fn session() -> (TempDir, Session) {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(AdfStore::open(temp.path()).unwrap());
        (temp, Session::new(store, TrackerTuning::default()))
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let _serial = SESSION_TEST_LOCK.lock();
        let (_temp, session) = session();
        session.disconnect();
        session.disconnect();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.current_status(), TrackingStatus::Unknown);
        assert!(!session.reset_motion_tracking());
    }

    #[test]
    fn test_second_session_is_rejected() {
        let _serial = SESSION_TEST_LOCK.lock();
        let (_t1, first) = session();
        let (_t2, second) = session();
        let (feed, mut service) = channel_service(16);
        let (_feed2, mut service2) = channel_service(16);

        first.connect(&mut service, SessionConfig::default()).unwrap();
        assert!(matches!(
            second.connect(&mut service2, SessionConfig::default()),
            Err(ConnectError::AlreadyConnected)
        ));
        assert!(matches!(
            first.connect(&mut service2, SessionConfig::default()),
            Err(ConnectError::AlreadyConnected)
        ));

        first.disconnect();
        assert_eq!(feed.active_bindings(), 0);
        second.connect(&mut service2, SessionConfig::default()).unwrap();
        second.disconnect();
    }

    #[test]
    fn test_old_service_is_refused() {
        let _serial = SESSION_TEST_LOCK.lock();
        let (_temp, session) = session();
        let (feed, service) = channel_service(16);
        let mut service = service.with_version(ServiceVersion::new(1, 0));
        let err = session.connect(&mut service, SessionConfig::default()).unwrap_err();
        assert!(matches!(err, ConnectError::VersionMismatch { .. }));
        assert_eq!(feed.active_bindings(), 0);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_save_preconditions() {
        let _serial = SESSION_TEST_LOCK.lock();
        let (_temp, session) = session();
        assert!(matches!(session.save_adf("x"), Err(SaveError::NotConnected)));

        let (_feed, mut service) = channel_service(16);
        session.connect(&mut service, SessionConfig::default()).unwrap();
        assert!(matches!(session.save_adf("x"), Err(SaveError::LearningDisabled)));
        session.disconnect();

        session
            .connect(&mut service, SessionConfig::new(SessionFlags::AREA_LEARNING))
            .unwrap();
        assert!(matches!(session.save_adf("x"), Err(SaveError::NotRelocalized)));
        session.disconnect();
    }

    #[test]
    fn test_camera_view_is_plain_state() {
        let (_temp, session) = session();
        assert_eq!(session.camera_view(), CameraView::FirstPerson);
        session.set_camera_view(CameraView::TopDown);
        assert_eq!(session.camera_view(), CameraView::TopDown);
    }

    #[test]
    fn test_missing_adf_fails_connect() {
        let _serial = SESSION_TEST_LOCK.lock();
        let (_temp, session) = session();
        let (feed, mut service) = channel_service(16);
        let config = SessionConfig::default().with_adf(uuid::Uuid::new_v4().to_string());
        assert!(matches!(
            session.connect(&mut service, config),
            Err(ConnectError::AdfLoad(_))
        ));
        assert_eq!(feed.active_bindings(), 0);
    }
}
