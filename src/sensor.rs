use crate::config::MIN_SERVICE_VERSION;
use crate::error::{ConnectError, ServiceError};
use crate::types::{CameraFrame, ImuSample, ServiceVersion};
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long one `read_timeout` call may block, so the stop flag is seen promptly.
const READ_POLL: Duration = Duration::from_millis(50);

/// One timestamped sensor measurement.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorPacket {
    Imu(ImuSample),
    Frame(CameraFrame),
}

impl SensorPacket {
    pub fn timestamp_us(&self) -> u64 {
        match self {
            SensorPacket::Imu(s) => s.timestamp_us,
            SensorPacket::Frame(f) => f.timestamp_us,
        }
    }
}

/// A bound camera+IMU stream. Dropping it releases the binding.
pub trait SensorStream: Send {
    /// Wait up to `timeout` for the next packet. `Ok(None)` means nothing arrived.
    fn read_timeout(&mut self, timeout: Duration) -> Result<Option<SensorPacket>, ServiceError>;
}

/// The platform tracking service handle passed into `connect()`.
pub trait PlatformService: Send {
    fn version(&self) -> Result<ServiceVersion, ServiceError>;

    fn open_stream(&mut self) -> Result<Box<dyn SensorStream>, ServiceError>;
}

/// Handle to the sensor ingestion thread.
///
/// The reader thread owns the [`SensorStream`], drops out-of-order packets and
/// forwards the rest into a bounded queue consumed by the tracking thread.
pub struct SensorIngest {
    receiver: Receiver<SensorPacket>,
    stop_flag: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl SensorIngest {
    pub(crate) fn start(
        stream: Box<dyn SensorStream>,
        capacity: usize,
    ) -> Result<SensorIngest, ConnectError> {
        let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_clone = stop_flag.clone();

        let thread = std::thread::Builder::new()
            .name("areatrack-ingest".into())
            .spawn(move || {
                ingest_loop(stream, sender, stop_clone);
            })
            .map_err(|e| ConnectError::ThreadSpawn(format!("sensor ingest: {}", e)))?;

        Ok(SensorIngest {
            receiver,
            stop_flag,
            thread: Some(thread),
        })
    }

    /// Queue of ordered packets. Disconnects when the reader thread exits.
    pub fn receiver(&self) -> Receiver<SensorPacket> {
        self.receiver.clone()
    }

    pub fn is_active(&self) -> bool {
        !self.stop_flag.load(Ordering::Relaxed)
            && self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the reader and wait up to `grace` for it to release the stream.
    ///
    /// Returns `false` if the thread was still running when the grace period
    /// expired; it is then detached and releases the stream on its next poll.
    pub fn stop(mut self, grace: Duration) -> bool {
        self.shutdown(grace)
    }

    fn shutdown(&mut self, grace: Duration) -> bool {
        self.stop_flag.store(true, Ordering::Relaxed);
        let Some(thread) = self.thread.take() else {
            return true;
        };
        if join_within(thread, grace) {
            true
        } else {
            log::warn!("Sensor ingest did not stop within {:?}; detaching", grace);
            false
        }
    }
}

impl Drop for SensorIngest {
    fn drop(&mut self) {
        self.shutdown(READ_POLL * 4);
    }
}

/// Join `thread` if it finishes within `grace`, otherwise drop (detach) it.
pub(crate) fn join_within(thread: std::thread::JoinHandle<()>, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    while !thread.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    if thread.join().is_err() {
        log::error!("Session worker thread panicked");
    }
    true
}

fn ingest_loop(
    mut stream: Box<dyn SensorStream>,
    sender: Sender<SensorPacket>,
    stop_flag: Arc<AtomicBool>,
) {
    let mut last_imu_us: Option<u64> = None;
    let mut last_frame_us: Option<u64> = None;

    log::info!("Sensor ingest started");

    loop {
        if stop_flag.load(Ordering::Relaxed) {
            log::info!("Sensor ingest stopping (stop flag set)");
            break;
        }

        let packet = match stream.read_timeout(READ_POLL) {
            Ok(Some(p)) => p,
            Ok(None) => continue,
            Err(e) => {
                log::warn!("Sensor stream ended: {}", e);
                break;
            }
        };

        let last = match packet {
            SensorPacket::Imu(_) => &mut last_imu_us,
            SensorPacket::Frame(_) => &mut last_frame_us,
        };
        let ts = packet.timestamp_us();
        if last.is_some_and(|prev| ts <= prev) {
            log::trace!("Dropping out-of-order packet at {} us", ts);
            continue;
        }
        *last = Some(ts);

        if let Err(e) = sender.try_send(packet) {
            match e {
                crossbeam_channel::TrySendError::Full(_) => {
                    log::trace!("Ingest queue full, dropping packet");
                }
                crossbeam_channel::TrySendError::Disconnected(_) => {
                    log::info!("Ingest queue disconnected, stopping reader");
                    break;
                }
            }
        }
    }
    // `stream` drops here, releasing the sensor binding.
}

#[derive(Debug)]
struct FeedState {
    bindings: AtomicUsize,
    available: AtomicBool,
}

/// Producer side of [`channel_service`]: whoever owns the camera and IMU
/// pushes packets here.
#[derive(Debug, Clone)]
pub struct SensorFeed {
    sender: Sender<SensorPacket>,
    state: Arc<FeedState>,
}

impl SensorFeed {
    /// Non-blocking push; returns `false` if the packet was dropped.
    pub fn push(&self, packet: SensorPacket) -> bool {
        self.sender.try_send(packet).is_ok()
    }

    pub fn push_imu(&self, sample: ImuSample) -> bool {
        self.push(SensorPacket::Imu(sample))
    }

    pub fn push_frame(&self, frame: CameraFrame) -> bool {
        self.push(SensorPacket::Frame(frame))
    }

    /// Simulate the platform service going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::SeqCst);
    }

    pub fn active_bindings(&self) -> usize {
        self.state.bindings.load(Ordering::SeqCst)
    }
}

/// In-process [`PlatformService`] fed through a [`SensorFeed`].
pub struct ChannelService {
    receiver: Receiver<SensorPacket>,
    state: Arc<FeedState>,
    version: ServiceVersion,
}

impl ChannelService {
    pub fn with_version(mut self, version: ServiceVersion) -> Self {
        self.version = version;
        self
    }

    pub fn active_bindings(&self) -> usize {
        self.state.bindings.load(Ordering::SeqCst)
    }
}

impl PlatformService for ChannelService {
    fn version(&self) -> Result<ServiceVersion, ServiceError> {
        if !self.state.available.load(Ordering::SeqCst) {
            return Err(ServiceError::Unavailable("service not reachable".into()));
        }
        Ok(self.version)
    }

    fn open_stream(&mut self) -> Result<Box<dyn SensorStream>, ServiceError> {
        if !self.state.available.load(Ordering::SeqCst) {
            return Err(ServiceError::Unavailable("service not reachable".into()));
        }
        if self
            .state
            .bindings
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ServiceError::Unavailable("sensor already bound".into()));
        }
        Ok(Box::new(ChannelStream {
            receiver: self.receiver.clone(),
            state: self.state.clone(),
        }))
    }
}

struct ChannelStream {
    receiver: Receiver<SensorPacket>,
    state: Arc<FeedState>,
}

impl SensorStream for ChannelStream {
    fn read_timeout(&mut self, timeout: Duration) -> Result<Option<SensorPacket>, ServiceError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(p) => Ok(Some(p)),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Ok(None),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                Err(ServiceError::Disconnected)
            }
        }
    }
}

impl Drop for ChannelStream {
    fn drop(&mut self) {
        self.state.bindings.fetch_sub(1, Ordering::SeqCst);
        log::debug!("Sensor binding released");
    }
}

/// Create a connected feed/service pair backed by a bounded queue.
pub fn channel_service(capacity: usize) -> (SensorFeed, ChannelService) {
    let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
    let state = Arc::new(FeedState {
        bindings: AtomicUsize::new(0),
        available: AtomicBool::new(true),
    });
    (
        SensorFeed {
            sender,
            state: state.clone(),
        },
        ChannelService {
            receiver,
            state,
            version: MIN_SERVICE_VERSION,
        },
    )
}
