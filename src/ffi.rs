//! C FFI layer for areatrack.
//!
//! Opaque handles replace process-wide native tables: a store handle, a
//! session handle and a channel-service handle through which the host
//! pushes camera and IMU data. The generated C header is written to
//! `include/areatrack.h` by cbindgen.

use crate::config::TrackerTuning;
use crate::error::{AreaTrackError, LastError};
use crate::sensor::{channel_service, ChannelService, SensorFeed};
use crate::session::Session;
use crate::store::AdfStore;
use crate::types::{
    CameraFrame, CameraView, CoordinateFrame, Feature, FramePair, ImuSample, Pose, SessionConfig,
    SessionFlags, TrackingStatus,
};
use std::ffi::{c_char, c_int, CStr};
use std::sync::Arc;

/// Last error message for C consumers.
static LAST_ERROR: LastError = LastError::new();

/// Opaque area-description store handle.
pub struct AtStore(Arc<AdfStore>);

/// Opaque session handle.
pub struct AtSession(Session);

/// Opaque in-process sensor service handle.
pub struct AtService {
    service: ChannelService,
    feed: SensorFeed,
}

/// Stored area description summary in C-compatible layout.
#[repr(C)]
pub struct AtAdfInfo {
    /// Null-terminated UUID string.
    pub uuid: [c_char; 64],
    /// Null-terminated name, empty if unnamed.
    pub name: [c_char; 128],
}

/// Null-terminated diagnostic text.
#[repr(C)]
pub struct AtText {
    pub text: [c_char; 256],
}

fn str_to_fixed<const N: usize>(s: &str) -> [c_char; N] {
    let mut buf = [0 as c_char; N];
    let bytes = s.as_bytes();
    let len = bytes.len().min(N - 1);
    for (i, &b) in bytes[..len].iter().enumerate() {
        buf[i] = b as c_char;
    }
    buf
}

/// # Safety
/// `s` must be a valid null-terminated string, or null.
unsafe fn c_str<'a>(s: *const c_char, what: &str) -> Result<&'a str, AreaTrackError> {
    if s.is_null() {
        return Err(AreaTrackError::InvalidArgument(format!("{} is null", what)));
    }
    CStr::from_ptr(s)
        .to_str()
        .map_err(|_| AreaTrackError::InvalidArgument(format!("{} is not UTF-8", what)))
}

fn fail(err: impl Into<AreaTrackError>) -> c_int {
    LAST_ERROR.set(&err.into());
    -1
}

/// Open (creating if needed) a store rooted at `path`.
/// Returns NULL on error (check at_last_error()).
///
/// # Safety
/// `path` must be a valid null-terminated string, or null.
#[no_mangle]
pub unsafe extern "C" fn at_store_open(path: *const c_char) -> *mut AtStore {
    let path = match c_str(path, "path") {
        Ok(p) => p,
        Err(e) => {
            LAST_ERROR.set(&e);
            return std::ptr::null_mut();
        }
    };
    match AdfStore::open(path) {
        Ok(store) => Box::into_raw(Box::new(AtStore(Arc::new(store)))),
        Err(e) => {
            LAST_ERROR.set(&e);
            std::ptr::null_mut()
        }
    }
}

/// Release a store handle. Sessions created from it keep the store alive.
///
/// # Safety
/// `store` must be a pointer returned by `at_store_open`, or null.
#[no_mangle]
pub unsafe extern "C" fn at_store_close(store: *mut AtStore) {
    if !store.is_null() {
        drop(Box::from_raw(store));
    }
}

/// Number of stored area descriptions, or -1 on error.
///
/// # Safety
/// `store` must be a valid store pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn at_adf_count(store: *const AtStore) -> c_int {
    if store.is_null() {
        return -1;
    }
    let store = &*store;
    store.0.list_all().len() as c_int
}

/// Write the uuid and name of the `index`-th record (uuid order) into `out`.
/// Returns 0 on success, -1 if out of range.
///
/// # Safety
/// `store` and `out` must be valid pointers, or null.
#[no_mangle]
pub unsafe extern "C" fn at_adf_uuid_at(
    store: *const AtStore,
    index: c_int,
    out: *mut AtAdfInfo,
) -> c_int {
    if store.is_null() || out.is_null() || index < 0 {
        return -1;
    }
    let store = &*store;
    match store.0.list_all().get(index as usize) {
        Some(summary) => {
            out.write(AtAdfInfo {
                uuid: str_to_fixed(&summary.uuid),
                name: str_to_fixed(summary.name.as_deref().unwrap_or("")),
            });
            0
        }
        None => fail(AreaTrackError::InvalidArgument(format!(
            "index {} out of range",
            index
        ))),
    }
}

/// Delete a stored area description. Returns 0 on success, -1 on error.
///
/// # Safety
/// `store` must be a valid store pointer and `uuid` a valid string, or null.
#[no_mangle]
pub unsafe extern "C" fn at_adf_delete(store: *const AtStore, uuid: *const c_char) -> c_int {
    if store.is_null() {
        return -1;
    }
    let store = &*store;
    let uuid = match c_str(uuid, "uuid") {
        Ok(u) => u,
        Err(e) => return fail(e),
    };
    match store.0.delete(uuid) {
        Ok(()) => 0,
        Err(e) => fail(e),
    }
}

/// Create a session on `store`, tuned from `AREATRACK_*` variables.
///
/// # Safety
/// `store` must be a valid store pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn at_session_new(store: *const AtStore) -> *mut AtSession {
    if store.is_null() {
        return std::ptr::null_mut();
    }
    let store = &*store;
    let session = Session::new(store.0.clone(), TrackerTuning::from_env());
    Box::into_raw(Box::new(AtSession(session)))
}

/// Disconnect (if needed) and free a session.
///
/// # Safety
/// `session` must be a pointer returned by `at_session_new`, or null.
#[no_mangle]
pub unsafe extern "C" fn at_session_free(session: *mut AtSession) {
    if !session.is_null() {
        drop(Box::from_raw(session));
    }
}

/// Create an in-process sensor service with a bounded queue.
#[no_mangle]
pub extern "C" fn at_channel_service_new(capacity: usize) -> *mut AtService {
    let (feed, service) = channel_service(capacity);
    Box::into_raw(Box::new(AtService { service, feed }))
}

/// Free a sensor service. Any session bound to it sees the stream end.
///
/// # Safety
/// `service` must be a pointer returned by `at_channel_service_new`, or null.
#[no_mangle]
pub unsafe extern "C" fn at_channel_service_free(service: *mut AtService) {
    if !service.is_null() {
        drop(Box::from_raw(service));
    }
}

/// Connect a session to a sensor service.
/// `flags`: bitwise OR of AREA_LEARNING (1), LOAD_ADF_ON_START (2), AUTO_RECOVERY (4).
/// `camera_view`: 0 = first person, 1 = third person, 2 = top down.
/// `adf_uuid`: record to load, or NULL for the most recent.
/// Returns 0 on success, -1 on error.
///
/// # Safety
/// `session` and `service` must be valid pointers; `adf_uuid` a valid string or null.
#[no_mangle]
pub unsafe extern "C" fn at_connect(
    session: *mut AtSession,
    service: *mut AtService,
    flags: u32,
    camera_view: c_int,
    adf_uuid: *const c_char,
) -> c_int {
    if session.is_null() || service.is_null() {
        return -1;
    }
    let session = &*session;
    // Only the platform half; `feed` may be in use by a pushing thread.
    let platform = &mut (*service).service;

    let mut config = SessionConfig::new(SessionFlags::from_bits_truncate(flags))
        .with_camera_view(CameraView::from_raw(camera_view).unwrap_or_default());
    if !adf_uuid.is_null() {
        match c_str(adf_uuid, "adf_uuid") {
            Ok(uuid) => config = config.with_adf(uuid),
            Err(e) => return fail(e),
        }
    }

    match session.0.connect(platform, config) {
        Ok(()) => {
            LAST_ERROR.clear();
            0
        }
        Err(e) => fail(e),
    }
}

/// Disconnect a session. Safe to call when not connected.
///
/// # Safety
/// `session` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn at_disconnect(session: *mut AtSession) {
    if !session.is_null() {
        (*session).0.disconnect();
    }
}

/// Push one IMU sample. Returns false if it was dropped.
///
/// # Safety
/// `service` and `sample` must be valid pointers, or null.
#[no_mangle]
pub unsafe extern "C" fn at_push_imu(service: *const AtService, sample: *const ImuSample) -> bool {
    if service.is_null() || sample.is_null() {
        return false;
    }
    (*service).feed.push_imu(*sample)
}

/// Push one camera frame's features. Returns false if it was dropped.
///
/// # Safety
/// `service` must be valid; `features` must point to `count` elements, or be null with `count == 0`.
#[no_mangle]
pub unsafe extern "C" fn at_push_frame(
    service: *const AtService,
    timestamp_us: u64,
    features: *const Feature,
    count: usize,
) -> bool {
    if service.is_null() || (features.is_null() && count > 0) {
        return false;
    }
    let features = if count == 0 {
        Vec::new()
    } else {
        std::slice::from_raw_parts(features, count).to_vec()
    };
    (*service).feed.push_frame(CameraFrame {
        timestamp_us,
        features,
    })
}

/// Latest tracking status; UNKNOWN for a null session.
///
/// # Safety
/// `session` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn at_status(session: *const AtSession) -> TrackingStatus {
    if session.is_null() {
        return TrackingStatus::Unknown;
    }
    (*session).0.current_status()
}

/// Latest pose of `target` in `base` (0 = start of service, 1 = area description, 2 = device).
/// Returns 0 on success, -1 if no such pose has been published.
///
/// # Safety
/// `session` and `out` must be valid pointers, or null.
#[no_mangle]
pub unsafe extern "C" fn at_pose(
    session: *const AtSession,
    base: c_int,
    target: c_int,
    out: *mut Pose,
) -> c_int {
    if session.is_null() || out.is_null() {
        return -1;
    }
    let (Some(base), Some(target)) = (CoordinateFrame::from_raw(base), CoordinateFrame::from_raw(target))
    else {
        return fail(AreaTrackError::InvalidArgument("unknown coordinate frame".into()));
    };
    match (*session).0.current_pose(FramePair { base, target }) {
        Some(pose) => {
            out.write(pose);
            0
        }
        None => -1,
    }
}

/// Whether the session has relocalized since connecting.
///
/// # Safety
/// `session` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn at_is_relocalized(session: *const AtSession) -> bool {
    if session.is_null() {
        return false;
    }
    (*session).0.is_relocalized()
}

/// Select the camera view. Returns -1 for an unknown view.
///
/// # Safety
/// `session` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn at_set_camera_view(session: *const AtSession, view: c_int) -> c_int {
    if session.is_null() {
        return -1;
    }
    match CameraView::from_raw(view) {
        Some(v) => {
            (*session).0.set_camera_view(v);
            0
        }
        None => fail(AreaTrackError::InvalidArgument(format!("camera view {}", view))),
    }
}

/// Save the current map under `name`, blocking the calling thread until done.
/// Tracking continues meanwhile. On success the new record is written to `out`.
/// Returns 0 on success, -1 on error.
///
/// # Safety
/// `session` and `out` must be valid pointers; `name` a valid string.
#[no_mangle]
pub unsafe extern "C" fn at_save_adf(
    session: *const AtSession,
    name: *const c_char,
    out: *mut AtAdfInfo,
) -> c_int {
    if session.is_null() {
        return -1;
    }
    let name = match c_str(name, "name") {
        Ok(n) => n,
        Err(e) => return fail(e),
    };
    match (*session).0.save_adf(name) {
        Ok(record) => {
            if !out.is_null() {
                out.write(AtAdfInfo {
                    uuid: str_to_fixed(&record.uuid),
                    name: str_to_fixed(name),
                });
            }
            0
        }
        Err(e) => fail(e),
    }
}

/// Newest diagnostic event as `"key: value"`. Returns 0 if written, 1 if none.
///
/// # Safety
/// `session` and `out` must be valid pointers, or null.
#[no_mangle]
pub unsafe extern "C" fn at_event_string(session: *const AtSession, out: *mut AtText) -> c_int {
    if session.is_null() || out.is_null() {
        return -1;
    }
    match (*session).0.events().latest_string() {
        Some(s) => {
            out.write(AtText {
                text: str_to_fixed(&s),
            });
            0
        }
        None => 1,
    }
}

/// Pose delivery stats for a frame pair, e.g. `"status: VALID, count: 42, delta time (ms): 33.333"`.
/// Returns 0 if written, 1 if nothing was delivered yet.
///
/// # Safety
/// `session` and `out` must be valid pointers, or null.
#[no_mangle]
pub unsafe extern "C" fn at_pose_string(
    session: *const AtSession,
    base: c_int,
    target: c_int,
    out: *mut AtText,
) -> c_int {
    if session.is_null() || out.is_null() {
        return -1;
    }
    let (Some(base), Some(target)) = (CoordinateFrame::from_raw(base), CoordinateFrame::from_raw(target))
    else {
        return fail(AreaTrackError::InvalidArgument("unknown coordinate frame".into()));
    };
    match (*session).0.pose_report(FramePair { base, target }) {
        Some(report) => {
            out.write(AtText {
                text: str_to_fixed(&report.to_string()),
            });
            0
        }
        None => 1,
    }
}

/// Get the last error message. Returns NULL if no error.
/// The returned pointer is owned by the calling thread and stays valid until
/// that thread calls `at_last_error` again.
#[no_mangle]
pub extern "C" fn at_last_error() -> *const c_char {
    LAST_ERROR.as_ptr()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SESSION_TEST_LOCK;
    use std::ffi::CString;

    fn fixed_to_string(buf: &[c_char]) -> String {
        let end = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
        buf[..end].iter().map(|&c| c as u8 as char).collect()
    }

    #[test]
    fn test_store_handles() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = CString::new(temp.path().to_str().unwrap()).unwrap();
        unsafe {
            let store = at_store_open(path.as_ptr());
            assert!(!store.is_null());
            assert_eq!(at_adf_count(store), 0);

            let record = (*store).0.persist(b"x").unwrap();
            (*store).0.set_metadata(&record.uuid, "name", "Lab").unwrap();
            assert_eq!(at_adf_count(store), 1);

            let mut info = std::mem::zeroed::<AtAdfInfo>();
            assert_eq!(at_adf_uuid_at(store, 0, &mut info), 0);
            assert_eq!(fixed_to_string(&info.uuid), record.uuid);
            assert_eq!(fixed_to_string(&info.name), "Lab");
            assert_eq!(at_adf_uuid_at(store, 1, &mut info), -1);

            let uuid = CString::new(record.uuid.clone()).unwrap();
            assert_eq!(at_adf_delete(store, uuid.as_ptr()), 0);
            assert_eq!(at_adf_delete(store, uuid.as_ptr()), -1);
            assert_eq!(at_adf_count(store), 0);

            at_store_close(store);
        }
    }

    #[test]
    fn test_session_handles_without_data() {
        let _serial = SESSION_TEST_LOCK.lock();
        let temp = tempfile::TempDir::new().unwrap();
        let path = CString::new(temp.path().to_str().unwrap()).unwrap();
        unsafe {
            let store = at_store_open(path.as_ptr());
            let session = at_session_new(store);
            let service = at_channel_service_new(64);

            assert_eq!(at_connect(session, service, 1, 0, std::ptr::null()), 0);
            assert_eq!(at_set_camera_view(session, 9), -1);
            assert_eq!(at_set_camera_view(session, 2), 0);
            assert!(!at_is_relocalized(session));

            let mut pose = std::mem::zeroed::<Pose>();
            assert_eq!(at_pose(session, 0, 2, &mut pose), -1);

            let name = CString::new("room").unwrap();
            assert_eq!(at_save_adf(session, name.as_ptr(), std::ptr::null_mut()), -1);
            let msg = CStr::from_ptr(at_last_error()).to_str().unwrap();
            assert!(msg.contains("relocalized"));

            at_disconnect(session);
            assert_eq!(at_status(session), TrackingStatus::Unknown);
            at_session_free(session);
            at_channel_service_free(service);
            at_store_close(store);
        }
    }

    #[test]
    fn test_push_while_connecting() {
        let _serial = SESSION_TEST_LOCK.lock();
        let temp = tempfile::TempDir::new().unwrap();
        let path = CString::new(temp.path().to_str().unwrap()).unwrap();
        unsafe {
            let store = at_store_open(path.as_ptr());
            let session = at_session_new(store);
            let service = at_channel_service_new(64);

            let running = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true));
            let pusher = {
                let running = running.clone();
                let addr = service as usize;
                std::thread::spawn(move || {
                    let service = addr as *const AtService;
                    let mut ts = 1;
                    while running.load(std::sync::atomic::Ordering::SeqCst) {
                        let sample = ImuSample {
                            timestamp_us: ts,
                            accelerometer: [0.0, 0.0, 9.81],
                            gyroscope: [0.0; 3],
                        };
                        at_push_imu(service, &sample);
                        ts += 1_000;
                        std::thread::sleep(std::time::Duration::from_millis(1));
                    }
                })
            };

            for _ in 0..3 {
                assert_eq!(at_connect(session, service, 1, 0, std::ptr::null()), 0);
                at_disconnect(session);
            }
            running.store(false, std::sync::atomic::Ordering::SeqCst);
            pusher.join().unwrap();

            at_session_free(session);
            at_channel_service_free(service);
            at_store_close(store);
        }
    }
}
