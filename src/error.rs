use crate::types::ServiceVersion;
use std::cell::RefCell;
use std::ffi::CString;
use std::fmt;
use std::path::PathBuf;

/// Errors reported by a platform sensor service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("Sensor service unavailable: {0}")]
    Unavailable(String),

    #[error("Sensor stream disconnected")]
    Disconnected,
}

/// Errors returned by [`Session::connect`](crate::Session::connect).
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("A tracking session is already active in this process")]
    AlreadyConnected,

    #[error("Platform service version {found} is older than required {required}")]
    VersionMismatch {
        found: ServiceVersion,
        required: ServiceVersion,
    },

    #[error("Platform service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Failed to spawn session thread: {0}")]
    ThreadSpawn(String),

    #[error("Failed to load area description: {0}")]
    AdfLoad(#[from] StoreError),

    #[error("Area description payload unreadable: {0}")]
    AdfDecode(#[from] MapDecodeError),
}

impl From<ServiceError> for ConnectError {
    fn from(e: ServiceError) -> Self {
        ConnectError::ServiceUnavailable(e.to_string())
    }
}

/// Errors returned by the save-ADF workflow.
#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    #[error("No tracking session is connected")]
    NotConnected,

    #[error("Area learning is not enabled for this session")]
    LearningDisabled,

    #[error("Session has not relocalized; nothing anchored to save")]
    NotRelocalized,

    #[error("Another save is already in progress")]
    SaveInProgress,

    #[error("Failed to persist area description: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Failed to write area description metadata: {0}")]
    Metadata(#[from] StoreError),

    #[error("Save cancelled")]
    Cancelled,
}

/// Failure writing a new record into the store. Prior store state is unchanged.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode record: {0}")]
    Encode(String),
}

/// Errors from reading or mutating existing store records.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Area description {0} not found")]
    NotFound(String),

    #[error("Invalid area description uuid: {0:?}")]
    InvalidUuid(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt metadata for {uuid}: {reason}")]
    CorruptMetadata { uuid: String, reason: String },
}

/// Delete only ever reports `NotFound` or `Io`.
pub type DeleteError = StoreError;

/// Errors from decoding an area map payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapDecodeError {
    #[error("Not an area map payload (bad magic)")]
    BadMagic,

    #[error("Unsupported area map version {0}")]
    UnsupportedVersion(u16),

    #[error("Area map payload truncated")]
    Truncated,

    #[error("Area map body malformed: {0}")]
    Decode(String),
}

/// Errors from reading or writing export archives.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Not an area description archive (bad magic)")]
    BadMagic,

    #[error("Unsupported archive version {0}")]
    UnsupportedVersion(u16),

    #[error("Archive truncated")]
    Truncated,

    #[error("Archive checksum mismatch")]
    ChecksumMismatch,

    #[error("Archive metadata malformed: {0}")]
    Metadata(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Umbrella error for the crate-level [`Result`](crate::Result) alias.
#[derive(Debug, thiserror::Error)]
pub enum AreaTrackError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Save(#[from] SaveError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Thread-safe last-error storage for the C FFI layer.
pub(crate) struct LastError {
    message: parking_lot::Mutex<String>,
}

thread_local! {
    /// Per-thread copy handed out by [`LastError::as_ptr`].
    static LAST_ERROR_COPY: RefCell<Option<CString>> = const { RefCell::new(None) };
}

impl LastError {
    pub const fn new() -> Self {
        Self {
            message: parking_lot::const_mutex(String::new()),
        }
    }

    pub fn set(&self, err: &dyn fmt::Display) {
        *self.message.lock() = err.to_string();
    }

    pub fn clear(&self) {
        self.message.lock().clear();
    }

    /// Pointer to a copy owned by the calling thread; valid until this
    /// thread calls `as_ptr` again. A `set` elsewhere never frees it.
    pub fn as_ptr(&self) -> *const std::ffi::c_char {
        let copy = {
            let msg = self.message.lock();
            if msg.is_empty() {
                None
            } else {
                Some(CString::new(msg.replace('\0', " ")).unwrap_or_default())
            }
        };
        LAST_ERROR_COPY.with(|slot| {
            let mut slot = slot.borrow_mut();
            *slot = copy;
            slot.as_ref().map_or(std::ptr::null(), |c| c.as_ptr())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_error_maps_to_unavailable() {
        let err: ConnectError = ServiceError::Unavailable("no camera".into()).into();
        assert!(matches!(err, ConnectError::ServiceUnavailable(ref m) if m.contains("no camera")));
    }

    #[test]
    fn test_last_error_is_nul_terminated() {
        let slot = LastError::new();
        assert!(slot.as_ptr().is_null());
        slot.set(&SaveError::NotRelocalized);
        let msg = unsafe { std::ffi::CStr::from_ptr(slot.as_ptr()) };
        assert!(msg.to_str().unwrap().contains("relocalized"));
        slot.clear();
        assert!(slot.as_ptr().is_null());
    }

    #[test]
    fn test_last_error_pointer_survives_other_threads() {
        static SLOT: LastError = LastError::new();
        SLOT.set(&SaveError::NotRelocalized);
        let ptr = SLOT.as_ptr();

        std::thread::spawn(|| {
            for _ in 0..100 {
                SLOT.set(&SaveError::SaveInProgress);
                SLOT.clear();
            }
        })
        .join()
        .unwrap();

        let msg = unsafe { std::ffi::CStr::from_ptr(ptr) };
        assert!(msg.to_str().unwrap().contains("relocalized"));
    }
}
