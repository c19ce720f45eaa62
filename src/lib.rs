//! # areatrack - device pose tracking and area-description sessions
//!
//! Provides:
//! - A visual-inertial pose estimator fed by a camera/IMU sensor stream
//! - Relocalization against saved area descriptions (ADFs)
//! - A persistent ADF store with metadata, export and import
//! - A session controller that publishes pose/status snapshots for cheap polling
//! - C FFI for integration with native hosts
//!
//! ## Quick Start
//! ```no_run
//! use areatrack::{channel_service, AdfStore, FramePair, Session, SessionConfig, SessionFlags, TrackerTuning};
//! use std::sync::Arc;
//!
//! let store = Arc::new(AdfStore::open("/tmp/adf").unwrap());
//! let session = Session::new(store, TrackerTuning::from_env());
//!
//! let (feed, mut service) = channel_service(256);
//! session
//!     .connect(&mut service, SessionConfig::new(SessionFlags::AREA_LEARNING))
//!     .unwrap();
//!
//! // ... push camera frames and IMU samples through `feed` ...
//! # drop(feed);
//! println!("status: {}", session.current_status());
//! if let Some(pose) = session.current_pose(FramePair::SOS_DEVICE) {
//!     println!("pos: {:?}", pose.translation);
//! }
//! if session.is_relocalized() {
//!     let record = session.save_adf("kitchen").unwrap();
//!     println!("saved {}", record.uuid);
//! }
//! session.disconnect();
//! ```

pub mod error;
pub mod types;
pub mod config;
pub mod geometry;
pub mod sensor;
pub mod estimator;
pub mod area_map;
pub mod reloc;
pub mod store;
pub mod archive;
pub mod events;
pub mod session;
pub mod ffi;

pub use area_map::AreaMap;
pub use config::TrackerTuning;
pub use error::{
    AreaTrackError, ArchiveError, ConnectError, DeleteError, MapDecodeError, PersistenceError,
    SaveError, ServiceError, StoreError,
};
pub use events::EventLog;
pub use sensor::{channel_service, ChannelService, PlatformService, SensorFeed, SensorPacket, SensorStream};
pub use session::{PendingSave, Session, SessionState};
pub use store::AdfStore;
pub use types::*;

/// Result type alias for areatrack operations.
pub type Result<T> = std::result::Result<T, AreaTrackError>;
