//! Media subsystem of a networked audio appliance.
//!
//! Streams tracks from the server into a VS1053b decoder, streams microphone
//! audio back, and keeps both pipelines in line with the remotely polled
//! device profile.

pub mod audio;
pub mod config;
pub mod error;
pub mod hal;
pub mod net_link;
pub mod pipeline;
pub mod profile;
pub mod reconciler;
pub mod track_id;

pub use config::Config;
pub use error::{BusError, MicError, NetError, ProfileError};
pub use profile::DeviceProfileSnapshot;
pub use reconciler::ProfileReconciler;
pub use track_id::TrackId;
