//! edgeval Validator Library
//!
//! Deploys the edge engine on a remote device, drives it through its
//! lifecycle on the control plane, and cleans up afterwards.
//!
//! ## Architecture
//!
//! ```text
//! ValidationRun
//! ├── LifecycleDriver      (polls the control plane, guaranteed teardown)
//! └── Backend              (single-host compose project | cluster helm release)
//!     ├── RemoteHost       (one SSH session per operation)
//!     └── CertificateWatcher (cluster only, background task)
//! ```
//!
//! ## Modules
//!
//! - `device`: remote command execution and file transfer
//! - `backend`: engine install, stop, purge and log collection per backend
//! - `certificate`: bootstrap certificate approval for cluster installs
//! - `client`: control-plane API client
//! - `driver`: lifecycle waits and validation runs

pub mod backend;
pub mod certificate;
pub mod client;
pub mod config;
pub mod device;
pub mod driver;
pub mod validations;

// Re-export commonly used types
pub use backend::{Backend, BackendError, BackendOptions, EngineConfiguration, LogCollection};
pub use certificate::{CertificateWatcher, WatcherConfig, WatcherHandle, WatcherStatus};
pub use client::{ControlPlane, ControlPlaneError, NuvlaClient, Resource};
pub use config::{BackendKind, DeviceConfig, RunConfig};
pub use device::{CommandResult, MockTransport, RemoteError, RemoteHost};
pub use driver::{DriverConfig, DriverError, LifecycleDriver, LifecycleState, RunStatus, ValidationRun};
