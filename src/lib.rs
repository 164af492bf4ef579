//! Lynk&Co Sync Library
//!
//! Periodic synchronization with the Lynk&Co telematics cloud: session
//! handling, vehicle discovery, status polling and remote commands.

pub mod auth;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod logging;
pub mod registry;
pub mod sync;
pub mod telemetry;

pub use auth::{Credentials, Session, UserId};
pub use commands::{CommandError, CommandKind, CommandRequest, FlashMode};
pub use config::SyncConfig;
pub use coordinator::{Coordinator, ObserverId, RefreshOutcome, SetupError, SyncState};
pub use registry::Vehicle;
pub use sync::{ApiClient, ApiError, TelematicsApi};
pub use telemetry::{Snapshot, StatusSummary, VehicleStatus};
