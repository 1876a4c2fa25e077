pub mod api_client;
pub mod chunker;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod credentials;
pub mod crypto;
pub mod decision;
pub mod error;
pub mod events;
pub mod ignore;
pub mod logging;
pub mod pathsafety;
pub mod remote_listener;
pub mod retry;
pub mod state;
pub mod tracker;
pub mod transfers;
pub mod watcher;
pub mod workers;

pub use coordinator::{Coordinator, CoordinatorHandle, CoordinatorState};
pub use error::SyncError;
