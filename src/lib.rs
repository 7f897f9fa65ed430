/// WordStream Sync - store-and-forward sync layer for the WordStream extension
/// Built with Rust + WASM

pub mod broadcast;
pub mod config;
pub mod context;
pub mod delivery;
pub mod error;
pub mod memory;
pub mod message;
mod operations;
pub mod pending;
pub mod queue;
pub mod readiness;
pub mod storage;
pub mod transport;

#[cfg(target_arch = "wasm32")]
mod bindings;
#[cfg(target_arch = "wasm32")]
pub mod chrome;

use wasm_bindgen::prelude::*;

pub use broadcast::{BroadcastReport, Broadcaster};
pub use config::{RetryPolicy, SyncConfig};
pub use context::{Ports, SyncContext, WriteOutcome};
pub use error::{SyncError, SyncResult};
pub use message::{BroadcastMessage, Handshake, Timestamp};
pub use pending::{OperationKind, PendingOperation};
pub use queue::{FnHandler, OfflineQueue, OperationHandler, ReplayReport};
pub use readiness::{ReadinessTracker, ReadyTarget};
pub use transport::{DeliveryOutcome, Subscription, TabId};

#[cfg(target_arch = "wasm32")]
pub use bindings::WordStreamSync;

// Set up panic hook for better error messages in the browser console
#[wasm_bindgen(start)]
pub fn main() {
    console_error_panic_hook::set_once();
    wasm_logger::init(wasm_logger::Config::default());
}
