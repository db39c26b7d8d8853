//! Transfer engine - the moving parts below the `TransferCore` facade
//!
//! - Token-bucket bandwidth governor shared by every stream
//! - Per-transfer state machine with observer events
//! - Multi-source swarm downloads over a shared chunk pool
//! - Block reuse through rolling checksums
//! - Crash-safe partial files (SQLite bookkeeping)

mod chunks;
mod delta;
mod governor;
mod partial;
mod persistence;
mod source_worker;
mod swarm;
mod throttle;
mod transfer;
mod upload;

pub use chunks::*;
pub use delta::*;
pub use governor::*;
pub use partial::*;
pub use persistence::*;
pub use source_worker::*;
pub use swarm::*;
pub use throttle::*;
pub use transfer::*;
pub use upload::*;
