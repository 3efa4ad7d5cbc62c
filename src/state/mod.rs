//! Escrow record state with JSON-file persistence
//!
//! Handles:
//! - The escrow record and its status machine
//! - Durable, lock-guarded storage loaded at startup

mod record;
mod store;

pub use record::{EscrowRecord, EscrowStatus};
pub use store::LedgerStore;
