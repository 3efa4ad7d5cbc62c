//! Escrow lifecycle: deposit validation, the background engine and the
//! public create/get/list operations

mod engine;
mod service;
mod validator;

pub use engine::LifecycleEngine;
pub use service::{AccessToken, CreateEscrow, CreatedEscrow, EscrowService, EscrowStats};
