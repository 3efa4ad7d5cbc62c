//! Outbound transfer module: fee planning, nonce management and broadcast

mod nonce;
mod planner;
mod sender;

pub use planner::ForwardPlanner;
pub use sender::{load_wallet, ForwardError, ForwardResult, Forwarder};
