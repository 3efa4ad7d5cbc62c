//! Fee and forward-amount planning for outbound transfers
//!
//! Every value used for money movement is derived here from the record's
//! deposit and the live gas price. Client-supplied fee figures are ignored
//! and the requested payout is only an upper bound.

use crate::state::EscrowRecord;

use ethers::types::U256;
use std::fmt;
use tracing::debug;

/// Gas limit of a plain value transfer
pub const FORWARD_GAS_LIMIT: u64 = 21_000;

const BASIS_POINTS: u64 = 10_000;

/// Amounts for one outbound transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardPlan {
    pub forward_amount: U256,
    pub fee_amount: U256,
    pub gas_price: U256,
    pub gas_limit: U256,
    pub gas_cost: U256,
}

/// Why a record cannot be forwarded; all of these are terminal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanRejection {
    InsufficientGasBuffer { gas_cost: U256, gas_buffer: U256 },
    NothingToForward,
}

impl fmt::Display for PlanRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanRejection::InsufficientGasBuffer { .. } => f.write_str("insufficient gas buffer"),
            PlanRejection::NothingToForward => f.write_str("nothing to forward"),
        }
    }
}

/// Computes the platform fee and the forwardable amount
#[derive(Debug, Clone, Copy)]
pub struct ForwardPlanner {
    fee_basis_points: u32,
}

impl ForwardPlanner {
    pub fn new(fee_basis_points: u32) -> Self {
        Self {
            fee_basis_points: fee_basis_points.min(BASIS_POINTS as u32),
        }
    }

    /// `floor(deposit * fee_bps / 10_000)`
    ///
    /// Split as `q * bps + floor(r * bps / 10_000)` so the product never
    /// overflows for any deposit.
    pub fn fee_for(&self, deposit: U256) -> U256 {
        let bps = U256::from(self.fee_basis_points);
        let scale = U256::from(BASIS_POINTS);
        (deposit / scale) * bps + (deposit % scale) * bps / scale
    }

    /// Gas cost of the forward at `gas_price`
    pub fn calculate_cost(gas_price: U256) -> U256 {
        U256::from(FORWARD_GAS_LIMIT).saturating_mul(gas_price)
    }

    pub fn plan(&self, record: &EscrowRecord, gas_price: U256) -> Result<ForwardPlan, PlanRejection> {
        let fee_amount = self.fee_for(record.deposit_wei);
        let max_forward = record
            .deposit_wei
            .saturating_sub(fee_amount)
            .saturating_sub(record.gas_buffer_wei);
        let forward_amount = record.recipient_amount_wei.min(max_forward);

        let gas_cost = Self::calculate_cost(gas_price);
        if gas_cost > record.gas_buffer_wei {
            return Err(PlanRejection::InsufficientGasBuffer {
                gas_cost,
                gas_buffer: record.gas_buffer_wei,
            });
        }

        if forward_amount.is_zero() {
            return Err(PlanRejection::NothingToForward);
        }

        debug!(
            "Plan for {}: forward {} fee {} gas {} (max {})",
            record.id, forward_amount, fee_amount, gas_cost, max_forward
        );

        Ok(ForwardPlan {
            forward_amount,
            fee_amount,
            gas_price,
            gas_limit: U256::from(FORWARD_GAS_LIMIT),
            gas_cost,
        })
    }
}
