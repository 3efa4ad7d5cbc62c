//! Escrow transaction record and its status machine

use crate::error::{EscrowError, EscrowResult};

use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of an escrow record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Pending,
    Verified,
    ForwardingPending,
    Complete,
    Failed,
    ForwardFailed,
}

impl EscrowStatus {
    pub const ALL: [EscrowStatus; 6] = [
        EscrowStatus::Pending,
        EscrowStatus::Verified,
        EscrowStatus::ForwardingPending,
        EscrowStatus::Complete,
        EscrowStatus::Failed,
        EscrowStatus::ForwardFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowStatus::Pending => "pending",
            EscrowStatus::Verified => "verified",
            EscrowStatus::ForwardingPending => "forwarding_pending",
            EscrowStatus::Complete => "complete",
            EscrowStatus::Failed => "failed",
            EscrowStatus::ForwardFailed => "forward_failed",
        }
    }

    /// No further automatic transition happens from a terminal status,
    /// only deletion by the cleanup sweep
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EscrowStatus::Complete | EscrowStatus::Failed | EscrowStatus::ForwardFailed
        )
    }

    /// Legal edges of the lifecycle
    pub fn can_transition_to(&self, next: EscrowStatus) -> bool {
        use EscrowStatus::*;
        matches!(
            (self, next),
            (Pending, Verified)
                | (Pending, Failed)
                | (Verified, ForwardingPending)
                | (Verified, ForwardFailed)
                | (ForwardingPending, Complete)
                | (ForwardingPending, Failed)
        )
    }
}

impl fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single escrow relay: one inbound deposit and at most one outbound forward
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowRecord {
    /// Hash of the inbound deposit transaction
    pub id: String,
    #[serde(with = "checksum_address")]
    pub sender: Address,
    #[serde(with = "checksum_address")]
    pub destination: Address,
    #[serde(with = "decimal_u256")]
    pub deposit_wei: U256,
    #[serde(with = "decimal_u256")]
    pub recipient_amount_wei: U256,
    #[serde(with = "decimal_u256")]
    pub gas_buffer_wei: U256,
    #[serde(with = "decimal_u256")]
    pub fee_wei: U256,
    #[serde(default, with = "decimal_u256::option")]
    pub forwarded_amount_wei: Option<U256>,
    pub status: EscrowStatus,
    #[serde(default)]
    pub forward_tx_hash: Option<H256>,
    #[serde(default)]
    pub forward_raw_tx: Option<Bytes>,
    #[serde(default)]
    pub forward_nonce: Option<u64>,
    #[serde(default)]
    pub escrow_block: Option<u64>,
    #[serde(default)]
    pub forward_block: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub verified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub forwarded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
    pub client_token: String,
}

impl EscrowRecord {
    /// Deposit transaction hash as a typed value
    pub fn escrow_tx_hash(&self) -> EscrowResult<H256> {
        self.id
            .parse::<H256>()
            .map_err(|_| EscrowError::InvalidTxHash(self.id.clone()))
    }

    fn transition(&mut self, next: EscrowStatus) -> EscrowResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(EscrowError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_verified(&mut self, block_number: u64, now: DateTime<Utc>) -> EscrowResult<()> {
        self.transition(EscrowStatus::Verified)?;
        self.escrow_block = Some(block_number);
        self.verified_at = Some(now);
        Ok(())
    }

    /// Record the signed outbound transfer before it is broadcast
    pub fn journal_forward(
        &mut self,
        tx_hash: H256,
        raw_tx: Bytes,
        nonce: u64,
        forward_amount: U256,
        fee: U256,
    ) -> EscrowResult<()> {
        if let Some(existing) = self.forward_tx_hash {
            return Err(EscrowError::AlreadyForwarded {
                id: self.id.clone(),
                forward_tx_hash: format!("{:?}", existing),
            });
        }
        self.forward_tx_hash = Some(tx_hash);
        self.forward_raw_tx = Some(raw_tx);
        self.forward_nonce = Some(nonce);
        self.forwarded_amount_wei = Some(forward_amount);
        self.fee_wei = fee;
        Ok(())
    }

    pub fn mark_forwarding(&mut self, now: DateTime<Utc>) -> EscrowResult<()> {
        if self.forward_tx_hash.is_none() {
            return Err(EscrowError::Internal(format!(
                "transaction {} has no journaled forward",
                self.id
            )));
        }
        self.transition(EscrowStatus::ForwardingPending)?;
        self.forwarded_at = Some(now);
        Ok(())
    }

    pub fn mark_complete(&mut self, block_number: u64, now: DateTime<Utc>) -> EscrowResult<()> {
        self.transition(EscrowStatus::Complete)?;
        self.forward_block = Some(block_number);
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> EscrowResult<()> {
        self.transition(EscrowStatus::Failed)?;
        self.error = Some(reason.into());
        self.failed_at = Some(now);
        Ok(())
    }

    pub fn mark_forward_failed(
        &mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> EscrowResult<()> {
        self.transition(EscrowStatus::ForwardFailed)?;
        self.error = Some(reason.into());
        self.failed_at = Some(now);
        Ok(())
    }

    /// Timestamp the retention window of a terminal record counts from
    pub fn terminal_since(&self) -> Option<DateTime<Utc>> {
        match self.status {
            EscrowStatus::Complete => Some(self.completed_at.unwrap_or(self.created_at)),
            EscrowStatus::Failed | EscrowStatus::ForwardFailed => {
                Some(self.failed_at.unwrap_or(self.created_at))
            }
            _ => None,
        }
    }
}

/// EIP-55 checksum form on the wire, any case accepted on read
mod checksum_address {
    use ethers::types::Address;
    use ethers::utils::to_checksum;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(address: &Address, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&to_checksum(address, None))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Address, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse::<Address>().map_err(serde::de::Error::custom)
    }
}

/// Wei amounts as decimal strings; JSON numbers cannot hold a U256
mod decimal_u256 {
    use ethers::types::U256;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<U256, D::Error> {
        let raw = String::deserialize(d)?;
        U256::from_dec_str(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use ethers::types::U256;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(value: &Option<U256>, s: S) -> Result<S::Ok, S::Error> {
            match value {
                Some(v) => s.serialize_some(&v.to_string()),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<U256>, D::Error> {
            Option::<String>::deserialize(d)?
                .map(|raw| U256::from_dec_str(&raw).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
