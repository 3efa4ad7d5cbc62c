//! Public operations over the ledger: create, get, list and stats
//!
//! Transport-agnostic. The HTTP layer only maps requests and errors.

use crate::error::{EscrowError, EscrowResult};
use crate::metrics;
use crate::state::{EscrowRecord, EscrowStatus, LedgerStore};
use crate::tx::ForwardPlanner;

use chrono::Utc;
use ethers::types::{Address, U256};
use ethers::utils::to_checksum;
use lazy_static::lazy_static;
use rand::{rngs::OsRng, RngCore};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::info;

lazy_static! {
    static ref ADDRESS: Regex = Regex::new(r"^0x[0-9a-fA-F]{40}$").unwrap();
    static ref TX_HASH: Regex = Regex::new(r"^0x[0-9a-fA-F]{64}$").unwrap();
}

/// Creation request; every field is required
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateEscrow {
    #[serde(default)]
    pub escrow_tx_hash: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    /// Decimal wei string
    #[serde(default)]
    pub deposit_wei: Option<String>,
    #[serde(default)]
    pub recipient_amount_wei: Option<String>,
    #[serde(default)]
    pub gas_buffer_wei: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedEscrow {
    pub id: String,
    pub client_token: String,
}

/// Credentials presented with a read
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessToken<'a> {
    pub client_token: Option<&'a str>,
    pub admin_token: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EscrowStats {
    pub total: u64,
    pub by_status: BTreeMap<&'static str, u64>,
}

pub struct EscrowService {
    ledger: Arc<LedgerStore>,
    planner: ForwardPlanner,
    admin_token: Option<String>,
}

impl EscrowService {
    pub fn new(ledger: Arc<LedgerStore>, fee_basis_points: u32, admin_token: Option<String>) -> Self {
        Self {
            ledger,
            planner: ForwardPlanner::new(fee_basis_points),
            admin_token: admin_token.filter(|t| !t.trim().is_empty()),
        }
    }

    /// Register a deposit the client has sent (or is about to send)
    pub async fn create(&self, request: CreateEscrow) -> EscrowResult<CreatedEscrow> {
        let id = required("escrow_tx_hash", &request.escrow_tx_hash)?;
        let sender = required("sender", &request.sender)?;
        let destination = required("destination", &request.destination)?;
        let deposit = required("deposit_wei", &request.deposit_wei)?;
        let recipient_amount = required("recipient_amount_wei", &request.recipient_amount_wei)?;
        let gas_buffer = required("gas_buffer_wei", &request.gas_buffer_wei)?;

        if !TX_HASH.is_match(id) {
            return Err(EscrowError::InvalidTxHash(id.to_string()));
        }
        let id = id.to_lowercase();
        let sender = parse_address("sender", sender)?;
        let destination = parse_address("destination", destination)?;

        let deposit_wei = parse_wei("deposit_wei", deposit)?;
        let recipient_amount_wei = parse_wei("recipient_amount_wei", recipient_amount)?;
        let gas_buffer_wei = parse_wei("gas_buffer_wei", gas_buffer)?;

        if deposit_wei.is_zero() {
            return Err(EscrowError::InvalidAmount("deposit_wei must be positive".to_string()));
        }
        if recipient_amount_wei.is_zero() {
            return Err(EscrowError::InvalidAmount(
                "recipient_amount_wei must be positive".to_string(),
            ));
        }
        let fee_wei = self.planner.fee_for(deposit_wei);
        if fee_wei.saturating_add(gas_buffer_wei) >= deposit_wei {
            return Err(EscrowError::InvalidAmount(
                "fee and gas buffer leave nothing to forward".to_string(),
            ));
        }

        let client_token = generate_token();
        let record = EscrowRecord {
            id: id.clone(),
            sender,
            destination,
            deposit_wei,
            recipient_amount_wei,
            gas_buffer_wei,
            fee_wei,
            forwarded_amount_wei: None,
            status: EscrowStatus::Pending,
            forward_tx_hash: None,
            forward_raw_tx: None,
            forward_nonce: None,
            escrow_block: None,
            forward_block: None,
            error: None,
            created_at: Utc::now(),
            verified_at: None,
            forwarded_at: None,
            completed_at: None,
            failed_at: None,
            client_token: client_token.clone(),
        };

        self.ledger.insert(record).await?;
        metrics::record_created();
        info!(
            "Created transaction {} ({} wei, {:?} -> {:?})",
            id, deposit_wei, sender, destination
        );

        Ok(CreatedEscrow { id, client_token })
    }

    /// Read one record; unknown ids are reported before access is checked
    pub async fn get(&self, id: &str, access: AccessToken<'_>) -> EscrowResult<EscrowRecord> {
        let id = id.trim().to_lowercase();
        let record = self
            .ledger
            .get(&id)
            .await
            .ok_or_else(|| EscrowError::NotFound { id: id.clone() })?;

        let client_ok = access
            .client_token
            .is_some_and(|token| constant_time_token_eq(token, &record.client_token));
        if client_ok || self.is_admin(access.admin_token) {
            Ok(record)
        } else {
            Err(EscrowError::Forbidden)
        }
    }

    /// All records, oldest first; administrators only
    pub async fn list(&self, admin_token: Option<&str>) -> EscrowResult<Vec<EscrowRecord>> {
        if !self.is_admin(admin_token) {
            return Err(EscrowError::Forbidden);
        }
        Ok(self.ledger.list().await)
    }

    pub async fn stats(&self, admin_token: Option<&str>) -> EscrowResult<EscrowStats> {
        if !self.is_admin(admin_token) {
            return Err(EscrowError::Forbidden);
        }

        let counts = self.ledger.count_by_status().await;
        let by_status: BTreeMap<&'static str, u64> =
            counts.iter().map(|(status, n)| (status.as_str(), *n)).collect();
        Ok(EscrowStats {
            total: by_status.values().sum(),
            by_status,
        })
    }

    /// Fails closed when no admin token is configured
    fn is_admin(&self, supplied: Option<&str>) -> bool {
        match (self.admin_token.as_deref(), supplied) {
            (Some(expected), Some(given)) if !given.is_empty() => {
                constant_time_token_eq(given, expected)
            }
            _ => false,
        }
    }
}

fn required<'a>(field: &'static str, value: &'a Option<String>) -> EscrowResult<&'a str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(EscrowError::MissingField(field))
}

fn parse_address(field: &'static str, value: &str) -> EscrowResult<Address> {
    let invalid = || EscrowError::InvalidAddress {
        field,
        value: value.to_string(),
    };
    if !ADDRESS.is_match(value) {
        return Err(invalid());
    }
    let address = value.parse::<Address>().map_err(|_| invalid())?;

    // Mixed case carries an EIP-55 checksum and must match it
    let digits = &value[2..];
    let mixed_case = digits.chars().any(|c| c.is_ascii_uppercase())
        && digits.chars().any(|c| c.is_ascii_lowercase());
    if mixed_case && to_checksum(&address, None) != value {
        return Err(invalid());
    }
    Ok(address)
}

fn parse_wei(field: &'static str, value: &str) -> EscrowResult<U256> {
    U256::from_dec_str(value)
        .map_err(|_| EscrowError::InvalidAmount(format!("{} is not a decimal wei amount", field)))
}

/// 32 random bytes from the OS, hex encoded
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn constant_time_token_eq(provided: &str, expected: &str) -> bool {
    let provided = provided.as_bytes();
    let expected = expected.as_bytes();
    if provided.len() != expected.len() {
        let _ = expected.ct_eq(expected);
        return false;
    }
    provided.ct_eq(expected).into()
}
