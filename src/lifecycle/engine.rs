//! Lifecycle engine: the background loop that drives every escrow record
//!
//! One poll cycle:
//! 1. Read the block height once
//! 2. Walk a snapshot of the ledger and advance each non-terminal record
//! 3. Delete terminal records past their retention window
//!
//! The engine is the only writer of status transitions. Each record is
//! persisted before the next one is touched.

use super::validator::{validate_deposit, DepositOutcome, ValidationRules};
use crate::chain::{ChainGateway, FinalityChecker, ReceiptStatus};
use crate::config::RelayerConfig;
use crate::error::{EscrowError, EscrowResult};
use crate::metrics;
use crate::state::{EscrowRecord, EscrowStatus, LedgerStore};
use crate::tx::{ForwardError, ForwardPlanner, ForwardResult, Forwarder};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// What one poll cycle did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Block height could not be read; no record was processed
    pub skipped: bool,
    pub processed: usize,
    pub transitions: usize,
    pub errors: usize,
    pub swept: usize,
}

/// Escrow lifecycle engine
pub struct LifecycleEngine {
    gateway: Arc<dyn ChainGateway>,
    ledger: Arc<LedgerStore>,
    forwarder: Arc<Forwarder>,
    planner: ForwardPlanner,
    finality: FinalityChecker,
    rules: ValidationRules,
    config: RelayerConfig,
    shutdown: watch::Sender<bool>,
}

impl LifecycleEngine {
    pub fn new(
        gateway: Arc<dyn ChainGateway>,
        ledger: Arc<LedgerStore>,
        forwarder: Arc<Forwarder>,
        config: RelayerConfig,
    ) -> Self {
        let rules = ValidationRules {
            escrow_address: forwarder.escrow_address(),
            required_confirmations: config.required_confirmations,
        };
        let (shutdown, _) = watch::channel(false);

        Self {
            finality: FinalityChecker::new(gateway.clone(), config.required_confirmations),
            planner: ForwardPlanner::new(config.fee_basis_points),
            gateway,
            ledger,
            forwarder,
            rules,
            config,
            shutdown,
        }
    }

    /// Main poll loop; returns once `stop` is called
    pub async fn run(&self) -> EscrowResult<()> {
        let mut ticker = interval(Duration::from_secs(self.config.poll_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown.subscribe();

        info!(
            "Lifecycle engine started (poll every {}s, {} confirmations)",
            self.config.poll_interval_secs, self.config.required_confirmations
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    let started = Instant::now();
                    let report = self.run_cycle(Utc::now()).await;
                    metrics::record_cycle_duration(started.elapsed().as_secs_f64());
                    debug!("Poll cycle finished: {:?}", report);
                }

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Lifecycle engine stopped");
        Ok(())
    }

    /// Stop the loop at the next sleep boundary; a running cycle finishes
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    /// One pass over the ledger followed by the cleanup sweep
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> CycleReport {
        let mut report = CycleReport::default();

        match self.gateway.current_block_height().await {
            Ok(height) => {
                metrics::record_block_height(height);

                // Resend journaled payloads before signing anything new so a
                // held nonce is spent by the payload it was signed into
                let mut records = self.ledger.list().await;
                records.sort_by_key(|r| {
                    !(r.status == EscrowStatus::Verified && r.forward_tx_hash.is_some())
                });

                for record in records {
                    if record.status.is_terminal() {
                        continue;
                    }
                    report.processed += 1;

                    let id = record.id.clone();
                    match self.process(record, height, now).await {
                        Ok(true) => report.transitions += 1,
                        Ok(false) => {}
                        Err(e) if e.is_retryable() => {
                            report.errors += 1;
                            metrics::record_rpc_error("process");
                            warn!("Transient error on {}, retrying next cycle: {}", id, e);
                        }
                        Err(e) => {
                            report.errors += 1;
                            if e.should_alert() {
                                error!(alert = true, "Error processing {}: {}", id, e);
                            } else {
                                error!("Error processing {}: {}", id, e);
                            }
                        }
                    }
                }
            }
            Err(e) => {
                report.skipped = true;
                metrics::record_rpc_error("block_height");
                warn!("Skipping poll cycle, block height unavailable: {}", e);
            }
        }

        report.swept = self.sweep_expired(now).await;
        metrics::record_status_counts(&self.ledger.count_by_status().await);
        report
    }

    /// Advance one record; `Ok(true)` when its status changed
    async fn process(
        &self,
        record: EscrowRecord,
        height: u64,
        now: DateTime<Utc>,
    ) -> EscrowResult<bool> {
        match record.status {
            EscrowStatus::Pending => self.process_pending(record, height, now).await,
            EscrowStatus::Verified => self.process_verified(record, now).await,
            EscrowStatus::ForwardingPending => self.process_forwarding(record, height, now).await,
            _ => Ok(false),
        }
    }

    async fn process_pending(
        &self,
        mut record: EscrowRecord,
        height: u64,
        now: DateTime<Utc>,
    ) -> EscrowResult<bool> {
        let escrow_hash = match record.escrow_tx_hash() {
            Ok(hash) => hash,
            Err(e) => return self.fail(record, e.to_string(), now).await,
        };

        let receipt = self.gateway.get_receipt(escrow_hash).await?;
        let tx = match receipt {
            Some(_) => self.gateway.get_transaction(escrow_hash).await?,
            None => None,
        };

        match validate_deposit(&record, tx.as_ref(), receipt.as_ref(), height, &self.rules) {
            DepositOutcome::NotYetConfirmed { confirmations } => {
                debug!(
                    "{} waiting for deposit ({}/{} confirmations)",
                    record.id, confirmations, self.rules.required_confirmations
                );
                Ok(false)
            }
            DepositOutcome::Invalid(reason) => self.fail(record, reason, now).await,
            DepositOutcome::Verified {
                block_number,
                confirmations,
            } => {
                if let Some(receipt) = receipt.as_ref() {
                    if !self.finality.is_canonical(receipt).await? {
                        return Ok(false);
                    }
                }

                record.mark_verified(block_number, now)?;
                let id = record.id.clone();
                self.ledger.upsert(record).await?;
                metrics::record_transition("verified");
                info!(
                    "{} verified at block {} ({} confirmations)",
                    id, block_number, confirmations
                );
                Ok(true)
            }
        }
    }

    async fn process_verified(
        &self,
        record: EscrowRecord,
        now: DateTime<Utc>,
    ) -> EscrowResult<bool> {
        // Signed and journaled before a crash; resend, never re-sign
        if record.forward_tx_hash.is_some() {
            return match self.forwarder.rebroadcast(&record).await {
                Ok(result) => self.advance_to_forwarding(record, result, now).await,
                Err(ForwardError::Broadcast { source, .. }) => {
                    self.fail_forward(record, source.to_string(), now).await
                }
                Err(ForwardError::NotSent(e)) => Err(e),
            };
        }

        let gas_price = self.gateway.gas_price().await?;
        let plan = match self.planner.plan(&record, gas_price) {
            Ok(plan) => plan,
            Err(rejection) => return self.fail_forward(record, rejection.to_string(), now).await,
        };

        match self.forwarder.forward(&record, &plan).await {
            Ok(result) => {
                let journaled = self.reload(&record.id).await?;
                self.advance_to_forwarding(journaled, result, now).await
            }
            Err(ForwardError::NotSent(e)) if e.is_retryable() => Err(e),
            Err(ForwardError::NotSent(EscrowError::AlreadyForwarded { forward_tx_hash, .. })) => {
                warn!(
                    "{} already journaled forward {}, resending next cycle",
                    record.id, forward_tx_hash
                );
                Ok(false)
            }
            Err(ForwardError::NotSent(e)) => self.fail_forward(record, e.to_string(), now).await,
            Err(ForwardError::Broadcast { source, .. }) => {
                let journaled = self.reload(&record.id).await?;
                self.fail_forward(journaled, source.to_string(), now).await
            }
        }
    }

    async fn process_forwarding(
        &self,
        mut record: EscrowRecord,
        height: u64,
        now: DateTime<Utc>,
    ) -> EscrowResult<bool> {
        let Some(forward_hash) = record.forward_tx_hash else {
            return Err(EscrowError::Internal(format!(
                "{} is forwarding without a forward tx hash",
                record.id
            )));
        };

        let receipt = self.gateway.get_receipt(forward_hash).await?;
        match self.finality.status(receipt.as_ref(), height) {
            ReceiptStatus::Confirmed {
                block_number,
                confirmations,
            } => {
                if let Some(receipt) = receipt.as_ref() {
                    if !self.finality.is_canonical(receipt).await? {
                        return Ok(false);
                    }
                }

                record.mark_complete(block_number, now)?;
                let id = record.id.clone();
                self.ledger.upsert(record).await?;
                metrics::record_transition("completed");
                info!(
                    "{} complete, forward {:?} at block {} ({} confirmations)",
                    id, forward_hash, block_number, confirmations
                );
                Ok(true)
            }
            ReceiptStatus::Reverted { .. } => {
                self.fail(record, "forward transaction reverted", now).await
            }
            ReceiptStatus::Absent | ReceiptStatus::Confirming { .. } => {
                self.warn_if_stale(&record, now);
                Ok(false)
            }
        }
    }

    /// Delete terminal records past retention; returns how many were removed
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut swept = 0;

        for record in self.ledger.snapshot().await {
            let Some(since) = record.terminal_since() else {
                continue;
            };
            let retention_secs = match record.status {
                EscrowStatus::Complete => self.config.complete_retention_secs,
                _ => self.config.failed_retention_secs,
            };
            if now - since <= ChronoDuration::seconds(retention_secs as i64) {
                continue;
            }

            match self.ledger.delete(&record.id).await {
                Ok(true) => {
                    swept += 1;
                    info!("Removed {} transaction {}", record.status, record.id);
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to remove {}: {}", record.id, e),
            }
        }

        if swept > 0 {
            metrics::record_swept(swept);
        }
        swept
    }

    async fn advance_to_forwarding(
        &self,
        mut record: EscrowRecord,
        result: ForwardResult,
        now: DateTime<Utc>,
    ) -> EscrowResult<bool> {
        record.mark_forwarding(now)?;
        let id = record.id.clone();
        self.ledger.upsert(record).await?;
        metrics::record_transition("forwarded");
        info!(
            "{} forwarding_pending, tx {:?} nonce {}",
            id, result.tx_hash, result.nonce
        );
        Ok(true)
    }

    async fn fail(
        &self,
        mut record: EscrowRecord,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> EscrowResult<bool> {
        let reason = reason.into();
        record.mark_failed(reason.clone(), now)?;
        let id = record.id.clone();
        self.ledger.upsert(record).await?;
        metrics::record_transition("failed");
        error!("{} failed: {}", id, reason);
        Ok(true)
    }

    async fn fail_forward(
        &self,
        mut record: EscrowRecord,
        reason: String,
        now: DateTime<Utc>,
    ) -> EscrowResult<bool> {
        record.mark_forward_failed(reason.clone(), now)?;
        let id = record.id.clone();
        self.ledger.upsert(record).await?;
        metrics::record_transition("forward_failed");
        error!("{} forward_failed: {}", id, reason);
        Ok(true)
    }

    async fn reload(&self, id: &str) -> EscrowResult<EscrowRecord> {
        self.ledger
            .get(id)
            .await
            .ok_or_else(|| EscrowError::NotFound { id: id.to_string() })
    }

    fn warn_if_stale(&self, record: &EscrowRecord, now: DateTime<Utc>) {
        let since = record.forwarded_at.unwrap_or(record.created_at);
        let age = now - since;
        if age > ChronoDuration::seconds(self.config.forward_stale_after_secs as i64) {
            warn!(
                "{} forward {:?} unconfirmed for {}s",
                record.id,
                record.forward_tx_hash,
                age.num_seconds()
            );
        }
    }
}
