//! Deposit validation against the declared escrow intent

use crate::chain::{receipt_status, ObservedReceipt, ObservedTransaction, ReceiptStatus};
use crate::state::EscrowRecord;

use ethers::types::Address;

/// Result of checking a deposit; only `Invalid` is terminal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepositOutcome {
    Verified { block_number: u64, confirmations: u64 },
    NotYetConfirmed { confirmations: u64 },
    Invalid(String),
}

#[derive(Debug, Clone, Copy)]
pub struct ValidationRules {
    pub escrow_address: Address,
    pub required_confirmations: u64,
}

/// Check the observed deposit, short-circuiting on the first failed rule
pub fn validate_deposit(
    record: &EscrowRecord,
    tx: Option<&ObservedTransaction>,
    receipt: Option<&ObservedReceipt>,
    current_height: u64,
    rules: &ValidationRules,
) -> DepositOutcome {
    let (block_number, confirmations) =
        match receipt_status(receipt, current_height, rules.required_confirmations) {
            ReceiptStatus::Absent => return DepositOutcome::NotYetConfirmed { confirmations: 0 },
            ReceiptStatus::Reverted { .. } => {
                return DepositOutcome::Invalid("escrow transaction reverted".to_string())
            }
            ReceiptStatus::Confirming { confirmations, .. } => {
                return DepositOutcome::NotYetConfirmed { confirmations }
            }
            ReceiptStatus::Confirmed {
                block_number,
                confirmations,
            } => (block_number, confirmations),
        };

    // Some nodes serve the receipt before the transaction body
    let Some(tx) = tx else {
        return DepositOutcome::NotYetConfirmed { confirmations };
    };

    if tx.to != Some(rules.escrow_address) {
        return DepositOutcome::Invalid("wrong destination".to_string());
    }
    if tx.from != record.sender {
        return DepositOutcome::Invalid("sender mismatch".to_string());
    }
    if tx.value != record.deposit_wei {
        return DepositOutcome::Invalid("amount mismatch".to_string());
    }

    DepositOutcome::Verified {
        block_number,
        confirmations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{escrow_address, sample_record};
    use ethers::types::U256;

    fn rules() -> ValidationRules {
        ValidationRules {
            escrow_address: escrow_address(),
            required_confirmations: 3,
        }
    }

    fn observed(record: &EscrowRecord) -> (ObservedTransaction, ObservedReceipt) {
        let hash = record.escrow_tx_hash().unwrap();
        (
            ObservedTransaction {
                hash,
                from: record.sender,
                to: Some(escrow_address()),
                value: record.deposit_wei,
            },
            ObservedReceipt {
                tx_hash: hash,
                success: true,
                block_number: 100,
                block_hash: None,
            },
        )
    }

    #[test]
    fn verifies_matching_deposit_at_threshold() {
        let record = sample_record();
        let (tx, receipt) = observed(&record);

        assert_eq!(
            validate_deposit(&record, Some(&tx), Some(&receipt), 103, &rules()),
            DepositOutcome::Verified {
                block_number: 100,
                confirmations: 3
            }
        );
    }

    #[test]
    fn waits_for_receipt_and_confirmations() {
        let record = sample_record();
        let (tx, receipt) = observed(&record);

        assert_eq!(
            validate_deposit(&record, Some(&tx), None, 103, &rules()),
            DepositOutcome::NotYetConfirmed { confirmations: 0 }
        );
        assert_eq!(
            validate_deposit(&record, Some(&tx), Some(&receipt), 102, &rules()),
            DepositOutcome::NotYetConfirmed { confirmations: 2 }
        );
        assert_eq!(
            validate_deposit(&record, None, Some(&receipt), 110, &rules()),
            DepositOutcome::NotYetConfirmed { confirmations: 10 }
        );
    }

    #[test]
    fn reverted_deposit_is_invalid() {
        let record = sample_record();
        let (tx, mut receipt) = observed(&record);
        receipt.success = false;

        assert_eq!(
            validate_deposit(&record, Some(&tx), Some(&receipt), 200, &rules()),
            DepositOutcome::Invalid("escrow transaction reverted".to_string())
        );
    }

    #[test]
    fn rejects_mismatched_fields_in_order() {
        let record = sample_record();
        let (tx, receipt) = observed(&record);

        let mut wrong = tx.clone();
        wrong.to = Some(Address::repeat_byte(0x99));
        wrong.from = Address::repeat_byte(0x98);
        assert_eq!(
            validate_deposit(&record, Some(&wrong), Some(&receipt), 103, &rules()),
            DepositOutcome::Invalid("wrong destination".to_string())
        );

        let mut creation = tx.clone();
        creation.to = None;
        assert_eq!(
            validate_deposit(&record, Some(&creation), Some(&receipt), 103, &rules()),
            DepositOutcome::Invalid("wrong destination".to_string())
        );

        let mut wrong = tx.clone();
        wrong.from = Address::repeat_byte(0x98);
        wrong.value = U256::from(1);
        assert_eq!(
            validate_deposit(&record, Some(&wrong), Some(&receipt), 103, &rules()),
            DepositOutcome::Invalid("sender mismatch".to_string())
        );

        let mut wrong = tx;
        wrong.value = record.deposit_wei + 1;
        assert_eq!(
            validate_deposit(&record, Some(&wrong), Some(&receipt), 103, &rules()),
            DepositOutcome::Invalid("amount mismatch".to_string())
        );
    }
}
