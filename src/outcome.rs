//! Normalized transaction outcomes and aggregate tallies.

use std::fmt;

use alloy_dyn_abi::DynSolValue;
use alloy_primitives::{Address, B256};

use crate::backend::offline::QueuedTransaction;

/// Terminal state of a live transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    /// Included and executed successfully.
    Success,
    /// Included but reverted, or rejected during gas estimation.
    Reverted,
    /// Not observed on-chain before the receipt timeout elapsed.
    TimedOut,
}

impl fmt::Display for ReceiptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Reverted => write!(f, "reverted"),
            Self::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Normalized result of a call against a live network.
#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
    /// Terminal status.
    pub status: ReceiptStatus,
    /// Hash of the submitted transaction. `None` for view calls and
    /// transactions rejected before submission.
    pub transaction_hash: Option<B256>,
    /// Block the transaction landed in.
    pub block_number: Option<u64>,
    /// Gas consumed.
    pub gas_used: Option<u64>,
    /// Address of a freshly deployed contract.
    pub contract_address: Option<Address>,
    /// Decoded return values of a view call.
    pub return_value: Option<Vec<DynSolValue>>,
}

impl Receipt {
    /// A successful read-only call carrying its decoded return values.
    pub fn view(values: Vec<DynSolValue>) -> Self {
        Self {
            status: ReceiptStatus::Success,
            transaction_hash: None,
            block_number: None,
            gas_used: None,
            contract_address: None,
            return_value: Some(values),
        }
    }

    /// A synthetic failed receipt for a transaction whose gas estimation reverted.
    pub fn reverted_preflight() -> Self {
        Self {
            status: ReceiptStatus::Reverted,
            transaction_hash: None,
            block_number: None,
            gas_used: None,
            contract_address: None,
            return_value: None,
        }
    }

    /// A submitted transaction that never produced a receipt.
    pub fn timed_out(transaction_hash: B256) -> Self {
        Self {
            status: ReceiptStatus::TimedOut,
            transaction_hash: Some(transaction_hash),
            block_number: None,
            gas_used: None,
            contract_address: None,
            return_value: None,
        }
    }

    /// Returns true if the transaction executed successfully.
    pub fn is_success(&self) -> bool {
        self.status == ReceiptStatus::Success
    }
}

/// A transaction appended to the offline backend's current batch.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedRecord {
    /// Index of the batch the record was appended to.
    pub batch: usize,
    /// Position within the batch's transaction list.
    pub index: usize,
    /// The serialized transaction.
    pub transaction: QueuedTransaction,
}

/// Result of one backend operation.
///
/// Live backends always produce a [`Receipt`]; the offline backend always
/// produces a [`QueuedRecord`]. Callers must not assume receipt semantics.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionOutcome {
    /// Executed on a live network.
    Receipt(Receipt),
    /// Queued into an offline batch.
    Queued(QueuedRecord),
}

impl TransactionOutcome {
    /// The receipt status, or `None` for queued records.
    pub fn status(&self) -> Option<ReceiptStatus> {
        match self {
            Self::Receipt(receipt) => Some(receipt.status),
            Self::Queued(_) => None,
        }
    }

    /// Returns true for a successful receipt.
    pub fn is_success(&self) -> bool {
        self.status() == Some(ReceiptStatus::Success)
    }

    /// Returns the receipt, if any.
    pub fn receipt(&self) -> Option<&Receipt> {
        match self {
            Self::Receipt(receipt) => Some(receipt),
            Self::Queued(_) => None,
        }
    }

    /// Returns the queued record, if any.
    pub fn queued(&self) -> Option<&QueuedRecord> {
        match self {
            Self::Queued(record) => Some(record),
            Self::Receipt(_) => None,
        }
    }
}

impl From<Receipt> for TransactionOutcome {
    fn from(receipt: Receipt) -> Self {
        Self::Receipt(receipt)
    }
}

impl From<QueuedRecord> for TransactionOutcome {
    fn from(record: QueuedRecord) -> Self {
        Self::Queued(record)
    }
}

impl fmt::Display for TransactionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Receipt(receipt) => {
                write!(f, "{}", receipt.status)?;
                if let Some(hash) = receipt.transaction_hash {
                    write!(f, " tx={hash}")?;
                }
                if let Some(block) = receipt.block_number {
                    write!(f, " block={block}")?;
                }
                if let Some(address) = receipt.contract_address {
                    write!(f, " contract={address}")?;
                }
                if let Some(values) = &receipt.return_value {
                    write!(f, " returned={}", crate::abi::format_values(values))?;
                }
                Ok(())
            }
            Self::Queued(record) => write!(
                f,
                "queued batch={} index={} nonce={}",
                record.batch, record.index, record.transaction.nonce
            ),
        }
    }
}

/// Success, failure and queued counts for a set of outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeStats {
    /// Number of successful receipts.
    pub successful: usize,
    /// Number of reverted or timed out receipts.
    pub failed: usize,
    /// Number of offline records.
    pub queued: usize,
}

impl OutcomeStats {
    /// Creates a new tally.
    pub fn new(successful: usize, failed: usize, queued: usize) -> Self {
        Self { successful, failed, queued }
    }

    /// Counts one outcome.
    pub fn record(&mut self, outcome: &TransactionOutcome) {
        match outcome.status() {
            Some(ReceiptStatus::Success) => self.successful += 1,
            Some(_) => self.failed += 1,
            None => self.queued += 1,
        }
    }

    /// Adds another tally into this one.
    pub fn merge(&mut self, other: Self) {
        self.successful += other.successful;
        self.failed += other.failed;
        self.queued += other.queued;
    }

    /// Total number of outcomes counted.
    pub fn total(&self) -> usize {
        self.successful + self.failed + self.queued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::offline::{QueuedTransaction, TxTarget};
    use alloy_primitives::U256;

    fn queued() -> TransactionOutcome {
        TransactionOutcome::Queued(QueuedRecord {
            batch: 0,
            index: 0,
            transaction: QueuedTransaction {
                from: Address::ZERO,
                to: TxTarget::Deploy,
                nonce: 3,
                value: U256::ZERO.to_string(),
                contract_name: Some("Greeter".into()),
                function: None,
                params: None,
                gas_limit: 10_000_000,
                gas_price: "1000000000".into(),
                chain_id: 1000,
            },
        })
    }

    #[test]
    fn test_stats_record() {
        let mut stats = OutcomeStats::default();
        stats.record(&Receipt::view(vec![]).into());
        stats.record(&Receipt::reverted_preflight().into());
        stats.record(&Receipt::timed_out(B256::ZERO).into());
        stats.record(&queued());

        assert_eq!(stats, OutcomeStats::new(1, 2, 1));
        assert_eq!(stats.total(), 4);
    }

    #[test]
    fn test_stats_merge() {
        let mut stats = OutcomeStats::new(1, 2, 0);
        stats.merge(OutcomeStats::new(3, 0, 5));
        assert_eq!(stats, OutcomeStats::new(4, 2, 5));
    }

    #[test]
    fn test_outcome_accessors() {
        let receipt: TransactionOutcome = Receipt::reverted_preflight().into();
        assert_eq!(receipt.status(), Some(ReceiptStatus::Reverted));
        assert!(!receipt.is_success());
        assert!(receipt.queued().is_none());

        let record = queued();
        assert_eq!(record.status(), None);
        assert!(record.receipt().is_none());
        assert_eq!(record.to_string(), "queued batch=0 index=0 nonce=3");
    }
}
