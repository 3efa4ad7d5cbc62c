//! JSON-file backed ledger of escrow records

use super::record::{EscrowRecord, EscrowStatus};
use crate::error::{EscrowError, EscrowResult};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

const LEDGER_VERSION: u32 = 1;

/// On-disk layout, rewritten in full on every mutation
#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    records: BTreeMap<String, EscrowRecord>,
}

/// Single source of truth for escrow records
///
/// Every mutation is staged on a copy, written to disk atomically, and only
/// then committed to memory. A failed write leaves both views untouched.
pub struct LedgerStore {
    path: PathBuf,
    records: RwLock<BTreeMap<String, EscrowRecord>>,
}

impl LedgerStore {
    /// Open the ledger, loading existing state from disk
    pub fn open(path: impl Into<PathBuf>) -> EscrowResult<Self> {
        let path = path.into();

        let records = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            let file: LedgerFile = serde_json::from_str(&contents)?;
            if file.version != LEDGER_VERSION {
                return Err(EscrowError::Config(format!(
                    "Unsupported ledger version {} in {:?}",
                    file.version, path
                )));
            }
            info!("Loaded {} transactions from {:?}", file.records.len(), path);
            file.records
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            info!("Starting empty ledger at {:?}", path);
            BTreeMap::new()
        };

        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    pub async fn get(&self, id: &str) -> Option<EscrowRecord> {
        self.records.read().await.get(id).cloned()
    }

    /// All records, oldest first
    pub async fn list(&self) -> Vec<EscrowRecord> {
        let mut records = self.snapshot().await;
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    /// Point-in-time copy for iteration outside the lock
    pub async fn snapshot(&self) -> Vec<EscrowRecord> {
        self.records.read().await.values().cloned().collect()
    }

    /// Insert a brand-new record; an existing id is rejected
    pub async fn insert(&self, record: EscrowRecord) -> EscrowResult<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(EscrowError::AlreadyExists { id: record.id });
        }

        let mut staged = records.clone();
        staged.insert(record.id.clone(), record);
        self.persist(&staged)?;
        *records = staged;
        Ok(())
    }

    /// Insert or replace a record
    pub async fn upsert(&self, record: EscrowRecord) -> EscrowResult<()> {
        let mut records = self.records.write().await;

        let mut staged = records.clone();
        debug!("Upsert {} ({})", record.id, record.status);
        staged.insert(record.id.clone(), record);
        self.persist(&staged)?;
        *records = staged;
        Ok(())
    }

    /// Remove a record, returning whether it existed
    pub async fn delete(&self, id: &str) -> EscrowResult<bool> {
        let mut records = self.records.write().await;
        if !records.contains_key(id) {
            return Ok(false);
        }

        let mut staged = records.clone();
        staged.remove(id);
        self.persist(&staged)?;
        *records = staged;
        Ok(true)
    }

    /// Record counts per status (every status present, zero if empty)
    pub async fn count_by_status(&self) -> HashMap<EscrowStatus, u64> {
        let mut counts: HashMap<EscrowStatus, u64> =
            EscrowStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for record in self.records.read().await.values() {
            *counts.entry(record.status).or_default() += 1;
        }
        counts
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write-to-temp, fsync, rename
    fn persist(&self, records: &BTreeMap<String, EscrowRecord>) -> EscrowResult<()> {
        let file = LedgerFileRef {
            version: LEDGER_VERSION,
            records,
        };
        let contents = serde_json::to_vec_pretty(&file)?;

        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut tmp = fs::File::create(&tmp_path)?;
            tmp.write_all(&contents)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[derive(Serialize)]
struct LedgerFileRef<'a> {
    version: u32,
    records: &'a BTreeMap<String, EscrowRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{sample_record, sample_record_with_id};
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    fn ledger_path(dir: &TempDir) -> PathBuf {
        dir.path().join("data").join("transactions.json")
    }

    #[tokio::test]
    async fn reopen_restores_persisted_records() {
        let dir = TempDir::new().unwrap();
        let record = sample_record();

        {
            let store = LedgerStore::open(ledger_path(&dir)).unwrap();
            assert_ok!(store.insert(record.clone()).await);
        }

        let reopened = LedgerStore::open(ledger_path(&dir)).unwrap();
        assert_eq!(reopened.get(&record.id).await, Some(record));
        assert!(!ledger_path(&dir).with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_ids() {
        let dir = TempDir::new().unwrap();
        let store = LedgerStore::open(ledger_path(&dir)).unwrap();
        let record = sample_record();

        assert_ok!(store.insert(record.clone()).await);
        let mut again = record.clone();
        again.recipient_amount_wei = 1.into();
        let err = assert_err!(store.insert(again).await);
        assert!(matches!(err, EscrowError::AlreadyExists { .. }));
        assert_eq!(store.get(&record.id).await, Some(record));
    }

    #[tokio::test]
    async fn delete_is_persisted() {
        let dir = TempDir::new().unwrap();
        let store = LedgerStore::open(ledger_path(&dir)).unwrap();
        let first = sample_record_with_id(1);
        let second = sample_record_with_id(2);
        store.insert(first.clone()).await.unwrap();
        store.insert(second.clone()).await.unwrap();

        assert!(store.delete(&first.id).await.unwrap());
        assert!(!store.delete(&first.id).await.unwrap());

        let reopened = LedgerStore::open(ledger_path(&dir)).unwrap();
        assert_eq!(reopened.list().await, vec![second]);
    }

    #[tokio::test]
    async fn failed_write_leaves_memory_unchanged() {
        let dir = TempDir::new().unwrap();
        let store = LedgerStore::open(ledger_path(&dir)).unwrap();
        let record = sample_record();
        store.insert(record.clone()).await.unwrap();

        // A directory squatting on the temp path makes the write fail
        fs::create_dir_all(ledger_path(&dir).with_extension("json.tmp")).unwrap();

        let mut updated = record.clone();
        updated.status = EscrowStatus::Verified;
        let err = assert_err!(store.upsert(updated).await);
        assert!(matches!(err, EscrowError::Storage(_)));
        assert_eq!(store.get(&record.id).await.unwrap().status, EscrowStatus::Pending);
    }

    #[tokio::test]
    async fn counts_cover_every_status() {
        let dir = TempDir::new().unwrap();
        let store = LedgerStore::open(ledger_path(&dir)).unwrap();
        store.insert(sample_record_with_id(1)).await.unwrap();
        store.insert(sample_record_with_id(2)).await.unwrap();

        let counts = store.count_by_status().await;
        assert_eq!(counts[&EscrowStatus::Pending], 2);
        assert_eq!(counts[&EscrowStatus::Complete], 0);
        assert_eq!(counts.len(), EscrowStatus::ALL.len());
    }
}
