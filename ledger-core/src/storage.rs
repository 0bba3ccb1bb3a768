//! Storage layer
//!
//! # Column Families
//!
//! - `wallets` - Wallet rows (key: tenant || kind)
//! - `entries` - Append-only ledger entries (key: tenant || kind || entry_id)
//! - `reservations` - Pool reservations (key: payment_ref)
//! - `documents` - Submittable documents (key: document_id)
//! - `dead_letters` - Exhausted async work (key: dead_letter_id)
//! - `idempotency` - Idempotency records (key: scope || key)
//! - `webhook_subscriptions` - Subscriptions (key: subscription_id)
//! - `webhook_deliveries` - Delivery attempts (key: delivery_id)
//! - `document_tenants` - Tenant index of documents (key: tenant || document_id)
//! - `dispatch_queue` - Documents waiting for dispatch (key: due_at || document_id)
//! - `dead_letter_index` - Dead letter of a document (key: document_id)
//! - `webhook_queue` - Deliveries waiting for an attempt (key: due_at || delivery_id)
//!
//! Queue and index families hold empty values or bare ids. Their owners keep
//! them in the same batch as the row they point at.
//!
//! Every mutation is an atomic [`WriteBatch`]: a reader sees all of a batch
//! or none of it.

use crate::{
    config::StorageBackend,
    error::{Error, Result},
    types::{LedgerEntry, PoolReservation, ReservationStatus, Wallet, WalletRef},
    Config,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
pub const CF_WALLETS: &str = "wallets";
/// Ledger entries
pub const CF_ENTRIES: &str = "entries";
/// Pool reservations
pub const CF_RESERVATIONS: &str = "reservations";
/// Documents
pub const CF_DOCUMENTS: &str = "documents";
/// Dead letters
pub const CF_DEAD_LETTERS: &str = "dead_letters";
/// Idempotency records
pub const CF_IDEMPOTENCY: &str = "idempotency";
/// Webhook subscriptions
pub const CF_WEBHOOK_SUBSCRIPTIONS: &str = "webhook_subscriptions";
/// Webhook deliveries
pub const CF_WEBHOOK_DELIVERIES: &str = "webhook_deliveries";
/// Tenant index of documents
pub const CF_DOCUMENT_TENANTS: &str = "document_tenants";
/// Documents waiting for dispatch
pub const CF_DISPATCH_QUEUE: &str = "dispatch_queue";
/// Dead letter id per document
pub const CF_DEAD_LETTER_INDEX: &str = "dead_letter_index";
/// Deliveries waiting for an attempt
pub const CF_WEBHOOK_QUEUE: &str = "webhook_queue";

/// All column families, opened together
pub const COLUMN_FAMILIES: &[&str] = &[
    CF_WALLETS,
    CF_ENTRIES,
    CF_RESERVATIONS,
    CF_DOCUMENTS,
    CF_DEAD_LETTERS,
    CF_IDEMPOTENCY,
    CF_WEBHOOK_SUBSCRIPTIONS,
    CF_WEBHOOK_DELIVERIES,
    CF_DOCUMENT_TENANTS,
    CF_DISPATCH_QUEUE,
    CF_DEAD_LETTER_INDEX,
    CF_WEBHOOK_QUEUE,
];

fn encode_millis(millis: i64) -> [u8; 8] {
    ((millis as u64) ^ (1 << 63)).to_be_bytes()
}

/// Order-preserving encoding of a timestamp at millisecond precision
pub fn time_key(at: DateTime<Utc>) -> [u8; 8] {
    encode_millis(at.timestamp_millis())
}

/// Queue key: `time_key(at) || id`
pub fn due_key(at: DateTime<Utc>, id: Uuid) -> Vec<u8> {
    let mut key = time_key(at).to_vec();
    key.extend_from_slice(id.as_bytes());
    key
}

/// Id stored in the last 16 bytes of an index or queue key
pub fn key_suffix_id(key: &[u8]) -> Option<Uuid> {
    let start = key.len().checked_sub(16)?;
    Uuid::from_slice(&key[start..]).ok()
}

/// Smallest UUIDv7 that can be minted at or after `at`
pub fn uuid_v7_floor(at: DateTime<Utc>) -> Uuid {
    let millis = at.timestamp_millis().max(0) as u64;
    let mut bytes = [0u8; 16];
    bytes[..6].copy_from_slice(&millis.to_be_bytes()[2..]);
    Uuid::from_bytes(bytes)
}

/// Creation time carried by a UUIDv7
pub fn uuid_v7_time(id: &Uuid) -> Option<DateTime<Utc>> {
    let (secs, nanos) = id.get_timestamp()?.to_unix();
    DateTime::from_timestamp(secs as i64, nanos)
}

/// First key past every key starting with `prefix`. Empty means unbounded.
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return end;
        }
    }
    end
}

/// One operation inside a batch
#[derive(Debug, Clone)]
pub enum BatchOp {
    /// Insert or overwrite
    Put {
        /// Column family
        cf: &'static str,
        /// Key
        key: Vec<u8>,
        /// Encoded value
        value: Vec<u8>,
    },
    /// Remove
    Delete {
        /// Column family
        cf: &'static str,
        /// Key
        key: Vec<u8>,
    },
}

/// Atomic group of writes
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Put raw bytes
    pub fn put(&mut self, cf: &'static str, key: impl Into<Vec<u8>>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put { cf, key: key.into(), value });
    }

    /// Put a bincode-encoded value
    pub fn put_value<T: Serialize>(
        &mut self,
        cf: &'static str,
        key: impl Into<Vec<u8>>,
        value: &T,
    ) -> Result<()> {
        let value = bincode::serialize(value)?;
        self.put(cf, key, value);
        Ok(())
    }

    /// Delete a key
    pub fn delete(&mut self, cf: &'static str, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete { cf, key: key.into() });
    }

    /// Number of operations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// No operations
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Consume into operations
    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Key-value backend with column families and atomic batches
pub trait KvBackend: Send + Sync {
    /// Point read
    fn get(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// All rows whose key starts with `prefix`, in key order
    fn scan_prefix(&self, cf: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Up to `limit` rows with `start <= key < end`, in key order. An empty
    /// `end` is unbounded.
    fn scan_range(
        &self,
        cf: &str,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Apply a batch atomically
    fn write(&self, batch: WriteBatch) -> Result<()>;
}

/// In-memory backend: one ordered map per column family
#[derive(Debug, Default)]
pub struct MemoryBackend {
    cfs: RwLock<HashMap<&'static str, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryBackend {
    /// Empty backend with all column families
    pub fn new() -> Self {
        let cfs = COLUMN_FAMILIES.iter().map(|cf| (*cf, BTreeMap::new())).collect();
        Self { cfs: RwLock::new(cfs) }
    }
}

fn unknown_cf(name: &str) -> Error {
    Error::Storage(format!("Column family {} not found", name))
}

impl KvBackend for MemoryBackend {
    fn get(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cfs = self.cfs.read();
        let map = cfs.get(cf).ok_or_else(|| unknown_cf(cf))?;
        Ok(map.get(key).cloned())
    }

    fn scan_prefix(&self, cf: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cfs = self.cfs.read();
        let map = cfs.get(cf).ok_or_else(|| unknown_cf(cf))?;
        Ok(map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn scan_range(
        &self,
        cf: &str,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cfs = self.cfs.read();
        let map = cfs.get(cf).ok_or_else(|| unknown_cf(cf))?;
        Ok(map
            .range(start.to_vec()..)
            .take_while(|(k, _)| end.is_empty() || k.as_slice() < end)
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut cfs = self.cfs.write();

        // Validate first so a bad batch leaves nothing applied
        for op in &batch.ops {
            let cf = match op {
                BatchOp::Put { cf, .. } | BatchOp::Delete { cf, .. } => *cf,
            };
            if !cfs.contains_key(cf) {
                return Err(unknown_cf(cf));
            }
        }

        for op in batch.ops {
            match op {
                BatchOp::Put { cf, key, value } => {
                    if let Some(map) = cfs.get_mut(cf) {
                        map.insert(key, value);
                    }
                }
                BatchOp::Delete { cf, key } => {
                    if let Some(map) = cfs.get_mut(cf) {
                        map.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }
}

/// RocksDB backend
#[cfg(feature = "rocksdb")]
pub struct RocksBackend {
    db: rocksdb::DB,
    sync_writes: bool,
}

#[cfg(feature = "rocksdb")]
impl RocksBackend {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        use rocksdb::{ColumnFamilyDescriptor, Options, DB};

        let path = &config.data_dir;
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        let cf_descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let mut opts = Options::default();
                // Wallets and reservations are read on every mutation
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
                ColumnFamilyDescriptor::new(*name, opts)
            })
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(
            path = ?path,
            column_families = COLUMN_FAMILIES.len(),
            "Opened RocksDB"
        );

        Ok(Self { db, sync_writes: config.rocksdb.sync_writes })
    }

    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| unknown_cf(name))
    }
}

#[cfg(feature = "rocksdb")]
impl KvBackend for RocksBackend {
    fn get(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf_handle(cf)?;
        Ok(self.db.get_cf(cf, key)?)
    }

    fn scan_prefix(&self, cf: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf_handle(cf)?;
        let iter = self.db.iterator_cf(
            cf,
            rocksdb::IteratorMode::From(prefix, rocksdb::Direction::Forward),
        );

        let mut rows = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push((key.to_vec(), value.to_vec()));
        }
        Ok(rows)
    }

    fn scan_range(
        &self,
        cf: &str,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf_handle(cf)?;
        let iter = self.db.iterator_cf(
            cf,
            rocksdb::IteratorMode::From(start, rocksdb::Direction::Forward),
        );

        let mut rows = Vec::new();
        for item in iter {
            if rows.len() >= limit {
                break;
            }
            let (key, value) = item?;
            if !end.is_empty() && key.as_ref() >= end {
                break;
            }
            rows.push((key.to_vec(), value.to_vec()));
        }
        Ok(rows)
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut rocks_batch = rocksdb::WriteBatch::default();
        for op in batch.ops {
            match op {
                BatchOp::Put { cf, key, value } => {
                    rocks_batch.put_cf(self.cf_handle(cf)?, key, value);
                }
                BatchOp::Delete { cf, key } => {
                    rocks_batch.delete_cf(self.cf_handle(cf)?, key);
                }
            }
        }

        let mut write_opts = rocksdb::WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        self.db.write_opt(rocks_batch, &write_opts)?;
        Ok(())
    }
}

/// Typed storage facade shared by every component
#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn KvBackend>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

impl Storage {
    /// Open the backend selected by configuration
    pub fn open(config: &Config) -> Result<Self> {
        match config.backend {
            StorageBackend::Memory => Ok(Self::in_memory()),
            #[cfg(feature = "rocksdb")]
            StorageBackend::RocksDb => Ok(Self::with_backend(Arc::new(RocksBackend::open(config)?))),
            #[cfg(not(feature = "rocksdb"))]
            StorageBackend::RocksDb => Err(Error::Config(
                "RocksDB backend requested but the `rocksdb` feature is disabled".to_string(),
            )),
        }
    }

    /// Fresh in-memory storage
    pub fn in_memory() -> Self {
        Self::with_backend(Arc::new(MemoryBackend::new()))
    }

    /// Wrap an existing backend
    pub fn with_backend(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    // Generic operations

    /// Raw bytes of one value
    pub fn get_raw(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.backend.get(cf, key)
    }

    /// Decode one value
    pub fn get_value<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        match self.backend.get(cf, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Decode every value under a prefix
    pub fn scan_values<T: DeserializeOwned>(&self, cf: &str, prefix: &[u8]) -> Result<Vec<T>> {
        self.backend
            .scan_prefix(cf, prefix)?
            .into_iter()
            .map(|(_, bytes)| bincode::deserialize(&bytes).map_err(Error::from))
            .collect()
    }

    /// Decode every row under a prefix, keeping its key
    pub fn scan_keyed<T: DeserializeOwned>(
        &self,
        cf: &str,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, T)>> {
        self.backend
            .scan_prefix(cf, prefix)?
            .into_iter()
            .map(|(key, bytes)| Ok((key, bincode::deserialize(&bytes)?)))
            .collect()
    }

    /// Keys with `start <= key < end`, at most `limit`
    pub fn scan_range_keys(
        &self,
        cf: &str,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .backend
            .scan_range(cf, start, end, limit)?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    /// Ids queued in `cf` (a `due_key` family) and due at `now`, earliest first
    pub fn due_ids(&self, cf: &str, now: DateTime<Utc>, limit: usize) -> Result<Vec<Uuid>> {
        let end = encode_millis(now.timestamp_millis().saturating_add(1));
        Ok(self
            .scan_range_keys(cf, &[], &end, limit)?
            .iter()
            .filter_map(|key| key_suffix_id(key))
            .collect())
    }

    /// Commit a batch atomically
    pub fn write(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.backend.write(batch)
    }

    // Wallet operations

    /// Get wallet, if it was ever written
    pub fn get_wallet(&self, wallet: &WalletRef) -> Result<Option<Wallet>> {
        self.get_value(CF_WALLETS, &wallet.storage_key())
    }

    /// Stage a wallet write
    pub fn stage_wallet(batch: &mut WriteBatch, wallet: &Wallet) -> Result<()> {
        batch.put_value(CF_WALLETS, wallet.wallet.storage_key().to_vec(), wallet)
    }

    /// Stage an entry append
    pub fn stage_entry(batch: &mut WriteBatch, entry: &LedgerEntry) -> Result<()> {
        batch.put_value(CF_ENTRIES, Self::entry_key(entry), entry)
    }

    /// All entries of a wallet, oldest first
    pub fn wallet_entries(&self, wallet: &WalletRef) -> Result<Vec<LedgerEntry>> {
        self.scan_values(CF_ENTRIES, &wallet.storage_key())
    }

    fn entry_key(entry: &LedgerEntry) -> Vec<u8> {
        let mut key = entry.wallet.storage_key().to_vec();
        key.extend_from_slice(entry.entry_id.as_bytes());
        key
    }

    // Reservation operations

    /// Get reservation by payment reference
    pub fn get_reservation(&self, payment_ref: &str) -> Result<Option<PoolReservation>> {
        self.get_value(CF_RESERVATIONS, payment_ref.as_bytes())
    }

    /// Stage a reservation write
    pub fn stage_reservation(batch: &mut WriteBatch, reservation: &PoolReservation) -> Result<()> {
        batch.put_value(CF_RESERVATIONS, reservation.payment_ref.as_bytes().to_vec(), reservation)
    }

    /// All reservations
    pub fn reservations(&self) -> Result<Vec<PoolReservation>> {
        self.scan_values(CF_RESERVATIONS, &[])
    }

    /// Sum of outstanding holds
    pub fn reserved_credits(&self) -> Result<Decimal> {
        Ok(self
            .reservations()?
            .iter()
            .filter(|r| r.status == ReservationStatus::Reserved)
            .map(|r| Decimal::from(r.credits))
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntryKind, EntryReason, TenantId};
    use chrono::Utc;
    use uuid::Uuid;

    fn entry(wallet: WalletRef, amount: i64) -> LedgerEntry {
        LedgerEntry {
            entry_id: Uuid::now_v7(),
            wallet,
            kind: EntryKind::Credit,
            amount: Decimal::from(amount),
            unit: "credits".to_string(),
            reason: EntryReason::ManualAdjustment,
            reference: None,
            balance_after: Decimal::from(amount),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_batch_is_atomic_on_unknown_cf() {
        let backend = MemoryBackend::new();
        let mut batch = WriteBatch::new();
        batch.put(CF_WALLETS, b"a".to_vec(), b"1".to_vec());
        batch.put("missing", b"b".to_vec(), b"2".to_vec());

        assert!(backend.write(batch).is_err());
        assert!(backend.get(CF_WALLETS, b"a").unwrap().is_none());
    }

    #[test]
    fn test_scan_prefix_is_bounded() {
        let backend = MemoryBackend::new();
        let mut batch = WriteBatch::new();
        batch.put(CF_ENTRIES, b"aa1".to_vec(), vec![1]);
        batch.put(CF_ENTRIES, b"aa2".to_vec(), vec![2]);
        batch.put(CF_ENTRIES, b"ab1".to_vec(), vec![3]);
        backend.write(batch).unwrap();

        let rows = backend.scan_prefix(CF_ENTRIES, b"aa").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].1, vec![2]);
    }

    #[test]
    fn test_due_ids_stop_at_now() {
        let storage = Storage::in_memory();
        let now = Utc::now();
        let (early, due, later) = (Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7());

        let mut batch = WriteBatch::new();
        batch.put(CF_DISPATCH_QUEUE, due_key(now, due), Vec::new());
        batch.put(CF_DISPATCH_QUEUE, due_key(now + chrono::Duration::seconds(1), later), Vec::new());
        batch.put(CF_DISPATCH_QUEUE, due_key(now - chrono::Duration::days(400), early), Vec::new());
        storage.write(batch).unwrap();

        assert_eq!(storage.due_ids(CF_DISPATCH_QUEUE, now, 10).unwrap(), vec![early, due]);
        assert_eq!(storage.due_ids(CF_DISPATCH_QUEUE, now, 1).unwrap(), vec![early]);
    }

    #[test]
    fn test_uuid_v7_floor_bounds_ids_by_time() {
        let before = Utc::now();
        let id = Uuid::now_v7();
        assert!(uuid_v7_floor(before) <= id);
        assert!(uuid_v7_floor(before + chrono::Duration::seconds(1)) > id);

        let minted = uuid_v7_time(&id).unwrap();
        assert!(minted.timestamp_millis() >= before.timestamp_millis());
        assert!(minted <= Utc::now());
    }

    #[test]
    fn test_prefix_end() {
        assert_eq!(prefix_end(b"ab"), b"ac".to_vec());
        assert_eq!(prefix_end(&[1, 0xff]), vec![2]);
        assert!(prefix_end(&[0xff, 0xff]).is_empty());
    }

    #[test]
    fn test_wallet_entries_stay_per_wallet() {
        let storage = Storage::in_memory();
        let tenant = TenantId::new();
        let main = WalletRef::main(tenant);
        let e_credit = WalletRef::e_credit(tenant);

        let mut batch = WriteBatch::new();
        Storage::stage_entry(&mut batch, &entry(main, 5)).unwrap();
        Storage::stage_entry(&mut batch, &entry(main, 7)).unwrap();
        Storage::stage_entry(&mut batch, &entry(e_credit, 9)).unwrap();
        storage.write(batch).unwrap();

        let entries = storage.wallet_entries(&main).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].amount, Decimal::from(5));
        assert_eq!(storage.wallet_entries(&e_credit).unwrap().len(), 1);
    }

    #[cfg(feature = "rocksdb")]
    #[test]
    fn test_rocksdb_round_trip() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.backend = StorageBackend::RocksDb;

        let storage = Storage::open(&config).unwrap();
        let wallet = WalletRef::main(TenantId::new());
        let mut batch = WriteBatch::new();
        Storage::stage_entry(&mut batch, &entry(wallet, 3)).unwrap();
        storage.write(batch).unwrap();

        assert_eq!(storage.wallet_entries(&wallet).unwrap().len(), 1);
    }
}
