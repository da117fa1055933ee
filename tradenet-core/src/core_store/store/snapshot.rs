/*
    snapshot.rs - PersistenceBridge between the in-memory stores and disk

    Writes three independently restorable blobs into the data directory:
    - sequence_map.bin      SequenceTracker entries (replay protection)
    - protected_store.bin   MutableRecordStore records
    - append_only.bin       AppendOnlyLedger payloads and local publication marks

    Blob layout:
    magic "TRDNSNAP" (8) | format version u16 | crc32 of body u32 | body length u32 | bincode body

    Features:
    - Atomic writes (temp file, fsync, rename); the sequence map also fsyncs its directory
    - A missing blob restores as empty (fresh node)
    - A blob that exists but is unreadable, truncated, corrupt or from another
      format version is a PersistenceReadFailure, which aborts startup
*/

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use super::append_only::AppendOnlyLedger;
use super::errors::{StoreError, StoreResult};
use super::mutable_store::MutableRecordStore;
use super::sequence_tracker::{SequenceEntry, SequenceTracker};
use crate::core_store::clock::Clock;
use crate::core_store::model::hash::PayloadHash;
use crate::core_store::model::payload::PersistablePayload;
use crate::core_store::model::record::ProtectedRecord;

pub const SEQUENCE_MAP_FILE: &str = "sequence_map.bin";
pub const PROTECTED_STORE_FILE: &str = "protected_store.bin";
pub const APPEND_ONLY_FILE: &str = "append_only.bin";

const MAGIC: [u8; 8] = *b"TRDNSNAP";
pub const FORMAT_VERSION: u16 = 2;
const HEADER_LEN: usize = 8 + 2 + 4 + 4;

#[derive(Debug, Default, Serialize, Deserialize)]
struct SequenceMapBlob {
    entries: Vec<(PayloadHash, SequenceEntry)>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProtectedStoreBlob {
    records: Vec<ProtectedRecord>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AppendOnlyBlob {
    payloads: Vec<PersistablePayload>,
    /// Identities this node published
    local: Vec<PayloadHash>,
}

/// Frame a serializable body into a blob
pub fn encode_blob<T: Serialize>(body: &T) -> StoreResult<Vec<u8>> {
    let body = bincode::serialize(body)?;
    let len = u32::try_from(body.len())
        .map_err(|_| StoreError::PersistenceWriteFailure("blob body exceeds 4 GiB".to_string()))?;

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
    out.extend_from_slice(&crc32fast::hash(&body).to_be_bytes());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Check the frame of a blob and decode its body
pub fn decode_blob<T: DeserializeOwned>(name: &str, bytes: &[u8]) -> StoreResult<T> {
    let fail = |reason: String| StoreError::PersistenceReadFailure(format!("{}: {}", name, reason));

    if bytes.len() < HEADER_LEN {
        return Err(fail(format!("truncated header ({} bytes)", bytes.len())));
    }
    if bytes[..8] != MAGIC {
        return Err(fail("bad magic".to_string()));
    }

    let version = u16::from_be_bytes([bytes[8], bytes[9]]);
    if version != FORMAT_VERSION {
        return Err(fail(format!("unsupported format version {}", version)));
    }

    let crc = u32::from_be_bytes([bytes[10], bytes[11], bytes[12], bytes[13]]);
    let len = u32::from_be_bytes([bytes[14], bytes[15], bytes[16], bytes[17]]) as usize;
    let body = &bytes[HEADER_LEN..];
    if body.len() != len {
        return Err(fail(format!("body length {} does not match header {}", body.len(), len)));
    }
    if crc32fast::hash(body) != crc {
        return Err(fail("checksum mismatch".to_string()));
    }

    bincode::deserialize(body).map_err(|e| fail(format!("decode failed: {}", e)))
}

/// What a restore loaded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub sequences: usize,
    pub records: usize,
    pub appended: usize,
}

impl RestoreReport {
    pub fn is_fresh(&self) -> bool {
        self.sequences == 0 && self.records == 0 && self.appended == 0
    }
}

pub struct PersistenceBridge {
    data_dir: PathBuf,
    store: Arc<MutableRecordStore>,
    ledger: Arc<AppendOnlyLedger>,
    tracker: Arc<SequenceTracker>,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
}

impl PersistenceBridge {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        store: Arc<MutableRecordStore>,
        ledger: Arc<AppendOnlyLedger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let tracker = store.tracker().clone();
        Self {
            data_dir: data_dir.into(),
            store,
            ledger,
            tracker,
            clock,
            write_lock: Mutex::new(()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Write all three blobs. Every blob is attempted; the first failure is returned.
    pub fn snapshot(&self) -> StoreResult<()> {
        let timer = crate::metrics::Timer::new("tradenet_snapshot_duration_seconds");
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let results = [
            self.write_sequences(),
            self.write_records(),
            self.write_ledger(),
        ];
        let elapsed = timer.stop();

        match results.into_iter().find_map(Result::err) {
            Some(err) => Err(err),
            None => {
                debug!(
                    records = self.store.len(),
                    appended = self.ledger.len(),
                    sequences = self.tracker.len(),
                    elapsed_ms = (elapsed * 1000.0) as u64,
                    "Snapshot written"
                );
                Ok(())
            }
        }
    }

    /// Write only the sequence map
    pub fn snapshot_sequences(&self) -> StoreResult<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.write_sequences()
    }

    /// Load all blobs into the (empty) stores
    pub fn restore(&self) -> StoreResult<RestoreReport> {
        let sequences: SequenceMapBlob = self.read_blob(SEQUENCE_MAP_FILE)?.unwrap_or_default();
        let records: ProtectedStoreBlob = self.read_blob(PROTECTED_STORE_FILE)?.unwrap_or_default();
        let payloads: AppendOnlyBlob = self.read_blob(APPEND_ONLY_FILE)?.unwrap_or_default();

        let report = RestoreReport {
            sequences: sequences.entries.len(),
            records: 0,
            appended: 0,
        };

        // Sequences first: record restore raises lagging entries
        self.tracker.restore(sequences.entries.into_iter().collect());
        let now = self.clock.now_millis();
        let records = self.store.restore(records.records, now)?;
        let appended = self.ledger.restore(payloads.payloads, payloads.local)?;

        let report = RestoreReport {
            records,
            appended,
            ..report
        };
        info!(
            sequences = report.sequences,
            records = report.records,
            appended = report.appended,
            data_dir = %self.data_dir.display(),
            "State restored"
        );
        Ok(report)
    }

    fn write_sequences(&self) -> StoreResult<()> {
        let mut entries: Vec<_> = self.tracker.entries().into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let blob = encode_blob(&SequenceMapBlob { entries })?;
        self.write_blob(SEQUENCE_MAP_FILE, &blob, true)
    }

    fn write_records(&self) -> StoreResult<()> {
        let blob = encode_blob(&ProtectedStoreBlob {
            records: self.store.snapshot_records(),
        })?;
        self.write_blob(PROTECTED_STORE_FILE, &blob, false)
    }

    fn write_ledger(&self) -> StoreResult<()> {
        let blob = encode_blob(&AppendOnlyBlob {
            payloads: self.ledger.payloads(),
            local: self.ledger.local_identities(),
        })?;
        self.write_blob(APPEND_ONLY_FILE, &blob, false)
    }

    fn write_blob(&self, name: &'static str, bytes: &[u8], sync_dir: bool) -> StoreResult<()> {
        let result = self.write_atomically(name, bytes, sync_dir);
        if let Err(err) = &result {
            warn!(blob = name, error = %err, "Snapshot write failed, will retry");
            crate::metrics::snapshot_failed(name);
        }
        result
    }

    fn write_atomically(&self, name: &str, bytes: &[u8], sync_dir: bool) -> StoreResult<()> {
        let fail = |e: std::io::Error| StoreError::PersistenceWriteFailure(format!("{}: {}", name, e));

        fs::create_dir_all(&self.data_dir).map_err(fail)?;
        let temp_path = self.data_dir.join(format!("{}.tmp", name));
        let final_path = self.data_dir.join(name);

        let mut file = File::create(&temp_path).map_err(fail)?;
        file.write_all(bytes).map_err(fail)?;
        file.sync_all().map_err(fail)?;
        drop(file);

        fs::rename(&temp_path, &final_path).map_err(fail)?;

        #[cfg(unix)]
        if sync_dir {
            File::open(&self.data_dir).and_then(|dir| dir.sync_all()).map_err(fail)?;
        }
        #[cfg(not(unix))]
        let _ = sync_dir;

        Ok(())
    }

    fn read_blob<T: DeserializeOwned>(&self, name: &str) -> StoreResult<Option<T>> {
        let path = self.data_dir.join(name);
        match fs::read(&path) {
            Ok(bytes) => decode_blob(name, &bytes).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(blob = name, "No snapshot blob, starting empty");
                Ok(None)
            }
            Err(e) => Err(StoreError::PersistenceReadFailure(format!("{}: {}", name, e))),
        }
    }
}
