//! Checkpoint blobs and their storage.
//!
//! A checkpoint is one self-describing byte blob:
//!
//! ```text
//! "SIMSCKPT" | version: u32 LE
//! | meta_len: u64 LE | metadata (JSON)
//! | weights_len: u64 LE | network record (burn, full precision)
//! | optim_len: u64 LE | optimizer record (opaque, may be empty)
//! | SHA-256 of everything above
//! ```
//!
//! The metadata carries the gene schema and label codec, so a blob that
//! decodes is always usable for inference on its own.

use crate::data::labels::LabelCodec;
use crate::data::schema::GeneSchema;
use crate::error::{Result, SimsError};
use crate::model::architecture::SequentialAttentionNetwork;
use crate::model::NetworkConfig;
use crate::training::scheduler::LearningRateScheduler;
use burn::prelude::*;
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Record, Recorder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Leading bytes of every checkpoint blob
pub const MAGIC: &[u8; 8] = b"SIMSCKPT";
/// Current blob layout version
pub const FORMAT_VERSION: u32 = 1;
const DIGEST_LEN: usize = 32;

type BlobRecorder = BinBytesRecorder<FullPrecisionSettings>;

/// Storage key updated after every epoch
pub const LAST_KEY: &str = "last";
/// Storage key updated when the monitored metric improves
pub const BEST_KEY: &str = "best";

/// Where training stands when a checkpoint is taken
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingProgress {
    /// Completed epochs
    pub epochs_completed: usize,
    /// Optimizer steps taken
    pub global_step: usize,
    /// 1-based epoch that produced the best monitored value
    pub best_epoch: Option<usize>,
    /// Best monitored value so far
    pub best_score: Option<f64>,
    pub epochs_without_improvement: usize,
    /// Learning rate used in the last epoch
    pub learning_rate: f64,
    /// Monitored value per completed epoch
    pub history: Vec<f64>,
}

/// Everything except the tensors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Crate version that wrote the blob
    pub version: String,
    pub schema: GeneSchema,
    pub labels: LabelCodec,
    pub network: NetworkConfig,
    pub progress: TrainingProgress,
    pub scheduler: Option<LearningRateScheduler>,
    /// Seconds since the Unix epoch
    pub timestamp: u64,
}

impl CheckpointMeta {
    /// Metadata stamped with the current time
    pub fn new(
        schema: GeneSchema,
        labels: LabelCodec,
        network: NetworkConfig,
        progress: TrainingProgress,
        scheduler: Option<LearningRateScheduler>,
    ) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            version: crate::VERSION.to_string(),
            schema,
            labels,
            network,
            progress,
            scheduler,
            timestamp,
        }
    }

    /// Schema, label space and architecture must agree
    pub fn validate(&self) -> Result<()> {
        if self.network.input_dim != self.schema.len() {
            return Err(SimsError::CheckpointCorruption(format!(
                "network expects {} features but schema has {} genes",
                self.network.input_dim,
                self.schema.len()
            )));
        }
        if self.network.output_dim != self.labels.space().len() {
            return Err(SimsError::CheckpointCorruption(format!(
                "network has {} outputs but label space has {} classes",
                self.network.output_dim,
                self.labels.space().len()
            )));
        }
        self.network
            .validate()
            .map_err(|e| SimsError::CheckpointCorruption(e.to_string()))
    }
}

/// A decoded checkpoint
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub meta: CheckpointMeta,
    /// Network record bytes
    pub weights: Vec<u8>,
    /// Optimizer record bytes; empty when not saved
    pub optimizer: Vec<u8>,
}

/// Serialize any burn record to bytes
pub fn encode_record<B: Backend, R: Record<B>>(record: R) -> Result<Vec<u8>> {
    Recorder::<B>::record(&BlobRecorder::default(), record, ())
        .map_err(|e| SimsError::Storage(format!("failed to record: {e}")))
}

/// Deserialize a burn record from bytes
pub fn decode_record<B: Backend, R: Record<B>>(bytes: &[u8], device: &B::Device) -> Result<R> {
    Recorder::<B>::load(&BlobRecorder::default(), bytes.to_vec(), device)
        .map_err(|e| SimsError::CheckpointCorruption(format!("unreadable record: {e}")))
}

impl Checkpoint {
    /// Capture a network's weights
    pub fn from_network<B: Backend>(
        network: &SequentialAttentionNetwork<B>,
        meta: CheckpointMeta,
        optimizer: Vec<u8>,
    ) -> Result<Self> {
        let weights = encode_record::<B, _>(network.clone().into_record())?;
        Ok(Self {
            meta,
            weights,
            optimizer,
        })
    }

    /// Rebuild the network on `device`
    pub fn network<B: Backend>(&self, device: &B::Device) -> Result<SequentialAttentionNetwork<B>> {
        let network = self
            .meta
            .network
            .init::<B>(device)
            .map_err(|e| SimsError::CheckpointCorruption(e.to_string()))?;
        let record = decode_record::<B, _>(&self.weights, device)?;
        Ok(network.load_record(record))
    }

    /// Serialize to a blob
    pub fn encode(&self) -> Result<Vec<u8>> {
        let meta = serde_json::to_vec(&self.meta)
            .map_err(|e| SimsError::Storage(format!("failed to serialize metadata: {e}")))?;

        let mut blob = Vec::with_capacity(
            MAGIC.len() + 4 + 24 + meta.len() + self.weights.len() + self.optimizer.len() + DIGEST_LEN,
        );
        blob.extend_from_slice(MAGIC);
        blob.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        for section in [meta.as_slice(), self.weights.as_slice(), self.optimizer.as_slice()] {
            blob.extend_from_slice(&(section.len() as u64).to_le_bytes());
            blob.extend_from_slice(section);
        }
        let digest = Sha256::digest(&blob);
        blob.extend_from_slice(&digest);
        Ok(blob)
    }

    /// Parse and validate a blob
    pub fn decode(blob: &[u8]) -> Result<Self> {
        let corrupt = |msg: &str| SimsError::CheckpointCorruption(msg.to_string());

        if blob.len() < MAGIC.len() + 4 + DIGEST_LEN {
            return Err(corrupt("blob too short"));
        }
        if &blob[..MAGIC.len()] != MAGIC {
            return Err(corrupt("bad magic"));
        }

        let (body, digest) = blob.split_at(blob.len() - DIGEST_LEN);
        if Sha256::digest(body).as_slice() != digest {
            return Err(corrupt("checksum mismatch"));
        }

        let mut cursor = SectionReader { buf: body, pos: MAGIC.len() };
        let version = u32::from_le_bytes(cursor.take_array::<4>()?);
        if version != FORMAT_VERSION {
            return Err(SimsError::CheckpointCorruption(format!(
                "unsupported format version {version}, expected {FORMAT_VERSION}"
            )));
        }

        let meta_bytes = cursor.section()?;
        let weights = cursor.section()?.to_vec();
        let optimizer = cursor.section()?.to_vec();
        if cursor.pos != body.len() {
            return Err(corrupt("trailing bytes after optimizer section"));
        }

        let meta: CheckpointMeta = serde_json::from_slice(meta_bytes)
            .map_err(|e| SimsError::CheckpointCorruption(format!("bad metadata: {e}")))?;
        meta.validate()?;
        if weights.is_empty() {
            return Err(corrupt("missing weights"));
        }

        Ok(Self {
            meta,
            weights,
            optimizer,
        })
    }
}

struct SectionReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> SectionReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| SimsError::CheckpointCorruption("section runs past end of blob".to_string()))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn section(&mut self) -> Result<&'a [u8]> {
        let len = u64::from_le_bytes(self.take_array::<8>()?);
        let len = usize::try_from(len)
            .map_err(|_| SimsError::CheckpointCorruption("section length overflows".to_string()))?;
        self.take(len)
    }
}

/// Durable key-value storage for checkpoint blobs.
///
/// `put` must be atomic: a reader sees either the previous blob or the new
/// one, never a partial write.
pub trait CheckpointStore: Send + Sync {
    /// Store a blob under `key`
    fn put(&self, key: &str, blob: &[u8]) -> Result<()>;

    /// Blob under `key`, if any
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

fn check_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
        return Err(SimsError::Storage(format!("invalid checkpoint key {key:?}")));
    }
    Ok(())
}

/// Encode and store a checkpoint
pub fn save_checkpoint(store: &dyn CheckpointStore, key: &str, checkpoint: &Checkpoint) -> Result<()> {
    let blob = checkpoint.encode()?;
    store.put(key, &blob)?;
    debug!(
        "Stored checkpoint {:?} at epoch {} ({} bytes)",
        key,
        checkpoint.meta.progress.epochs_completed,
        blob.len()
    );
    Ok(())
}

/// Fetch and decode a checkpoint
pub fn load_checkpoint(store: &dyn CheckpointStore, key: &str) -> Result<Checkpoint> {
    let blob = store
        .get(key)?
        .ok_or_else(|| SimsError::Storage(format!("no checkpoint stored under {key:?}")))?;
    Checkpoint::decode(&blob)
}

/// Directory of `<key>.ckpt` files written via temp file and rename
#[derive(Debug, Clone)]
pub struct FsCheckpointStore {
    dir: PathBuf,
}

impl FsCheckpointStore {
    /// Create new store, creating the directory if needed
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| SimsError::Storage(format!("failed to create {dir:?}: {e}")))?;
        Ok(Self { dir })
    }

    /// File backing `key`
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.ckpt"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl CheckpointStore for FsCheckpointStore {
    fn put(&self, key: &str, blob: &[u8]) -> Result<()> {
        check_key(key)?;
        let path = self.path_for(key);
        let tmp = self.dir.join(format!("{key}.ckpt.tmp"));
        let storage = |e: std::io::Error| SimsError::Storage(format!("failed to write {path:?}: {e}"));

        let mut file = File::create(&tmp).map_err(storage)?;
        file.write_all(blob).map_err(storage)?;
        file.sync_all().map_err(storage)?;
        drop(file);
        fs::rename(&tmp, &path).map_err(storage)?;

        // persist the rename itself where the platform allows it
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }
        info!("Saved checkpoint: {:?}", path);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        check_key(key)?;
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SimsError::Storage(format!("failed to read {path:?}: {e}"))),
        }
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .blobs
            .lock()
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn put(&self, key: &str, blob: &[u8]) -> Result<()> {
        check_key(key)?;
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| SimsError::Storage("checkpoint store lock poisoned".to_string()))?;
        blobs.insert(key.to_string(), blob.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        check_key(key)?;
        let blobs = self
            .blobs
            .lock()
            .map_err(|_| SimsError::Storage("checkpoint store lock poisoned".to_string()))?;
        Ok(blobs.get(key).cloned())
    }
}
