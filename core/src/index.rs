//! Append-only vector index: a packed little-endian float32 matrix with an
//! aligned JSONL metadata log and a `dim` sidecar.
//!
//! Durability contract: a vector is written and flushed before its metadata
//! line is appended, so a crash can only leave `vectors.bin` longer than
//! `metadata.jsonl`. Opening the index truncates the matrix back to the
//! metadata length, which restores the 1:1 alignment invariant.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use memmap2::Mmap;
use serde::Deserialize;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::error::MemoryBankError;
use crate::error::Result;
use crate::models::Chunk;
use crate::models::ChunkKey;
use crate::models::SourceType;
use crate::oracle::Oracle;
use crate::oracle::with_retry;
use crate::storage::Store;

const VECTORS_FILE: &str = "vectors.bin";
const METADATA_FILE: &str = "metadata.jsonl";
const DIM_FILE: &str = "dim";

/// Inserts per durability flush during a build.
const FLUSH_EVERY: usize = 64;
/// Texts per embedding request.
const EMBED_BATCH: usize = 16;

/// Metadata record aligned 1:1 with a row of `vectors.bin`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub session_id: String,
    pub chunk_index: u32,
    pub source_type: SourceType,
    pub start_ts: f64,
    pub quality: f64,
    pub text: String,
    pub token_count: u32,
}

impl IndexRecord {
    pub fn key(&self) -> ChunkKey {
        ChunkKey {
            session_id: self.session_id.clone(),
            chunk_index: self.chunk_index,
            source_type: self.source_type,
        }
    }

    fn from_chunk(chunk: &Chunk) -> Self {
        // Keep a bounded excerpt; search results do not need full bodies.
        let text: String = chunk.text.chars().take(500).collect();
        Self {
            session_id: chunk.session_id.clone(),
            chunk_index: chunk.chunk_index,
            source_type: chunk.source_type,
            start_ts: chunk.start_ts,
            quality: chunk.quality,
            text,
            token_count: chunk.token_count,
        }
    }
}

/// One scored row from a search pass.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub score: f32,
    pub record: IndexRecord,
}

#[derive(Debug)]
pub struct VectorIndex {
    dir: PathBuf,
}

impl VectorIndex {
    /// Open (or create) the index directory and run crash recovery.
    pub fn open(dir: &Path) -> Result<VectorIndex> {
        std::fs::create_dir_all(dir)?;
        let index = VectorIndex {
            dir: dir.to_path_buf(),
        };
        index.recover()?;
        Ok(index)
    }

    fn vectors_path(&self) -> PathBuf {
        self.dir.join(VECTORS_FILE)
    }

    fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    fn dim_path(&self) -> PathBuf {
        self.dir.join(DIM_FILE)
    }

    /// Fixed vector dimension, set by the first insert.
    pub fn dim(&self) -> Option<usize> {
        let raw = std::fs::read_to_string(self.dim_path()).ok()?;
        raw.trim().parse().ok()
    }

    /// Number of aligned (vector, metadata) pairs.
    pub fn len(&self) -> Result<usize> {
        Ok(self.count_metadata_lines()?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn count_metadata_lines(&self) -> Result<usize> {
        let file = match File::open(self.metadata_path()) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        let mut count = 0usize;
        for line in BufReader::new(file).lines() {
            if !line?.trim().is_empty() {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Truncate `vectors.bin` to the metadata length after a crash left a
    /// dangling vector, restoring alignment.
    fn recover(&self) -> Result<()> {
        let Some(dim) = self.dim() else {
            return Ok(());
        };
        let vectors_path = self.vectors_path();
        let Ok(meta) = vectors_path.metadata() else {
            return Ok(());
        };
        let expected = self.count_metadata_lines()? as u64 * dim as u64 * 4;
        if meta.len() > expected {
            warn!(
                "recovering index: truncating {} from {} to {expected} bytes",
                vectors_path.display(),
                meta.len()
            );
            let file = OpenOptions::new().write(true).open(&vectors_path)?;
            file.set_len(expected)?;
            file.sync_all()?;
        }
        Ok(())
    }

    /// Chunk keys already present in the metadata log.
    pub fn indexed_keys(&self) -> Result<HashSet<ChunkKey>> {
        let mut keys = HashSet::new();
        self.for_each_record(|_, record| {
            keys.insert(record.key());
        })?;
        Ok(keys)
    }

    fn for_each_record(&self, mut f: impl FnMut(usize, IndexRecord)) -> Result<()> {
        let file = match File::open(self.metadata_path()) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: IndexRecord = serde_json::from_str(&line)
                .map_err(|err| MemoryBankError::corrupt(self.metadata_path(), err))?;
            f(idx, record);
        }
        Ok(())
    }

    /// Remove all index files to force a rebuild from scratch.
    pub fn clear(&self) -> Result<()> {
        for path in [self.vectors_path(), self.metadata_path(), self.dim_path()] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Dirty iff any chunk log is newer than the metadata log, or any chunk
    /// key is missing from the index.
    pub fn is_stale(&self, store: &Store) -> Result<bool> {
        let metadata_path = self.metadata_path();
        if !metadata_path.exists() {
            // Nothing built yet; a fresh build is not "stale".
            return Ok(false);
        }
        let index_mtime = metadata_path.metadata()?.modified()?;
        if let Some(chunk_mtime) = store.latest_chunk_mtime()
            && chunk_mtime > index_mtime
        {
            return Ok(true);
        }

        let indexed = self.indexed_keys()?;
        let mut missing = false;
        store.for_each_chunk(|chunk| {
            if !indexed.contains(&chunk.key()) {
                missing = true;
            }
        })?;
        Ok(missing)
    }

    /// Whether the index can only be repaired by a full rebuild: a session
    /// with some but not all of its chunks indexed (presence is
    /// all-or-nothing per session), or an indexed row whose chunk no longer
    /// exists in the store.
    fn needs_full_rebuild(&self, store: &Store) -> Result<bool> {
        let indexed = self.indexed_keys()?;
        if indexed.is_empty() {
            return Ok(false);
        }
        let mut store_keys: HashSet<ChunkKey> = HashSet::new();
        let mut totals: HashMap<(String, SourceType), (usize, usize)> = HashMap::new();
        store.for_each_chunk(|chunk| {
            let key = chunk.key();
            let entry = totals
                .entry((chunk.session_id.clone(), chunk.source_type))
                .or_insert((0, 0));
            entry.0 += 1;
            if indexed.contains(&key) {
                entry.1 += 1;
            }
            store_keys.insert(key);
        })?;

        if totals
            .values()
            .any(|(total, present)| *present > 0 && present < total)
        {
            return Ok(true);
        }
        Ok(indexed.iter().any(|key| !store_keys.contains(key)))
    }

    /// Cosine search over the memory-mapped matrix. The query is normalized;
    /// stored vectors were normalized on insert, so a dot product is the
    /// cosine. Metadata is parsed only for the winning rows.
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<IndexHit>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let Some(dim) = self.dim() else {
            return Ok(Vec::new());
        };
        if query.len() != dim {
            return Err(MemoryBankError::IndexDimMismatch {
                expected: dim,
                actual: query.len(),
            });
        }

        let vectors_file = match File::open(self.vectors_path()) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        if vectors_file.metadata()?.len() == 0 {
            return Ok(Vec::new());
        }
        // Read-only mapping; rebuilds swap whole files, so a live search
        // never observes a partially rewritten matrix.
        let mmap = unsafe { Mmap::map(&vectors_file)? };

        let row_bytes = dim * 4;
        let rows = mmap.len() / row_bytes;
        let query = normalize(query);

        // Bounded min-heap of the best `top_k` rows.
        let mut heap: std::collections::BinaryHeap<std::cmp::Reverse<ScoredRow>> =
            std::collections::BinaryHeap::with_capacity(top_k + 1);
        for row in 0..rows {
            let offset = row * row_bytes;
            let score = dot_le(&mmap[offset..offset + row_bytes], &query);
            heap.push(std::cmp::Reverse(ScoredRow { score, row }));
            if heap.len() > top_k {
                heap.pop();
            }
        }

        let mut winners: Vec<ScoredRow> = heap.into_iter().map(|rev| rev.0).collect();
        winners.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.row.cmp(&b.row)));

        let wanted: HashSet<usize> = winners.iter().map(|w| w.row).collect();
        let mut records: HashMap<usize, IndexRecord> = HashMap::new();
        self.for_each_record(|idx, record| {
            if wanted.contains(&idx) {
                records.insert(idx, record);
            }
        })?;

        let mut hits = Vec::with_capacity(winners.len());
        for winner in winners {
            if let Some(record) = records.remove(&winner.row) {
                hits.push(IndexHit {
                    score: winner.score,
                    record,
                });
            }
        }
        Ok(hits)
    }

    fn writer(&self, suffix: &str) -> Result<IndexWriter> {
        IndexWriter::create(
            self.dir.join(format!("{VECTORS_FILE}{suffix}")),
            self.dir.join(format!("{METADATA_FILE}{suffix}")),
            self.dir.join(format!("{DIM_FILE}{suffix}")),
            self.dim(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ScoredRow {
    score: f32,
    row: usize,
}

impl Eq for ScoredRow {}

impl Ord for ScoredRow {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .total_cmp(&other.score)
            .then(other.row.cmp(&self.row))
    }
}

impl PartialOrd for ScoredRow {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Append-side handle used during a build: keeps both files open, enforces
/// the vector-then-metadata write order, and flushes every
/// [`FLUSH_EVERY`] inserts.
struct IndexWriter {
    vectors: File,
    metadata: File,
    dim_path: PathBuf,
    dim: Option<usize>,
    since_flush: usize,
}

impl IndexWriter {
    fn create(
        vectors_path: PathBuf,
        metadata_path: PathBuf,
        dim_path: PathBuf,
        dim: Option<usize>,
    ) -> Result<Self> {
        let vectors = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&vectors_path)?;
        let metadata = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&metadata_path)?;
        Ok(Self {
            vectors,
            metadata,
            dim_path,
            dim,
            since_flush: 0,
        })
    }

    fn append(&mut self, vector: &[f32], record: &IndexRecord) -> Result<()> {
        match self.dim {
            None => {
                std::fs::write(&self.dim_path, format!("{}\n", vector.len()))?;
                self.dim = Some(vector.len());
            }
            Some(dim) if dim != vector.len() => {
                return Err(MemoryBankError::IndexDimMismatch {
                    expected: dim,
                    actual: vector.len(),
                });
            }
            Some(_) => {}
        }

        let normalized = normalize(vector);
        let mut bytes = Vec::with_capacity(normalized.len() * 4);
        for value in &normalized {
            bytes.extend_from_slice(&value.to_le_bytes());
        }

        // Vector first, durable, then the metadata line. A crash can only
        // leave the matrix longer than the log, which recovery truncates.
        self.vectors.write_all(&bytes)?;
        self.vectors.sync_data()?;

        let mut line = serde_json::to_string(record)
            .map_err(|err| MemoryBankError::corrupt(&self.dim_path, err))?;
        line.push('\n');
        self.metadata.write_all(line.as_bytes())?;

        self.since_flush += 1;
        if self.since_flush >= FLUSH_EVERY {
            self.metadata.sync_data()?;
            self.since_flush = 0;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        self.vectors.flush()?;
        self.vectors.sync_all()?;
        self.metadata.flush()?;
        self.metadata.sync_all()?;
        Ok(())
    }
}

fn normalize(vector: &[f32]) -> Vec<f32> {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter().map(|v| v / norm).collect()
    } else {
        vector.to_vec()
    }
}

/// Dot product of a packed little-endian row against a query vector.
fn dot_le(row: &[u8], query: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for (i, value) in query.iter().enumerate() {
        let offset = i * 4;
        let stored = f32::from_le_bytes([
            row[offset],
            row[offset + 1],
            row[offset + 2],
            row[offset + 3],
        ]);
        sum += stored * value;
    }
    sum
}

/// Build or incrementally update the index from every chunk in the store.
///
/// A partially indexed session, an orphaned index row, a dim mismatch, or
/// a corrupt metadata line forces a full rebuild into sibling files swapped
/// in atomically. Otherwise only missing chunks are embedded and appended.
pub async fn build_index<O: Oracle>(
    store: &Store,
    oracle: &O,
    cancel: &CancellationToken,
) -> Result<VectorIndex> {
    let index = VectorIndex::open(&store.index_dir())?;

    let needs_rebuild = match index.needs_full_rebuild(store) {
        Ok(rebuild) => rebuild,
        // Corrupt metadata: rebuild rather than error.
        Err(MemoryBankError::StorageCorrupt { .. }) => true,
        Err(err) => return Err(err),
    };

    if needs_rebuild {
        info!("vector index is stale; rebuilding");
        rebuild_index(store, oracle, cancel).await?;
        return VectorIndex::open(&store.index_dir());
    }

    let indexed = index.indexed_keys()?;
    let pending: Vec<Chunk> = {
        let mut pending = Vec::new();
        store.for_each_chunk(|chunk| {
            if !indexed.contains(&chunk.key()) {
                pending.push(chunk);
            }
        })?;
        pending
    };

    if pending.is_empty() {
        return Ok(index);
    }

    let mut writer = index.writer("")?;
    match embed_into(&mut writer, &pending, oracle, cancel).await {
        Ok(()) => {
            writer.finish()?;
            Ok(index)
        }
        Err(MemoryBankError::IndexDimMismatch { expected, actual }) => {
            // The embedding model changed dimension; rebuild everything.
            warn!("index dim changed ({expected} -> {actual}); rebuilding");
            writer.finish()?;
            rebuild_index(store, oracle, cancel).await?;
            VectorIndex::open(&store.index_dir())
        }
        Err(err) => {
            // Leave the on-disk state consistent and surface the error.
            writer.finish()?;
            VectorIndex::open(&store.index_dir())?;
            Err(err)
        }
    }
}

/// Full rebuild into `.new` sibling files, then an atomic swap.
pub async fn rebuild_index<O: Oracle>(
    store: &Store,
    oracle: &O,
    cancel: &CancellationToken,
) -> Result<()> {
    let dir = store.index_dir();
    std::fs::create_dir_all(&dir)?;
    for name in [VECTORS_FILE, METADATA_FILE, DIM_FILE] {
        let new_path = dir.join(format!("{name}.new"));
        if new_path.exists() {
            std::fs::remove_file(new_path)?;
        }
    }

    let index = VectorIndex {
        dir: dir.clone(),
    };
    let mut writer = IndexWriter::create(
        dir.join(format!("{VECTORS_FILE}.new")),
        dir.join(format!("{METADATA_FILE}.new")),
        dir.join(format!("{DIM_FILE}.new")),
        None,
    )?;

    let chunks = store.all_chunks()?;
    embed_into(&mut writer, &chunks, oracle, cancel).await?;
    writer.finish()?;

    index.clear()?;
    for name in [VECTORS_FILE, METADATA_FILE, DIM_FILE] {
        let new_path = dir.join(format!("{name}.new"));
        if new_path.exists() {
            std::fs::rename(new_path, dir.join(name))?;
        }
    }
    Ok(())
}

async fn embed_into<O: Oracle>(
    writer: &mut IndexWriter,
    chunks: &[Chunk],
    oracle: &O,
    cancel: &CancellationToken,
) -> Result<()> {
    for batch in chunks.chunks(EMBED_BATCH) {
        if cancel.is_cancelled() {
            return Err(MemoryBankError::Cancelled);
        }
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let vectors = with_retry(|| oracle.embed(&texts)).await?;
        if vectors.len() != batch.len() {
            return Err(MemoryBankError::Oracle(crate::oracle::OracleError::Malformed(
                format!("embedded {} texts, got {} vectors", batch.len(), vectors.len()),
            )));
        }
        for (chunk, vector) in batch.iter().zip(vectors.iter()) {
            writer.append(vector, &IndexRecord::from_chunk(chunk))?;
        }
    }
    Ok(())
}
