//! Fixed-capacity pool of sessions with LRU eviction to disk.
//!
//! Each slot holds at most one resident session. When every slot is
//! occupied and another session is needed, the least recently used one is
//! serialized to a per-slot file and its slot reused; `get` lazily reloads
//! evicted sessions by id. Handles returned to callers are `&mut` borrows,
//! so the borrow checker enforces the "valid until the next pool call"
//! contract.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::params::SessionParams;
use crate::session::Session;

/// Prefix shared by every slot file, completed by the pool name and id.
const SLOT_FILE_PREFIX: &str = "LMInferencePool_";

struct Slot {
    session: Option<Session>,
    id: u64,
    /// Logical access timestamp; ties would make the LRU victim ambiguous,
    /// so a counter is used instead of wall-clock time.
    last_access: u64,
    weights_path: PathBuf,
}

impl Slot {
    fn vacant() -> Self {
        Self {
            session: None,
            id: 0,
            last_access: 0,
            weights_path: PathBuf::new(),
        }
    }

    fn is_free(&self) -> bool {
        self.session.is_none()
    }

    fn reset(&mut self) {
        self.session = None;
        self.id = 0;
    }
}

/// A bounded set of inference sessions addressed by numeric id.
pub struct InferencePool {
    slots: Vec<Slot>,
    pool_name: String,
    dir: PathBuf,
    clock: u64,
}

impl InferencePool {
    /// Create a pool writing slot files to the process working directory.
    ///
    /// The pool name must be unique among pools sharing that directory.
    pub fn new(size: usize, pool_name: impl Into<String>, clean_up_on_start: bool) -> Result<Self> {
        let dir = std::env::current_dir()?;
        Self::with_directory(dir, size, pool_name, clean_up_on_start)
    }

    /// Create a pool with an explicit slot-file directory.
    pub fn with_directory(
        dir: impl Into<PathBuf>,
        size: usize,
        pool_name: impl Into<String>,
        clean_up_on_start: bool,
    ) -> Result<Self> {
        let pool = Self {
            slots: (0..size.max(1)).map(|_| Slot::vacant()).collect(),
            pool_name: pool_name.into(),
            dir: dir.into(),
            clock: 0,
        };
        if clean_up_on_start {
            pool.cleanup()?;
        }
        Ok(pool)
    }

    /// Construct a fresh session in a free (or freed-up) slot.
    pub fn create(
        &mut self,
        id: u64,
        weights_path: &Path,
        params: SessionParams,
    ) -> Result<&mut Session> {
        let idx = self.free_slot();
        let session = Session::open(weights_path, params)?;
        self.touch(idx);
        let slot = &mut self.slots[idx];
        slot.id = id;
        slot.weights_path = weights_path.to_path_buf();
        Ok(slot.session.insert(session))
    }

    /// Fetch a session by id, reloading it from its slot file if it was
    /// evicted. Fails with [`Error::NotFound`] when the id is unknown.
    pub fn get(&mut self, id: u64) -> Result<&mut Session> {
        let idx = match self.resident_index(id) {
            Some(idx) => {
                self.touch(idx);
                idx
            }
            None => {
                if !self.slot_filename(id).exists() {
                    return Err(Error::NotFound(id));
                }
                let idx = self.free_slot();
                if let Err(err) = self.load_slot(idx, id) {
                    self.slots[idx].reset();
                    return Err(err);
                }
                idx
            }
        };
        self.slots[idx]
            .session
            .as_mut()
            .ok_or(Error::NotFound(id))
    }

    /// [`InferencePool::get`], creating the session on a miss.
    pub fn get_or_create(
        &mut self,
        id: u64,
        weights_path: &Path,
        params: SessionParams,
    ) -> Result<&mut Session> {
        let known = self.resident_index(id).is_some() || self.slot_filename(id).exists();
        if known {
            self.get(id)
        } else {
            self.create(id, weights_path, params)
        }
    }

    /// Drop the resident session and its slot file. Unknown ids are not an
    /// error.
    pub fn delete(&mut self, id: u64) {
        if let Some(idx) = self.resident_index(id) {
            self.slots[idx].reset();
        }
        let _ = fs::remove_file(self.slot_filename(id));
    }

    /// Persist every resident session without evicting any.
    pub fn store_all(&mut self) -> Result<()> {
        for idx in 0..self.slots.len() {
            if self.slots[idx].is_free() {
                continue;
            }
            self.store_slot(idx)?;
        }
        Ok(())
    }

    /// Ids currently resident in memory.
    pub fn active_ids(&self) -> Vec<u64> {
        self.slots
            .iter()
            .filter(|slot| !slot.is_free())
            .map(|slot| slot.id)
            .collect()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Remove every slot file this pool ever wrote.
    pub fn cleanup(&self) -> Result<()> {
        self.cleanup_matching(|_| true)
    }

    /// Remove slot files whose last write is older than `max_age`.
    pub fn cleanup_older_than(&self, max_age: Duration) -> Result<()> {
        let now = SystemTime::now();
        self.cleanup_matching(|meta| match meta.modified() {
            Ok(modified) => now
                .duration_since(modified)
                .map(|age| age > max_age)
                .unwrap_or(false),
            Err(_) => false,
        })
    }

    fn cleanup_matching(&self, should_remove: impl Fn(&fs::Metadata) -> bool) -> Result<()> {
        let prefix = self.file_prefix();
        for entry in fs::read_dir(&self.dir)?.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&prefix) {
                continue;
            }
            let remove = entry.metadata().map(|m| should_remove(&m)).unwrap_or(false);
            if remove {
                debug!(file = name, "removing slot file");
                let _ = fs::remove_file(entry.path());
            }
        }
        Ok(())
    }

    fn file_prefix(&self) -> String {
        format!("{SLOT_FILE_PREFIX}{}_", self.pool_name)
    }

    fn slot_filename(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{}{id}", self.file_prefix()))
    }

    fn touch(&mut self, idx: usize) {
        self.clock += 1;
        self.slots[idx].last_access = self.clock;
    }

    fn resident_index(&self, id: u64) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| !slot.is_free() && slot.id == id)
    }

    /// Index of a free slot, evicting the least recently used session when
    /// none is free.
    fn free_slot(&mut self) -> usize {
        if let Some(idx) = self.slots.iter().position(Slot::is_free) {
            return idx;
        }
        let idx = self.lru_index();
        self.evict(idx);
        idx
    }

    fn lru_index(&self) -> usize {
        self.slots
            .iter()
            .enumerate()
            .min_by_key(|(_, slot)| slot.last_access)
            .map(|(idx, _)| idx)
            .unwrap_or(0)
    }

    /// Persist and reset a slot. A session that fails to serialize is
    /// dropped anyway so the pool can make progress; the partial file is
    /// removed best-effort.
    fn evict(&mut self, idx: usize) {
        if self.slots[idx].is_free() {
            return;
        }
        let id = self.slots[idx].id;
        info!(id, "evicting session");
        if let Err(err) = self.store_slot(idx) {
            warn!(id, %err, "failed to persist evicted session");
            let _ = fs::remove_file(self.slot_filename(id));
        }
        self.slots[idx].reset();
    }

    fn store_slot(&self, idx: usize) -> Result<()> {
        let slot = &self.slots[idx];
        let Some(session) = slot.session.as_ref() else {
            return Ok(());
        };
        let path = self.slot_filename(slot.id);
        let mut out = BufWriter::new(File::create(&path)?);
        let weights = slot.weights_path.to_string_lossy();
        out.write_u32::<LittleEndian>(weights.len() as u32)?;
        out.write_all(weights.as_bytes())?;
        let params = serde_json::to_vec(session.params())
            .map_err(|e| Error::invalid_data(e.to_string()))?;
        out.write_u32::<LittleEndian>(params.len() as u32)?;
        out.write_all(&params)?;
        session.serialize(&mut out)?;
        out.flush()?;
        debug!(id = slot.id, file = %path.display(), "stored session");
        Ok(())
    }

    fn load_slot(&mut self, idx: usize, id: u64) -> Result<()> {
        let path = self.slot_filename(id);
        let file = File::open(&path).map_err(|_| Error::NotFound(id))?;
        let mut input = BufReader::new(file);
        let path_len = input.read_u32::<LittleEndian>()? as usize;
        let mut path_bytes = vec![0u8; path_len];
        input.read_exact(&mut path_bytes)?;
        let weights_path = PathBuf::from(
            String::from_utf8(path_bytes)
                .map_err(|_| Error::invalid_data("weights path is not valid UTF-8"))?,
        );
        let params_len = input.read_u32::<LittleEndian>()? as usize;
        let mut params_bytes = vec![0u8; params_len];
        input.read_exact(&mut params_bytes)?;
        let params: SessionParams = serde_json::from_slice(&params_bytes)
            .map_err(|e| Error::invalid_data(e.to_string()))?;

        let mut session = Session::open(&weights_path, params)?;
        session.deserialize(&mut input)?;

        self.touch(idx);
        let slot = &mut self.slots[idx];
        slot.session = Some(session);
        slot.id = id;
        slot.weights_path = weights_path;
        info!(id, "reloaded session from disk");
        Ok(())
    }
}
