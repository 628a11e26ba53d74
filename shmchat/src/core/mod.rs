use std::mem;
use std::slice;
use std::thread;
use std::time::Duration;

use ::shared_memory::{Shmem, ShmemConf, ShmemError};
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ChatError;

pub mod gate;
pub mod record;
pub mod ring;

use gate::Gate;
use record::Slot;
use ring::{Counters, Ring};

pub const DEFAULT_SEGMENT_NAME: &str = "shmchat";
pub const DEFAULT_GATE_KEY: i32 = 0x5678;
pub const DEFAULT_CAPACITY: usize = 50;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const MAX_CAPACITY: usize = 1 << 20;

/// ASCII "SHMCHAT1".
pub(crate) const STORE_MAGIC: u64 = 0x5348_4d43_4841_5431;
pub(crate) const STORE_VERSION: u32 = 1;

/// How long a process that lost the creation race waits for the creator to size
/// the segment.
const OPEN_ATTEMPTS: u32 = 50;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(10);

#[repr(C)]
pub(crate) struct StoreHeader {
    pub(crate) magic: u64,
    pub(crate) version: u32,
    pub(crate) capacity: u32,
    pub(crate) record_size: u32,
    _reserved: u32,
    pub(crate) counters: Counters,
}

/// Bytes needed for a segment holding `capacity` records.
pub fn bytes_for_store(capacity: usize) -> usize {
    mem::size_of::<StoreHeader>() + capacity * mem::size_of::<Slot>()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmemConfig {
    /// Name of the POSIX shared memory object holding the ring.
    pub segment_name: String,
    /// System V IPC key of the gate semaphore.
    pub gate_key: i32,
    /// Number of records retained. Only used by the process that creates the segment.
    pub capacity: usize,
}

impl Default for ShmemConfig {
    fn default() -> ShmemConfig {
        ShmemConfig {
            segment_name: DEFAULT_SEGMENT_NAME.to_string(),
            gate_key: DEFAULT_GATE_KEY,
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl ShmemConfig {
    pub fn builder() -> ShmemConfigBuilder {
        ShmemConfigBuilder {
            inner: ShmemConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ChatError> {
        let name = self.segment_name.trim_start_matches('/');
        if name.is_empty() || name.contains('/') {
            return Err(ChatError::InvalidConfig(format!(
                "segment name {:?} must be a single non-empty path component",
                self.segment_name
            )));
        }
        if self.gate_key == 0 {
            return Err(ChatError::InvalidConfig(
                "gate key 0 is IPC_PRIVATE and cannot be shared".to_string(),
            ));
        }
        if self.capacity == 0 || self.capacity > MAX_CAPACITY {
            return Err(ChatError::InvalidConfig(format!(
                "capacity must be within 1..={}, got {}",
                MAX_CAPACITY, self.capacity
            )));
        }
        Ok(())
    }
}

pub struct ShmemConfigBuilder {
    inner: ShmemConfig,
}

impl ShmemConfigBuilder {
    pub fn segment_name<S: Into<String>>(mut self, name: S) -> ShmemConfigBuilder {
        self.inner.segment_name = name.into();
        self
    }

    pub fn gate_key(mut self, key: i32) -> ShmemConfigBuilder {
        self.inner.gate_key = key;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> ShmemConfigBuilder {
        self.inner.capacity = capacity;
        self
    }

    pub fn build(self) -> Result<ShmemConfig, ChatError> {
        self.inner.validate()?;
        Ok(self.inner)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub shmem: ShmemConfig,
    /// Delay between two scans of the reader.
    pub poll_interval_ms: u64,
}

impl Default for ChatConfig {
    fn default() -> ChatConfig {
        ChatConfig {
            shmem: ShmemConfig::default(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl ChatConfig {
    #[inline]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// A process-local attachment to the shared ring and its gate.
///
/// The ring is only reachable through [`ChatStore::write`] and
/// [`ChatStore::read`], which hold the gate for the duration of the closure.
/// Closures must not call back into the store: the gate is not reentrant.
pub struct ChatStore {
    shmem: Shmem,
    gate: Gate,
    capacity: usize,
    config: ShmemConfig,
}

impl ChatStore {
    /// Opens the segment and gate named by `cfg`, creating them if absent.
    /// Existing data is never reset.
    pub fn attach(cfg: &ShmemConfig) -> Result<ChatStore, ChatError> {
        cfg.validate()?;
        let gate = Gate::open_or_create(cfg.gate_key)?;
        let shmem = open_segment(cfg)?;

        let guard = gate.acquire()?;
        let capacity = init_or_validate(&shmem, cfg);
        guard.release()?;
        let capacity = capacity?;

        info!(
            segment = %cfg.segment_name,
            gate_key = cfg.gate_key,
            capacity,
            "attached to chat store"
        );
        Ok(ChatStore {
            shmem,
            gate,
            capacity,
            config: cfg.clone(),
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn config(&self) -> &ShmemConfig {
        &self.config
    }

    #[inline]
    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    pub fn write<R, F>(&mut self, f: F) -> Result<R, ChatError>
    where
        F: FnOnce(&mut Ring<'_>) -> R,
    {
        let guard = self.gate.acquire()?;
        // SAFETY: the gate is held until `guard` is released or dropped.
        let result = f(&mut unsafe { self.ring() });
        guard.release()?;
        Ok(result)
    }

    pub fn read<R, F>(&self, f: F) -> Result<R, ChatError>
    where
        F: FnOnce(&Ring<'_>) -> R,
    {
        let guard = self.gate.acquire()?;
        // SAFETY: the gate is held until `guard` is released or dropped.
        let result = f(&unsafe { self.ring() });
        guard.release()?;
        Ok(result)
    }

    /// Unmaps the segment. The segment and gate stay in the kernel.
    pub fn detach(self) {
        info!(segment = %self.config.segment_name, "detached from chat store");
    }

    /// # Safety
    /// The caller must hold the gate for as long as the returned ring is alive.
    unsafe fn ring(&self) -> Ring<'_> {
        let base = self.shmem.as_ptr();
        let header = &mut *(base as *mut StoreHeader);
        let slots = slice::from_raw_parts_mut(
            base.add(mem::size_of::<StoreHeader>()) as *mut Slot,
            self.capacity,
        );
        Ring::new(&mut header.counters, slots)
    }
}

fn open_segment(cfg: &ShmemConfig) -> Result<Shmem, ChatError> {
    let created = ShmemConf::new()
        .size(bytes_for_store(cfg.capacity))
        .os_id(&cfg.segment_name)
        .create();
    match created {
        Ok(mut shmem) => {
            // Handles never own the segment: dropping one must not unlink it.
            shmem.set_owner(false);
            info!(segment = %cfg.segment_name, size = shmem.len(), "created shared segment");
            Ok(shmem)
        }
        Err(ShmemError::MappingIdExists) => open_existing(cfg),
        Err(e) => Err(ChatError::unavailable("shared segment", e)),
    }
}

fn open_existing(cfg: &ShmemConfig) -> Result<Shmem, ChatError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match ShmemConf::new().os_id(&cfg.segment_name).open() {
            Ok(shmem) if shmem.len() >= mem::size_of::<StoreHeader>() => {
                debug!(segment = %cfg.segment_name, size = shmem.len(), "opened shared segment");
                return Ok(shmem);
            }
            Ok(_) | Err(_) if attempt < OPEN_ATTEMPTS => {
                // The creator has not sized the segment yet.
                thread::sleep(OPEN_RETRY_DELAY);
            }
            Ok(shmem) => {
                return Err(ChatError::Layout(format!(
                    "segment {} is only {} bytes",
                    cfg.segment_name,
                    shmem.len()
                )));
            }
            Err(e) => return Err(ChatError::unavailable("shared segment", e)),
        }
    }
}

/// Writes the header of a blank segment or checks the header of an existing one.
/// Must run with the gate held. Returns the capacity of the segment.
fn init_or_validate(shmem: &Shmem, cfg: &ShmemConfig) -> Result<usize, ChatError> {
    let len = shmem.len();
    // SAFETY: the mapping is at least header-sized (checked when opened) and the
    // gate serializes every access to it.
    let header = unsafe { &mut *(shmem.as_ptr() as *mut StoreHeader) };

    if header.magic == 0 {
        if bytes_for_store(cfg.capacity) > len {
            return Err(ChatError::Layout(format!(
                "segment of {} bytes cannot hold {} records",
                len, cfg.capacity
            )));
        }
        header.version = STORE_VERSION;
        header.capacity = cfg.capacity as u32;
        header.record_size = mem::size_of::<Slot>() as u32;
        header.counters = Counters::default();
        header.magic = STORE_MAGIC;
        info!(capacity = cfg.capacity, "initialized blank chat store");
        return Ok(cfg.capacity);
    }

    if header.magic != STORE_MAGIC {
        return Err(ChatError::Layout(format!(
            "bad magic {:#x}, segment {} is not a chat store",
            header.magic, cfg.segment_name
        )));
    }
    if header.version != STORE_VERSION {
        return Err(ChatError::Layout(format!(
            "unsupported layout version {}",
            header.version
        )));
    }
    if header.record_size as usize != mem::size_of::<Slot>() {
        return Err(ChatError::Layout(format!(
            "record size mismatch: segment has {}, expected {}",
            header.record_size,
            mem::size_of::<Slot>()
        )));
    }
    let capacity = header.capacity as usize;
    if capacity == 0 || bytes_for_store(capacity) > len {
        return Err(ChatError::Layout(format!(
            "segment of {} bytes cannot hold its declared {} records",
            len, capacity
        )));
    }
    if capacity != cfg.capacity {
        warn!(
            configured = cfg.capacity,
            actual = capacity,
            "segment already exists with a different capacity; using the segment's"
        );
    }
    Ok(capacity)
}

/// Removes the segment and the gate from the kernel.
///
/// No session calls this; it is an administrative operation. Processes still
/// attached keep their mapping until they detach.
pub fn remove_resources(cfg: &ShmemConfig) -> Result<(), ChatError> {
    match ShmemConf::new().os_id(&cfg.segment_name).open() {
        Ok(mut shmem) => {
            shmem.set_owner(true);
            drop(shmem);
            info!(segment = %cfg.segment_name, "removed shared segment");
        }
        Err(e) => debug!(segment = %cfg.segment_name, "no segment to remove: {}", e),
    }
    Gate::remove(cfg.gate_key)?;
    Ok(())
}
