//! Binary semaphore shared by every attached process.
//!
//! The gate is a System V semaphore set holding a single semaphore. Every
//! operation is issued with `SEM_UNDO`, so the kernel reverts the adjustment of a
//! process that dies while holding the gate and the other participants never
//! deadlock on it.

use std::io;
use std::mem;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::errors::ChatError;

const GATE_PERMISSIONS: libc::c_int = 0o666;

/// How long an opener waits for the creator to initialize the gate before it
/// assumes the creator died and initializes it itself.
const INIT_ATTEMPTS: u32 = 50;
const INIT_RETRY_DELAY: Duration = Duration::from_millis(10);

pub struct Gate {
    semid: libc::c_int,
    key: libc::key_t,
}

/// Holds the gate until dropped or explicitly released.
#[must_use = "the gate is released as soon as the guard is dropped"]
pub struct GateGuard<'a> {
    gate: &'a Gate,
    released: bool,
}

impl Gate {
    /// Opens the semaphore stored under `key`, creating it if it does not exist.
    ///
    /// Only the creating process sets the initial value, then stamps the gate
    /// with one acquire/release so `sem_otime` shows it is ready. An opener waits
    /// for that stamp; if it never comes, the creator died before initializing
    /// and the opener initializes the gate instead.
    pub fn open_or_create(key: libc::key_t) -> Result<Gate, ChatError> {
        if key == libc::IPC_PRIVATE {
            return Err(ChatError::InvalidConfig(
                "gate key must not be IPC_PRIVATE".to_string(),
            ));
        }
        let semid =
            unsafe { libc::semget(key, 1, libc::IPC_CREAT | libc::IPC_EXCL | GATE_PERMISSIONS) };
        if semid >= 0 {
            let gate = Gate { semid, key };
            gate.initialize()?;
            info!(key, semid, "created gate");
            return Ok(gate);
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(ChatError::unavailable("gate", err));
        }
        let semid = unsafe { libc::semget(key, 1, GATE_PERMISSIONS) };
        if semid < 0 {
            return Err(ChatError::unavailable("gate", io::Error::last_os_error()));
        }
        let gate = Gate { semid, key };
        gate.wait_initialized()?;
        debug!(key, semid, "opened existing gate");
        Ok(gate)
    }

    fn initialize(&self) -> Result<(), ChatError> {
        if unsafe { libc::semctl(self.semid, 0, libc::SETVAL, 1 as libc::c_int) } < 0 {
            return Err(ChatError::unavailable("gate", io::Error::last_os_error()));
        }
        self.acquire()?.release()
    }

    fn wait_initialized(&self) -> Result<(), ChatError> {
        for _ in 0..INIT_ATTEMPTS {
            if self.last_op_time()? != 0 {
                return Ok(());
            }
            thread::sleep(INIT_RETRY_DELAY);
        }
        warn!(key = self.key, "gate was never initialized; its creator probably died");
        self.initialize()
    }

    /// Time of the last `semop` on the gate, 0 if there was none.
    fn last_op_time(&self) -> Result<libc::time_t, ChatError> {
        let mut ds: libc::semid_ds = unsafe { mem::zeroed() };
        if unsafe { libc::semctl(self.semid, 0, libc::IPC_STAT, &mut ds as *mut libc::semid_ds) } < 0 {
            return Err(ChatError::GateOperationFailed(io::Error::last_os_error()));
        }
        Ok(ds.sem_otime)
    }

    #[inline]
    pub fn key(&self) -> libc::key_t {
        self.key
    }

    /// Blocks until the gate is free and takes it.
    pub fn acquire(&self) -> Result<GateGuard<'_>, ChatError> {
        loop {
            match self.op(-1, 0) {
                Ok(()) => return Ok(GateGuard::new(self)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ChatError::GateOperationFailed(e)),
            }
        }
    }

    /// Takes the gate if it is free right now.
    pub fn try_acquire(&self) -> Result<Option<GateGuard<'_>>, ChatError> {
        loop {
            match self.op(-1, libc::IPC_NOWAIT) {
                Ok(()) => return Ok(Some(GateGuard::new(self))),
                Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ChatError::GateOperationFailed(e)),
            }
        }
    }

    /// Current semaphore value: 1 when free, 0 while held.
    pub fn value(&self) -> Result<i32, ChatError> {
        let v = unsafe { libc::semctl(self.semid, 0, libc::GETVAL) };
        if v < 0 {
            return Err(ChatError::GateOperationFailed(io::Error::last_os_error()));
        }
        Ok(v)
    }

    fn release(&self) -> Result<(), ChatError> {
        loop {
            match self.op(1, 0) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ChatError::GateOperationFailed(e)),
            }
        }
    }

    fn op(&self, delta: libc::c_short, flags: libc::c_int) -> io::Result<()> {
        let mut sop = libc::sembuf {
            sem_num: 0,
            sem_op: delta,
            sem_flg: (libc::SEM_UNDO | flags) as libc::c_short,
        };
        if unsafe { libc::semop(self.semid, &mut sop, 1) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Deletes the semaphore stored under `key`. Returns `false` if there was none.
    pub fn remove(key: libc::key_t) -> Result<bool, ChatError> {
        let semid = unsafe { libc::semget(key, 1, 0) };
        if semid < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Ok(false);
            }
            return Err(ChatError::unavailable("gate", err));
        }
        if unsafe { libc::semctl(semid, 0, libc::IPC_RMID) } < 0 {
            return Err(ChatError::GateOperationFailed(io::Error::last_os_error()));
        }
        info!(key, "removed gate");
        Ok(true)
    }
}

impl<'a> GateGuard<'a> {
    fn new(gate: &'a Gate) -> GateGuard<'a> {
        GateGuard {
            gate,
            released: false,
        }
    }

    pub fn release(mut self) -> Result<(), ChatError> {
        self.released = true;
        self.gate.release()
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.gate.release() {
            error!(key = self.gate.key, "failed to release gate: {}", e);
        }
    }
}
