//! Lifecycle of one participant.
//!
//! Attaching happens in [`ChatStore::attach`]. [`Session::join`] fixes the
//! identity and the starting cursor, [`Session::start_reader`] enters the active
//! state, and [`Session::shutdown`] (or dropping the session) terminates it:
//! farewell, stop the reader, detach. The shared segment and gate are left in
//! place for the next session.

use std::time::Duration;

use tracing::{error, info, warn};

use crate::core::{ChatConfig, ChatStore};
use crate::errors::ChatError;
use crate::reader::{MessageReader, OnMessage, ReaderTask};
use crate::writer::{Identity, MessageWriter};

pub mod signals;

pub const JOIN_TEXT: &str = "*** joined the chat ***";
pub const FAREWELL_TEXT: &str = "*** left the chat ***";

pub struct Session {
    store: Option<ChatStore>,
    writer: MessageWriter,
    joined_at: u64,
    poll_interval: Duration,
    reader: Option<ReaderTask>,
}

impl Session {
    /// Records the current end of the store as this session's starting point and
    /// announces the participant.
    pub fn join(
        mut store: ChatStore,
        identity: Identity,
        cfg: &ChatConfig,
    ) -> Result<Session, ChatError> {
        let joined_at = store.read(|ring| ring.total_written())?;
        let writer = MessageWriter::new(identity);
        writer.submit(&mut store, JOIN_TEXT)?;
        info!(identity = %writer.identity(), joined_at, "joined chat");
        Ok(Session {
            store: Some(store),
            writer,
            joined_at,
            poll_interval: cfg.poll_interval(),
            reader: None,
        })
    }

    #[inline]
    pub fn identity(&self) -> &Identity {
        self.writer.identity()
    }

    /// Sequence count observed when the session joined.
    #[inline]
    pub fn joined_at(&self) -> u64 {
        self.joined_at
    }

    /// Starts the background reader. `on_message` receives every message by
    /// another participant written after this session joined.
    pub fn start_reader<H>(&mut self, on_message: H) -> Result<(), ChatError>
    where
        H: OnMessage + 'static,
    {
        if self.reader.is_some() {
            return Err(ChatError::Logic("reader already running".to_string()));
        }
        let cfg = self.store()?.config().clone();
        let reader = MessageReader::new(self.identity().clone(), self.joined_at);
        self.reader = Some(ReaderTask::spawn(cfg, reader, self.poll_interval, on_message)?);
        Ok(())
    }

    /// Whether the background reader is still polling.
    pub fn reader_alive(&self) -> bool {
        self.reader.as_ref().map_or(false, |r| !r.is_finished())
    }

    pub fn submit(&mut self, text: &str) -> Result<Option<u64>, ChatError> {
        let store = match self.store.as_mut() {
            Some(store) => store,
            None => return Err(ChatError::Logic("session already terminated".to_string())),
        };
        self.writer.submit(store, text)
    }

    pub fn store(&self) -> Result<&ChatStore, ChatError> {
        self.store
            .as_ref()
            .ok_or_else(|| ChatError::Logic("session already terminated".to_string()))
    }

    pub fn shutdown(mut self) -> Result<(), ChatError> {
        self.terminate()
    }

    fn terminate(&mut self) -> Result<(), ChatError> {
        let mut store = match self.store.take() {
            Some(store) => store,
            None => return Ok(()),
        };
        let farewell = self.writer.submit(&mut store, FAREWELL_TEXT);
        if let Some(reader) = self.reader.take() {
            // A failed reader never takes the writer down with it.
            if let Err(e) = reader.stop() {
                warn!("reader ended with an error: {}", e);
            }
        }
        store.detach();
        info!(identity = %self.writer.identity(), "left chat");
        farewell.map(|_| ())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            error!("session cleanup failed: {}", e);
        }
    }
}
