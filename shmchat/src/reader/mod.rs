use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::core::record::MessageRecord;
use super::core::{ChatStore, ShmemConfig};
use super::errors::ChatError;
use super::writer::Identity;

/// Called by the reader for every message written by someone else.
pub trait OnMessage: Send {
    fn apply(&mut self, message: &MessageRecord);
}

impl<F> OnMessage for F
where
    F: FnMut(&MessageRecord) + Send,
{
    fn apply(&mut self, message: &MessageRecord) {
        self(message)
    }
}

/// Process-local view of how far the shared sequence has been observed.
pub struct MessageReader {
    identity: Identity,
    cursor: u64,
}

impl MessageReader {
    /// Starts observing at `cursor`; records below it are never returned.
    pub fn new(identity: Identity, cursor: u64) -> MessageReader {
        MessageReader { identity, cursor }
    }

    /// Starts at the current end of the store so no history is replayed.
    pub fn at_head(identity: Identity, store: &ChatStore) -> Result<MessageReader, ChatError> {
        let cursor = store.read(|ring| ring.total_written())?;
        Ok(MessageReader::new(identity, cursor))
    }

    #[inline]
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Returns the messages written by others since the last poll, oldest first.
    ///
    /// The cursor advances to everything observed, including own messages and
    /// records that were overwritten before they could be read.
    pub fn poll_for_new(&mut self, store: &ChatStore) -> Result<Vec<MessageRecord>, ChatError> {
        let cursor = self.cursor;
        let batch = store.read(|ring| ring.read_since(cursor))?;

        if batch.observed < cursor {
            warn!(
                cursor,
                total_written = batch.observed,
                "store counter went backwards, it was probably recreated; rebasing cursor"
            );
            self.cursor = batch.observed;
            return Ok(Vec::new());
        }
        if batch.skipped > 0 {
            warn!(skipped = batch.skipped, "reader fell behind; overwritten messages skipped");
        }
        self.cursor = batch.observed;

        let messages: Vec<MessageRecord> = batch
            .records
            .into_iter()
            .map(|s| s.record)
            .filter(|record| record.author != self.identity.as_str())
            .collect();
        if !messages.is_empty() {
            debug!(count = messages.len(), cursor = self.cursor, "new messages");
        }
        Ok(messages)
    }
}

/// Background reader running on its own thread with its own store attachment.
pub struct ReaderTask {
    stop: Sender<()>,
    handle: JoinHandle<Result<(), ChatError>>,
}

impl ReaderTask {
    pub fn spawn<H>(
        cfg: ShmemConfig,
        reader: MessageReader,
        poll_interval: Duration,
        on_message: H,
    ) -> Result<ReaderTask, ChatError>
    where
        H: OnMessage + 'static,
    {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("shmchat-reader".to_string())
            .spawn(move || {
                let store = ChatStore::attach(&cfg).map_err(|e| {
                    error!("reader could not attach: {}", e);
                    e
                })?;
                let result = run(&store, reader, poll_interval, on_message, &stopped);
                if let Err(ref e) = result {
                    error!("reader stopped: {}", e);
                }
                store.detach();
                result
            })?;
        info!(interval_ms = poll_interval.as_millis() as u64, "reader started");
        Ok(ReaderTask { stop, handle })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Asks the reader to stop and waits for it. A reader that already failed
    /// reports its failure here.
    pub fn stop(self) -> Result<(), ChatError> {
        // The reader may already be gone, in which case the channel is closed.
        let _ = self.stop.send(());
        let result = match self.handle.join() {
            Ok(result) => result,
            Err(payload) => Err(ChatError::ReaderFailed(panic_message(payload))),
        };
        info!("reader stopped");
        result
    }
}

fn run<H: OnMessage>(
    store: &ChatStore,
    mut reader: MessageReader,
    poll_interval: Duration,
    mut on_message: H,
    stopped: &mpsc::Receiver<()>,
) -> Result<(), ChatError> {
    loop {
        // Rendering happens after the gate was released inside `poll_for_new`.
        for message in reader.poll_for_new(store)? {
            on_message.apply(&message);
        }
        match stopped.recv_timeout(poll_interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "reader panicked".to_string()
    }
}
