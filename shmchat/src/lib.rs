pub mod core;
pub mod errors;
pub mod reader;
pub mod session;
pub mod writer;

#[cfg(test)]
mod tests;

pub use crate::core::record::{MessageRecord, MAX_AUTHOR_SIZE, MAX_TEXT_SIZE};
pub use crate::core::{remove_resources, ChatConfig, ChatStore, ShmemConfig};
pub use crate::errors::ChatError;
pub use crate::reader::{MessageReader, OnMessage, ReaderTask};
pub use crate::session::{Session, FAREWELL_TEXT, JOIN_TEXT};
pub use crate::writer::{Identity, MessageWriter};
