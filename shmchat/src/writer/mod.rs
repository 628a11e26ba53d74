use std::time::SystemTime;

use tracing::debug;

use super::core::record::{truncate, MessageRecord, MAX_AUTHOR_SIZE};
use super::core::ChatStore;
use super::errors::ChatError;

/// Display name of a participant, fixed for the lifetime of its session.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    /// Trims `name` and rejects it if empty or longer than the author field.
    pub fn new(name: &str) -> Result<Identity, ChatError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ChatError::InvalidIdentity("name is empty".to_string()));
        }
        if truncate(name, MAX_AUTHOR_SIZE).len() != name.len() {
            return Err(ChatError::InvalidIdentity(format!(
                "name is longer than {} bytes",
                MAX_AUTHOR_SIZE
            )));
        }
        Ok(Identity(name.to_string()))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub struct MessageWriter {
    identity: Identity,
}

impl MessageWriter {
    pub fn new(identity: Identity) -> MessageWriter {
        MessageWriter { identity }
    }

    #[inline]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Appends `text` as a message from this writer's identity.
    ///
    /// Returns the sequence count after the append, or `None` if `text` was
    /// blank and nothing was written.
    pub fn submit(&self, store: &mut ChatStore, text: &str) -> Result<Option<u64>, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        let record = MessageRecord::new(self.identity.as_str(), text, SystemTime::now());
        let total = store.write(|ring| ring.append(&record))?;
        debug!(author = %self.identity, total, "appended message");
        Ok(Some(total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_trimmed_and_bounded() {
        assert_eq!(Identity::new("  alice \n").unwrap().as_str(), "alice");
        assert!(Identity::new("   ").is_err());
        assert!(Identity::new(&"a".repeat(MAX_AUTHOR_SIZE)).is_ok());
        assert!(matches!(
            Identity::new(&"a".repeat(MAX_AUTHOR_SIZE + 1)),
            Err(ChatError::InvalidIdentity(_))
        ));
    }
}
