use std::fmt;

use sha2::{Digest, Sha256};

use crate::event::{non_empty, Event};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeySource {
    /// The client supplied an event id, used verbatim
    Explicit,
    /// Digest of (name, user_id, timestamp)
    Derived,
}

impl KeySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeySource::Explicit => "explicit",
            KeySource::Derived => "derived",
        }
    }
}

impl fmt::Display for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity of an event, used by sinks to drop duplicates.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DedupKey {
    key: String,
    source: KeySource,
}

impl DedupKey {
    /// Derived keys are a hex encoded SHA-256 over a length-prefixed encoding
    /// of the triple, so ("a|b", "c") and ("a", "b|c") never collide.
    pub fn derive(event: &Event) -> Self {
        if let Some(id) = non_empty(&event.id) {
            return Self {
                key: id.to_owned(),
                source: KeySource::Explicit,
            };
        }

        let mut hasher = Sha256::new();
        for part in [event.name.as_bytes(), event.user_id.as_bytes()] {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        }
        hasher.update(event.timestamp.to_be_bytes());

        Self {
            key: hex::encode(hasher.finalize()),
            source: KeySource::Derived,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn source(&self) -> KeySource {
        self.source
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// An admitted event paired with its dedup key, computed once at submit time.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyedEvent {
    pub key: DedupKey,
    pub event: Event,
}

impl From<Event> for KeyedEvent {
    fn from(event: Event) -> Self {
        Self {
            key: DedupKey::derive(&event),
            event,
        }
    }
}
