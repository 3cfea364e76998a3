//! The entry/command model.
//!
//! Entries flow downstream from producers to observers; commands flow
//! upstream from consumers back to the producing side. Both are plain data.

use crate::error::Fault;

/// A downstream payload, tagged with the key of the origin that produced it.
///
/// The key lets one channel multiplex several logical sub-sequences; root
/// streams use the pushed value itself as its own key.
#[derive(Debug, Clone)]
pub enum Entry<K, V> {
    /// A produced item.
    Value { from: K, value: V },
    /// A failure associated with an origin.
    Error { from: K, error: Fault },
    /// A batch boundary. Level 0 closes the innermost batch, higher levels
    /// close outer batches.
    Finish { from: K, level: u32 },
    /// Terminal shutdown signal for an origin.
    Close { from: K },
}

impl<K, V> Entry<K, V> {
    /// The origin key of this entry.
    pub fn from(&self) -> &K {
        match self {
            Entry::Value { from, .. }
            | Entry::Error { from, .. }
            | Entry::Finish { from, .. }
            | Entry::Close { from } => from,
        }
    }

    pub fn is_value(&self) -> bool {
        matches!(self, Entry::Value { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Entry::Error { .. })
    }
}

/// An upstream control signal.
///
/// Commands carry no key; they address the current consumer state of one
/// channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Request one more value.
    Next,
    /// Discard values until the next batch boundary.
    Skip,
    /// Terminate the channel.
    Close,
}
