// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Append-only message log, keyed by `(sender, message type)`.
//!
//! Each round keeps two: an offline log for messages that arrive before the
//! round (or the phase that consumes them) has started, and a live log of
//! validated inbound messages. The offline log is drained in arrival order
//! once the consuming phase begins; the live log supports replay during
//! blame and leader-mode verification.

use crate::{
    messages::{Message, MessageType},
    protocol::PeerId,
};

/// An append-only store of messages in arrival order.
#[derive(Debug, Default)]
pub(crate) struct MessageLog {
    entries: Vec<Message>,
}

impl MessageLog {
    /// Append a message. A message with the same `(sender, type)` key as an
    /// existing entry is not stored again; returns whether it was appended.
    pub(crate) fn append(&mut self, message: &Message) -> bool {
        if self.contains(message.from(), message.message_type()) {
            return false;
        }
        self.entries.push(message.clone());
        true
    }

    /// Whether an entry with this `(sender, type)` key exists.
    pub(crate) fn contains(&self, from: PeerId, message_type: MessageType) -> bool {
        self.get(from, message_type).is_some()
    }

    /// Look up the entry for a `(sender, type)` key.
    pub(crate) fn get(&self, from: PeerId, message_type: MessageType) -> Option<&Message> {
        self.entries
            .iter()
            .find(|m| m.from() == from && m.message_type() == message_type)
    }

    /// Remove and return all entries of `message_type`, preserving arrival
    /// order. Used to replay stashed messages once their phase begins.
    pub(crate) fn drain(&mut self, message_type: MessageType) -> Vec<Message> {
        let (matching, rest) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|m| m.message_type() == message_type);
        self.entries = rest;
        matching
    }

    /// Number of stored entries.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
