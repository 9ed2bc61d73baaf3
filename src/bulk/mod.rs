// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The bulk transmission round: anonymous group broadcast with
//! identifiable blame.[^cite]
//!
//! # High-level protocol description
//! One bulk round delivers one cleartext message per group member without
//! revealing which member sent which message. It composes a shuffle and an
//! XOR ("DC-net") transmission phase:
//! - Each member generates a fresh anonymous Diffie–Hellman keypair and
//!   builds a *descriptor*: the length of the message it wants to send, the
//!   anonymous DH public, a hash of the XOR mask every member is expected
//!   to contribute for this message, and a hash of the cleartext.
//!   Descriptors are exchanged through an anonymizing shuffle; the final
//!   permuted position of a descriptor is its owner's *slot* in the bulk
//!   message.
//! - For every slot it does not own, a member derives a pseudorandom XOR
//!   mask of the descriptor's length, keyed by the shared secret between
//!   the slot's anonymous DH public and the member's own static DH key.
//!   For its own slot the member instead computes the value that closes the
//!   XOR sum to its cleartext: all the other members' masks XORed together,
//!   XORed with the message. Each member concatenates its per-slot
//!   contributions in slot order and broadcasts this row.
//! - XORing all rows together slot-wise reveals every cleartext. Each
//!   recovered cleartext is checked against the descriptor's cleartext
//!   hash, and every member's transmitted contribution against the
//!   descriptor's per-member mask hashes. Any mismatch routes into the
//!   blame phase, where disclosed per-cell shared secrets let every member
//!   recompute the expected mask and attribute the deviation.
//!
//! In application-broadcast mode a designated leader collects all rows,
//!   aggregates them once and redistributes either the recovered cleartexts
//! or, on verification failure, the raw rows so every member can replay the
//! aggregation and enter blame locally.
//!
//! [^cite]: Henry Corrigan-Gibbs and Bryan Ford. Dissent: Accountable
//! Anonymous Group Messaging. [ACM CCS
//! 2010](https://dl.acm.org/doi/10.1145/1866307.1866346). Section 5,
//! the bulk protocol.

mod blame;
mod descriptor;
mod mask;
mod participant;

pub use participant::BulkParticipant;

use std::fmt::{Debug, Formatter};

/// Maximum number of application payload bytes a member may send per round.
pub const MAX_DATA_PER_ROUND: usize = 4096;

/// Source of the application payload a member sends during a round.
pub trait DataSource {
    /// Return up to `max` bytes of payload and whether more bytes remain
    /// queued for later rounds.
    fn get_data(&mut self, max: usize) -> (Vec<u8>, bool);
}

/// A [`DataSource`] holding a single message.
#[derive(Debug, Clone)]
pub struct SingleMessage {
    remaining: Vec<u8>,
}

impl SingleMessage {
    /// Queue `data` for transmission.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            remaining: data.into(),
        }
    }

    /// A source with nothing to send; the member still occupies a slot.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

impl DataSource for SingleMessage {
    fn get_data(&mut self, max: usize) -> (Vec<u8>, bool) {
        let take = self.remaining.len().min(max);
        let data = self.remaining.drain(..take).collect();
        (data, !self.remaining.is_empty())
    }
}

#[cfg(test)]
pub(crate) type RowTamper = Box<
    dyn FnMut(&mut Vec<u8>, &[descriptor::Descriptor], &[usize], usize) + Send,
>;

/// Input to a [`BulkParticipant`].
pub struct Input {
    data: Box<dyn DataSource + Send>,
    app_broadcast: bool,
    #[cfg(test)]
    row_tamper: Option<RowTamper>,
    #[cfg(test)]
    tamper_cleartext_hash: bool,
}

impl Input {
    /// Build an input from a payload source.
    ///
    /// With `app_broadcast` set, the group's leader aggregates all rows and
    /// redistributes the result instead of every member broadcasting.
    pub fn new(data: impl DataSource + Send + 'static, app_broadcast: bool) -> Self {
        Self {
            data: Box::new(data),
            app_broadcast,
            #[cfg(test)]
            row_tamper: None,
            #[cfg(test)]
            tamper_cleartext_hash: false,
        }
    }

    pub(crate) fn app_broadcast(&self) -> bool {
        self.app_broadcast
    }

    pub(crate) fn data_mut(&mut self) -> &mut (dyn DataSource + Send) {
        &mut *self.data
    }

    /// Corrupt the generated XOR row before it is stored and sent, to
    /// exercise the blame path.
    #[cfg(test)]
    pub(crate) fn with_row_tamper(mut self, tamper: RowTamper) -> Self {
        self.row_tamper = Some(tamper);
        self
    }

    #[cfg(test)]
    pub(crate) fn row_tamper_mut(&mut self) -> Option<&mut RowTamper> {
        self.row_tamper.as_mut()
    }

    /// Commit the descriptor to a cleartext hash the recovered message
    /// cannot satisfy, to exercise the owner-attribution blame path.
    #[cfg(test)]
    pub(crate) fn with_tampered_cleartext_hash(mut self) -> Self {
        self.tamper_cleartext_hash = true;
        self
    }

    #[cfg(test)]
    pub(crate) fn tampered_cleartext_hash(&self) -> bool {
        self.tamper_cleartext_hash
    }
}

impl Debug for Input {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Input")
            .field("app_broadcast", &self.app_broadcast)
            .finish_non_exhaustive()
    }
}

/// The result of a finished bulk round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    cleartexts: Vec<Vec<u8>>,
    bad_members: Vec<usize>,
}

impl Output {
    pub(crate) fn delivered(cleartexts: Vec<Vec<u8>>) -> Self {
        Self {
            cleartexts,
            bad_members: Vec::new(),
        }
    }

    pub(crate) fn blamed(bad_members: Vec<usize>) -> Self {
        Self {
            cleartexts: Vec::new(),
            bad_members,
        }
    }

    /// The recovered cleartexts in slot order, one per member. Empty slots
    /// are present as empty vectors; empty when the round ended in blame.
    pub fn cleartexts(&self) -> &[Vec<u8>] {
        &self.cleartexts
    }

    /// The non-empty cleartexts in slot order.
    pub fn messages(&self) -> Vec<&[u8]> {
        self.cleartexts
            .iter()
            .filter(|c| !c.is_empty())
            .map(|c| c.as_slice())
            .collect()
    }

    /// Group indices of members attributed as faulty.
    pub fn bad_members(&self) -> &[usize] {
        &self.bad_members
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_message_source_respects_max() {
        let mut source = SingleMessage::new(b"abcdef".to_vec());
        let (chunk, more) = source.get_data(4);
        assert_eq!(chunk, b"abcd");
        assert!(more);
        let (chunk, more) = source.get_data(4);
        assert_eq!(chunk, b"ef");
        assert!(!more);
        let (chunk, more) = source.get_data(4);
        assert!(chunk.is_empty());
        assert!(!more);
    }

    #[test]
    fn output_messages_skip_empty_slots() {
        let output = Output::delivered(vec![vec![], b"hi".to_vec(), vec![]]);
        assert_eq!(output.cleartexts().len(), 3);
        assert_eq!(output.messages(), vec![b"hi".as_slice()]);
        assert!(output.bad_members().is_empty());
    }
}
