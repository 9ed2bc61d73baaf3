// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Blame entries and the attribution procedure.
//!
//! When hash verification fails, each member runs a second, anonymizing
//! shuffle to disclose the Diffie–Hellman shared secrets for the flagged
//! `(slot, member)` cells it can open: the cells of its own column, and (as
//! the anonymous owner of a slot) every flagged cell of its slot. From a
//! disclosed secret any member recomputes the keystream mask the cell's
//! secret implies and decides who deviated:
//! - If the recomputed mask matches the hash published in the descriptor
//!   but not the bytes the member actually transmitted, the transmitter is
//!   at fault.
//! - If the transmitted bytes honor a commitment that is *not* the
//!   recomputed mask, the cell holds a closing value, which identifies its
//!   member as the slot's owner. An owner whose slot fails its cleartext
//!   check answers for the false claim.
//! - A disclosure matching neither arrived through the anonymizing shuffle
//!   and has nobody to charge; it is logged and dropped.

use tracing::warn;

use crate::{
    codec::{write_len, write_prefixed, WireReader},
    dh::{DhKeypair, SHARED_SECRET_LEN},
    errors::{CallerError, Result},
    group::Group,
    utils::hash,
};

use super::{descriptor::Descriptor, mask};

/// Disclosure of the shared secret behind one `(slot, member)` cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BlameEntry {
    /// The slot (descriptor index) of the disputed cell.
    pub(crate) des_idx: usize,
    /// The group index of the member whose contribution is disputed.
    pub(crate) peer_idx: usize,
    /// The DH secret shared between the slot's anonymous key and the
    /// member's static key.
    pub(crate) shared_secret: [u8; SHARED_SECRET_LEN],
}

/// Encode a vector of entries in the canonical little-endian form.
pub(crate) fn encode_entries(entries: &[BlameEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    write_len(&mut out, entries.len());
    for entry in entries {
        write_len(&mut out, entry.des_idx);
        write_len(&mut out, entry.peer_idx);
        write_prefixed(&mut out, &entry.shared_secret);
    }
    out
}

/// Decode a vector of entries; the inverse of [`encode_entries`].
pub(crate) fn decode_entries(bytes: &[u8]) -> Result<Vec<BlameEntry>> {
    let mut reader = WireReader::new(bytes);
    let count = reader.read_len()?;
    let mut entries = Vec::new();
    for _ in 0..count {
        let des_idx = reader.read_len()?;
        let peer_idx = reader.read_len()?;
        let secret_len = reader.read_len()?;
        if secret_len != SHARED_SECRET_LEN {
            Err(CallerError::DeserializationFailed)?;
        }
        let shared_secret: [u8; SHARED_SECRET_LEN] = reader
            .read_exact(secret_len)?
            .try_into()
            .map_err(|_| CallerError::DeserializationFailed)?;
        entries.push(BlameEntry {
            des_idx,
            peer_idx,
            shared_secret,
        });
    }
    if !reader.done() {
        Err(CallerError::DeserializationFailed)?;
    }
    Ok(entries)
}

/// The entries the local peer can open among the flagged cells.
///
/// `static_dh` opens the local peer's own column; `anon_dh` (when the local
/// peer owns slot `my_slot`) opens every flagged cell of that slot.
pub(crate) fn entries_for(
    flagged_cells: &[(usize, usize)],
    my_group_idx: usize,
    my_slot: usize,
    static_dh: &DhKeypair,
    anon_dh: &DhKeypair,
    descriptors: &[Descriptor],
    group: &Group,
) -> Vec<BlameEntry> {
    let mut entries: Vec<BlameEntry> = Vec::new();
    for &(des_idx, peer_idx) in flagged_cells {
        if entries
            .iter()
            .any(|e| e.des_idx == des_idx && e.peer_idx == peer_idx)
        {
            continue;
        }
        let shared_secret = if peer_idx == my_group_idx {
            match descriptors.get(des_idx) {
                Some(descriptor) => static_dh.shared_secret(descriptor.anon_dh()),
                None => continue,
            }
        } else if des_idx == my_slot {
            match group.dh_at(peer_idx) {
                Some(member_dh) => anon_dh.shared_secret(member_dh),
                None => continue,
            }
        } else {
            continue;
        };
        entries.push(BlameEntry {
            des_idx,
            peer_idx,
            shared_secret,
        });
    }
    entries
}

/// Attribute faults from disclosed secrets.
///
/// `rows` holds every member's full XOR row by group index and
/// `slot_offsets` the byte offset of each slot within a row. Returns the
/// sorted, deduplicated group indices proven at fault: members whose
/// transmitted bytes differ from their committed mask, and slot owners
/// whose cleartext claim their own slot's XOR sum disproves.
pub(crate) fn process_blame(
    entries: &[BlameEntry],
    descriptors: &[Descriptor],
    slot_offsets: &[usize],
    rows: &[Vec<u8>],
) -> Vec<usize> {
    let mut bad = Vec::new();
    for entry in entries {
        let (descriptor, offset) = match (
            descriptors.get(entry.des_idx),
            slot_offsets.get(entry.des_idx),
        ) {
            (Some(descriptor), Some(offset)) => (descriptor, *offset),
            _ => {
                warn!("Blame entry references slot {} out of range", entry.des_idx);
                continue;
            }
        };
        let published = match descriptor.xor_hashes().get(entry.peer_idx) {
            Some(published) => published,
            None => {
                warn!(
                    "Blame entry references member {} out of range",
                    entry.peer_idx
                );
                continue;
            }
        };
        let range = offset..offset + descriptor.length();
        let transmitted = match rows
            .get(entry.peer_idx)
            .and_then(|row| row.get(range.clone()))
        {
            Some(transmitted) => transmitted,
            None => {
                warn!(
                    "No transmitted bytes for blame cell ({}, {})",
                    entry.des_idx, entry.peer_idx
                );
                continue;
            }
        };

        let expected = mask::keystream(&entry.shared_secret, descriptor.length());
        if hash(&expected) == *published {
            // The committed mask is honest; the transmitted bytes must
            // match it.
            if transmitted != expected.as_slice() && !bad.contains(&entry.peer_idx) {
                bad.push(entry.peer_idx);
            }
            continue;
        }

        if hash(transmitted) == *published {
            // The cell is committed to something other than its keystream,
            // yet the transmitted bytes honor the commitment: this is the
            // closing-value cell, so the disclosure has identified the
            // slot's owner. The owner answers for its cleartext claim.
            let mut recovered = vec![0u8; descriptor.length()];
            for row in rows {
                if let Some(cell) = row.get(range.clone()) {
                    for (acc, byte) in recovered.iter_mut().zip(cell) {
                        *acc ^= byte;
                    }
                }
            }
            if hash(&recovered) != *descriptor.cleartext_hash() && !bad.contains(&entry.peer_idx) {
                bad.push(entry.peer_idx);
            }
            continue;
        }

        // The disclosure matches neither the commitment nor the transmitted
        // bytes. It arrived through the anonymizing shuffle, so there is
        // nobody to charge for it.
        warn!(
            "Disclosed secret for cell ({}, {}) contradicts both the commitment and the transmission",
            entry.des_idx, entry.peer_idx
        );
    }
    bad.sort_unstable();
    bad
}
