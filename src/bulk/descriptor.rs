// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Per-sender, per-round descriptors and their wire codec.
//!
//! A descriptor is what a member commits to before the shuffle: the length
//! of its message, its anonymous DH public, the expected hash of every
//! member's XOR contribution for its slot, and the hash of the cleartext.
//! Descriptors transit the shuffle as opaque bytes, so the encoding is
//! pinned bit-exactly: little-endian, 8-byte length prefixes, in field
//! order `(length, anon_dh, xor_hashes, cleartext_hash)`.

use tracing::error;

use crate::{
    codec::{write_len, write_prefixed, WireReader},
    dh::DH_PUBLIC_LEN,
    errors::{Fault, InternalError, Result},
    utils::HASH_LEN,
};

/// Commitments published by one anonymous sender at shuffle time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Descriptor {
    length: usize,
    anon_dh: [u8; DH_PUBLIC_LEN],
    xor_hashes: Vec<[u8; HASH_LEN]>,
    cleartext_hash: [u8; HASH_LEN],
}

impl Descriptor {
    pub(crate) fn new(
        length: usize,
        anon_dh: [u8; DH_PUBLIC_LEN],
        xor_hashes: Vec<[u8; HASH_LEN]>,
        cleartext_hash: [u8; HASH_LEN],
    ) -> Self {
        Self {
            length,
            anon_dh,
            xor_hashes,
            cleartext_hash,
        }
    }

    /// Length in bytes of the cleartext this descriptor commits to.
    pub(crate) fn length(&self) -> usize {
        self.length
    }

    /// The sender's per-round anonymous DH public.
    pub(crate) fn anon_dh(&self) -> &[u8; DH_PUBLIC_LEN] {
        &self.anon_dh
    }

    /// Expected hash of each member's XOR contribution, by group index.
    pub(crate) fn xor_hashes(&self) -> &[[u8; HASH_LEN]] {
        &self.xor_hashes
    }

    /// Hash of the cleartext.
    pub(crate) fn cleartext_hash(&self) -> &[u8; HASH_LEN] {
        &self.cleartext_hash
    }

    /// Encode to the canonical byte form.
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_len(&mut out, self.length);
        write_prefixed(&mut out, &self.anon_dh);
        write_len(&mut out, self.xor_hashes.len());
        for hash in &self.xor_hashes {
            write_prefixed(&mut out, hash);
        }
        write_prefixed(&mut out, &self.cleartext_hash);
        out
    }

    /// Decode and validate against the size of the group.
    ///
    /// Any violation (wrong DH or hash length, a hash count other than
    /// `expected_members`, trailing bytes) is a
    /// [`MalformedMessage`](Fault::MalformedMessage) attributable to the
    /// descriptor's submitter.
    pub(crate) fn from_bytes(bytes: &[u8], expected_members: usize) -> Result<Self> {
        let malformed = || InternalError::fault(Fault::MalformedMessage);

        let mut reader = WireReader::new(bytes);
        let length = reader.read_len().map_err(|_| malformed())?;

        let dh_len = reader.read_len().map_err(|_| malformed())?;
        if dh_len != DH_PUBLIC_LEN {
            error!("Descriptor DH public has length {dh_len}, expected {DH_PUBLIC_LEN}");
            return Err(malformed());
        }
        let anon_dh: [u8; DH_PUBLIC_LEN] = reader
            .read_exact(dh_len)
            .map_err(|_| malformed())?
            .try_into()
            .map_err(|_| malformed())?;

        let hash_count = reader.read_len().map_err(|_| malformed())?;
        if hash_count != expected_members {
            error!("Descriptor carries {hash_count} mask hashes for a group of {expected_members}");
            return Err(malformed());
        }
        let mut xor_hashes = Vec::with_capacity(hash_count);
        for _ in 0..hash_count {
            let hash_len = reader.read_len().map_err(|_| malformed())?;
            if hash_len != HASH_LEN {
                error!("Descriptor mask hash has length {hash_len}, expected {HASH_LEN}");
                return Err(malformed());
            }
            let hash: [u8; HASH_LEN] = reader
                .read_exact(hash_len)
                .map_err(|_| malformed())?
                .try_into()
                .map_err(|_| malformed())?;
            xor_hashes.push(hash);
        }

        let ct_len = reader.read_len().map_err(|_| malformed())?;
        if ct_len != HASH_LEN {
            error!("Descriptor cleartext hash has length {ct_len}, expected {HASH_LEN}");
            return Err(malformed());
        }
        let cleartext_hash: [u8; HASH_LEN] = reader
            .read_exact(ct_len)
            .map_err(|_| malformed())?
            .try_into()
            .map_err(|_| malformed())?;

        if !reader.done() {
            error!("Descriptor has trailing bytes");
            return Err(malformed());
        }

        Ok(Self {
            length,
            anon_dh,
            xor_hashes,
            cleartext_hash,
        })
    }
}
