// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The canonical byte form shared by values that transit the shuffle.
//!
//! Descriptors and blame entries cross the shuffle as opaque bytes and
//! every host must decode them to the same value, so their encoding is
//! pinned here: little-endian throughout, with an 8-byte length in front
//! of every variable-length field. [`WireReader`] is the consuming side, a
//! cursor that borrows the encoded bytes and walks them front to back.

use crate::errors::{CallerError, Result};

/// Append a little-endian 8-byte encoded length.
pub(crate) fn write_len(out: &mut Vec<u8>, len: usize) {
    out.extend_from_slice(&(len as u64).to_le_bytes());
}

/// Append a length prefix followed by `bytes`.
pub(crate) fn write_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    write_len(out, bytes.len());
    out.extend_from_slice(bytes);
}

/// A cursor over an encoded value.
pub(crate) struct WireReader<'a> {
    rest: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { rest: bytes }
    }

    /// Consume the next `n` bytes.
    pub(crate) fn read_exact(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.rest.len() < n {
            Err(CallerError::DeserializationFailed)?;
        }
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Ok(head)
    }

    /// Consume an 8-byte little-endian length.
    pub(crate) fn read_len(&mut self) -> Result<usize> {
        let bytes: [u8; 8] = self
            .read_exact(8)?
            .try_into()
            .map_err(|_| CallerError::DeserializationFailed)?;
        usize::try_from(u64::from_le_bytes(bytes))
            .map_err(|_| CallerError::DeserializationFailed.into())
    }

    /// Whether every byte has been consumed. Decoders require this before
    /// accepting a value; trailing bytes mean a different value was sent.
    pub(crate) fn done(&self) -> bool {
        self.rest.is_empty()
    }
}
