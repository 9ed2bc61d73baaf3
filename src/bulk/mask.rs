// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Deterministic XOR mask generation.
//!
//! A mask is the prefix of a ChaCha20 keystream seeded with the hash of a
//! Diffie–Hellman shared secret. Either endpoint of the DH exchange derives
//! the same secret and therefore the same mask, which is what lets a slot
//! owner predict and commit to every other member's contribution.

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::{
    errors::{Fault, InternalError, Result},
    utils::hash,
};

/// The first `length` bytes of the keystream keyed by `shared_secret`.
pub(crate) fn keystream(shared_secret: &[u8], length: usize) -> Vec<u8> {
    let mut rng = ChaCha20Rng::from_seed(hash(shared_secret));
    let mut mask = vec![0u8; length];
    rng.fill_bytes(&mut mask);
    mask
}

/// Write `a XOR b` into `dst`. All three must have equal lengths.
pub(crate) fn xor_into(dst: &mut [u8], a: &[u8], b: &[u8]) -> Result<()> {
    if dst.len() != a.len() || a.len() != b.len() {
        return Err(InternalError::fault(Fault::LengthMismatch));
    }
    for (d, (x, y)) in dst.iter_mut().zip(a.iter().zip(b)) {
        *d = x ^ y;
    }
    Ok(())
}

/// Fold `src` into `dst` with XOR. Lengths must match.
pub(crate) fn xor_assign(dst: &mut [u8], src: &[u8]) -> Result<()> {
    if dst.len() != src.len() {
        return Err(InternalError::fault(Fault::LengthMismatch));
    }
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
    Ok(())
}
