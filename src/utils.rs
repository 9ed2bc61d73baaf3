// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use sha3::{Digest, Sha3_256};

/// Length in bytes of every digest produced by [`hash`].
pub(crate) const HASH_LEN: usize = 32;

/// The hash primitive used for all protocol commitments (SHA3-256).
pub(crate) fn hash(bytes: &[u8]) -> [u8; HASH_LEN] {
    Sha3_256::digest(bytes).into()
}
