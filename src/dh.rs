// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Thin X25519 wrapper used for mask derivation.
//!
//! Both the static per-peer keys in a [`Group`](crate::Group) roster and the
//! per-round anonymous keys committed inside descriptors are X25519 keys.
//! Secrets are zeroized on drop by the underlying library.

use std::fmt::{Debug, Formatter};

use rand::{CryptoRng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};

/// Length in bytes of an encoded DH public value.
pub const DH_PUBLIC_LEN: usize = 32;

/// Length in bytes of a derived shared secret.
pub const SHARED_SECRET_LEN: usize = 32;

/// An X25519 keypair.
#[derive(Clone)]
pub struct DhKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl DhKeypair {
    /// Generate a fresh keypair.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = StaticSecret::random_from_rng(&mut *rng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// The encoded public half.
    pub fn public_bytes(&self) -> [u8; DH_PUBLIC_LEN] {
        self.public.to_bytes()
    }

    /// Derive the shared secret with a peer's encoded public value.
    ///
    /// Deterministic and symmetric: either endpoint derives the same bytes
    /// from its own secret and the other's public.
    pub fn shared_secret(&self, their_public: &[u8; DH_PUBLIC_LEN]) -> [u8; SHARED_SECRET_LEN] {
        let public = PublicKey::from(*their_public);
        self.secret.diffie_hellman(&public).to_bytes()
    }
}

impl Debug for DhKeypair {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // The secret half is deliberately not printed.
        f.debug_struct("DhKeypair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::testing::init_testing;

    #[test]
    fn both_endpoints_derive_the_same_secret() {
        let mut rng = init_testing();
        let alice = DhKeypair::generate(&mut rng);
        let bob = DhKeypair::generate(&mut rng);

        let ab = alice.shared_secret(&bob.public_bytes());
        let ba = bob.shared_secret(&alice.public_bytes());
        assert_eq!(ab, ba);
    }

    #[test]
    fn distinct_pairs_derive_distinct_secrets() {
        let mut rng = init_testing();
        let alice = DhKeypair::generate(&mut rng);
        let bob = DhKeypair::generate(&mut rng);
        let carol = DhKeypair::generate(&mut rng);

        assert_ne!(
            alice.shared_secret(&bob.public_bytes()),
            alice.shared_secret(&carol.public_bytes())
        );
    }
}
