// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Round and peer identifiers, and the local peer's credentials.

use std::fmt::{Debug, Display, Formatter};

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::{CryptoRng, Rng, RngCore};
use serde::{Deserialize, Serialize};

use crate::dh::DhKeypair;

/// A unique nonce identifying a single protocol round.
///
/// Every message carries the id of the round it belongs to; rounds reject
/// messages tagged with a different id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoundId(u128);

impl RoundId {
    /// Draw a fresh random round id.
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        RoundId(rng.gen())
    }
}

impl Display for RoundId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // Shortened for readable logs.
        write!(f, "{:08x}", (self.0 >> 96) as u32)
    }
}

/// The identity of a peer in an anonymity group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(u128);

impl PeerId {
    /// The designated "no peer" marker, used only as the leader field of a
    /// leaderless [`Group`](crate::Group). It never appears in a roster.
    pub const ZERO: PeerId = PeerId(0);

    /// Draw a fresh random peer id.
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        PeerId(rng.gen())
    }

    /// Whether this is the "no peer" marker.
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}", (self.0 >> 96) as u32)
    }
}

/// The local peer's long-lived secrets for a session: its identity, the
/// signing key authenticating its messages, and the static Diffie–Hellman
/// key other peers use to derive XOR masks with it.
///
/// Cloneable so that sub-rounds can hold their own copy. The [`Debug`]
/// implementation does not print key material.
#[derive(Clone)]
pub struct Credentials {
    id: PeerId,
    signing: SigningKey,
    dh: DhKeypair,
}

impl Credentials {
    /// Assemble credentials from existing keys.
    pub fn new(id: PeerId, signing: SigningKey, dh: DhKeypair) -> Self {
        Self { id, signing, dh }
    }

    /// Generate fresh credentials with a random id and fresh keys.
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            id: PeerId::random(rng),
            signing: SigningKey::generate(rng),
            dh: DhKeypair::generate(rng),
        }
    }

    /// This peer's identity.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// The public half of the signing key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    /// The static Diffie–Hellman keypair.
    pub fn dh_keypair(&self) -> &DhKeypair {
        &self.dh
    }
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
