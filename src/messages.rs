// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Wire messages exchanged between round participants.
//!
//! Every [`Message`] is tagged with its round id, sender and recipient, and
//! carries an ed25519 signature over all of those fields plus the payload.
//! Receivers verify the signature against the sender's key in the
//! [`Group`](crate::Group) roster before acting on the payload; until then
//! the payload is exposed only as `unverified_bytes`.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{
    errors::{Fault, InternalError, Result},
    protocol::{PeerId, RoundId},
};

/// Messages of the bulk transmission round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BulkMessageType {
    /// Self-addressed signal that starts the round.
    Ready,
    /// A peer's full XOR row, broadcast to the whole group.
    BulkData,
    /// A peer's XOR row sent to (or redistributed by) the leader, tagged
    /// with its originating peer.
    LoggedBulkData,
    /// The leader's post-aggregation cleartext vector.
    AggregatedBulkData,
}

/// Messages of the descriptor and blame shuffles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShuffleMessageType {
    /// A peer's serialized descriptor, input to the descriptor shuffle.
    DescriptorInput,
    /// A peer's serialized blame entry vector, input to the blame shuffle.
    BlameInput,
}

/// All message types understood by this crate's rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// A bulk round message.
    Bulk(BulkMessageType),
    /// A shuffle message.
    Shuffle(ShuffleMessageType),
}

/// An authenticated message from one peer to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    message_type: MessageType,
    round_id: RoundId,
    from: PeerId,
    to: PeerId,
    /// The serialized payload. The signature has not necessarily been
    /// checked yet, hence the name; handlers deserialize this only after
    /// [`Message::verify`] passed.
    pub(crate) unverified_bytes: Vec<u8>,
    signature: Vec<u8>,
}

impl Message {
    /// Build and sign a message carrying a serializable payload.
    pub fn new<T: Serialize>(
        message_type: MessageType,
        round_id: RoundId,
        from: PeerId,
        to: PeerId,
        payload: &T,
        signing_key: &SigningKey,
    ) -> Result<Self> {
        let unverified_bytes = serialize!(payload)?;
        let covered = Self::signed_portion(message_type, round_id, from, to, &unverified_bytes)?;
        let signature = signing_key.sign(&covered).to_bytes().to_vec();
        Ok(Self {
            message_type,
            round_id,
            from,
            to,
            unverified_bytes,
            signature,
        })
    }

    /// The message type.
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// The round this message belongs to.
    pub fn id(&self) -> RoundId {
        self.round_id
    }

    /// The sender.
    pub fn from(&self) -> PeerId {
        self.from
    }

    /// The recipient.
    pub fn to(&self) -> PeerId {
        self.to
    }

    /// Check that the message has the expected type.
    pub(crate) fn check_type(&self, expected: MessageType) -> Result<()> {
        if self.message_type != expected {
            error!(
                "Expected message of type {:?}, got {:?}",
                expected, self.message_type
            );
            return Err(InternalError::fault_by(Fault::MalformedMessage, self.from));
        }
        Ok(())
    }

    /// Verify the signature against the sender's verification key.
    pub(crate) fn verify(&self, key: &VerifyingKey) -> Result<()> {
        let covered = Self::signed_portion(
            self.message_type,
            self.round_id,
            self.from,
            self.to,
            &self.unverified_bytes,
        )?;
        let bytes: [u8; Signature::BYTE_SIZE] = self
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| InternalError::fault_by(Fault::UnauthorizedSender, self.from))?;
        key.verify(&covered, &Signature::from_bytes(&bytes))
            .map_err(|_| InternalError::fault_by(Fault::UnauthorizedSender, self.from))
    }

    /// Encode for transport.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serialize!(self)
    }

    /// Decode from transport bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        deserialize!(bytes)
    }

    fn signed_portion(
        message_type: MessageType,
        round_id: RoundId,
        from: PeerId,
        to: PeerId,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        serialize!(&(message_type, round_id, from, to, payload))
    }
}

/// Build one copy of a signed message for every other group member.
///
/// Broadcast in this crate is a message per recipient; the owner hands each
/// copy to its transport.
pub(crate) fn messages_to_others<T: Serialize>(
    message_type: MessageType,
    round_id: RoundId,
    credentials: &crate::protocol::Credentials,
    group: &crate::group::Group,
    payload: &T,
) -> Result<Vec<Message>> {
    group
        .peer_ids()
        .into_iter()
        .filter(|id| *id != credentials.id())
        .map(|to| {
            Message::new(
                message_type,
                round_id,
                credentials.id(),
                to,
                payload,
                credentials.signing_key(),
            )
        })
        .collect()
}
