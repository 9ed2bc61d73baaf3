// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Error types for the crate.
//!
//! Errors are split into two layers. [`CallerError`]s are mistakes made by
//! the calling application: malformed input, messages routed to the wrong
//! round, or driving a round that already terminated. [`InternalError`]s
//! cover everything else, including [`Fault`]s: protocol-level deviations
//! that are (where possible) attributed to a specific group member.

use thiserror::Error;

use crate::protocol::PeerId;

/// The default Result type used in this crate.
pub type Result<T> = std::result::Result<T, InternalError>;

/// Errors triggered by the calling application.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CallerError {
    /// Input provided to a protocol entry point was not well formed.
    #[error("input provided to the protocol was not well formed")]
    BadInput,
    /// Caller-provided bytes could not be deserialized.
    #[error("could not deserialize the provided bytes")]
    DeserializationFailed,
    /// A message was routed to a round with a different round id.
    #[error("message belongs to a different round")]
    WrongRound,
    /// The round already produced its output.
    #[error("the round already terminated")]
    ProtocolAlreadyTerminated,
}

/// Protocol-level deviations observed while running a round.
///
/// Message-level faults are recoverable: the message is dropped and the
/// sender marked bad. Hash mismatches route through the blame subsystem.
/// Structural faults (shuffle failure, a missing anonymous index,
/// cancellation) are terminal for the round.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Undecodable bytes, unknown type, or a field of the wrong length.
    #[error("malformed message")]
    MalformedMessage,
    /// The sender is not a group member or its signature does not verify.
    #[error("sender is not an authorized group member")]
    UnauthorizedSender,
    /// A second, conflicting submission from the same peer.
    #[error("conflicting duplicate submission")]
    DuplicateSubmission,
    /// A cleartext or mask hash disagrees with its descriptor commitment.
    #[error("hash verification failed")]
    HashMismatch,
    /// The descriptor shuffle failed.
    #[error("descriptor shuffle failed")]
    ShuffleFailure,
    /// No shuffled descriptor matches this peer's anonymous DH public.
    #[error("no descriptor matches this peer's anonymous key")]
    AnonIndexNotFound,
    /// Byte buffers of unequal length were combined.
    #[error("byte buffers differ in length")]
    LengthMismatch,
    /// The round was aborted, by its owner or by a structural failure.
    /// Reported for any message processed afterwards.
    #[error("round aborted")]
    Aborted,
}

/// Errors that can occur while running a protocol round.
#[derive(Debug, Error)]
pub enum InternalError {
    /// An internal invariant was violated; this is a bug in the crate.
    #[error("an internal invariant was violated")]
    InternalInvariantFailed,
    /// A value could not be serialized.
    #[error("could not serialize value")]
    Serialization,
    /// The calling application made a mistake.
    #[error("the calling application made a mistake: {0}")]
    CallingApplicationMistake(#[from] CallerError),
    /// A protocol fault, attributed to a group member where possible.
    #[error("protocol fault: {0}")]
    ProtocolFault(Fault, Option<PeerId>),
}

impl InternalError {
    /// Shorthand for an unattributed [`Fault`].
    pub(crate) fn fault(fault: Fault) -> Self {
        InternalError::ProtocolFault(fault, None)
    }

    /// Shorthand for a [`Fault`] attributed to `peer`.
    pub(crate) fn fault_by(fault: Fault, peer: PeerId) -> Self {
        InternalError::ProtocolFault(fault, Some(peer))
    }
}
