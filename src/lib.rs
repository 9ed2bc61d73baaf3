// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! A DC-net style anonymous group-broadcast protocol.[^cite]
//!
//! Every member of a fixed [`Group`] transmits exactly one message per
//! round without any member, honest or otherwise, being able to link a
//! message to its sender. A round composes an anonymizing descriptor
//! shuffle with an XOR transmission phase; hash commitments published at
//! shuffle time let every member verify the result and, when a member
//! deviates, attribute the fault to a specific group index through the
//! blame subsystem. See the [`bulk`] module for the protocol description.
//!
//! # Architecture
//! Rounds are single-threaded state machines implementing
//! [`ProtocolParticipant`]: the owner calls
//! [`start`](ProtocolParticipant::start), feeds inbound messages to
//! [`process_message`](ProtocolParticipant::process_message), and delivers
//! the messages each [`ProcessOutcome`] carries. The crate never touches a
//! network and has no internal timers; timeouts and cancellation
//! ([`BulkParticipant::cancel`]) are the owner's responsibility.
//!
//! ```no_run
//! use dcnet::{
//!     bulk::{Input, SingleMessage},
//!     BulkParticipant, Credentials, Group, GroupMember, PeerId, ProtocolParticipant, RoundId,
//!     SubgroupPolicy,
//! };
//!
//! # fn main() -> dcnet::errors::Result<()> {
//! let mut rng = rand::rngs::OsRng;
//! let credentials = Credentials::random(&mut rng);
//! let roster = vec![GroupMember::from_credentials(&credentials)];
//! let group = Group::new(roster, PeerId::ZERO, SubgroupPolicy::CompleteGroup);
//!
//! let input = Input::new(SingleMessage::new(b"hello".to_vec()), false);
//! let mut round: BulkParticipant =
//!     BulkParticipant::new(RoundId::random(&mut rng), credentials, group, input)?;
//! let outcome = round.start(&mut rng)?;
//! # let _ = outcome;
//! # Ok(())
//! # }
//! ```
//!
//! [^cite]: Henry Corrigan-Gibbs and Bryan Ford. Dissent: Accountable
//! Anonymous Group Messaging. [ACM CCS
//! 2010](https://dl.acm.org/doi/10.1145/1866307.1866346).

/// Serialize a value with the crate's wire encoding.
macro_rules! serialize {
    ($x:expr) => {{
        bincode::serialize($x).map_err(|_| $crate::errors::InternalError::Serialization)
    }};
}

/// Deserialize bytes produced by [`serialize!`].
macro_rules! deserialize {
    ($x:expr) => {{
        bincode::deserialize($x).map_err(|_| {
            $crate::errors::InternalError::from($crate::errors::CallerError::DeserializationFailed)
        })
    }};
}

pub mod bulk;
mod codec;
mod dh;
pub mod errors;
mod group;
mod local_storage;
mod log;
mod messages;
mod participant;
mod protocol;
mod shuffle;
mod utils;

pub use bulk::BulkParticipant;
pub use dh::DhKeypair;
pub use group::{difference, is_subset, Group, GroupMember, SubgroupPolicy};
pub use messages::{BulkMessageType, Message, MessageType, ShuffleMessageType};
pub use participant::{ProcessOutcome, ProtocolParticipant, Status};
pub use protocol::{Credentials, PeerId, RoundId};
pub use shuffle::{PlainShuffle, ShuffleRound};
