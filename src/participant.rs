// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The narrow interface shared by protocol rounds.
//!
//! A round is a single-threaded state machine driven entirely by
//! [`process_message`](ProtocolParticipant::process_message): the owner
//! feeds it one inbound [`Message`] at a time and delivers whatever
//! messages the resulting [`ProcessOutcome`] carries. Rounds never touch a
//! network themselves, and no two events are processed concurrently for the
//! same round.

use rand::{CryptoRng, RngCore};
use serde::Serialize;
use tracing::{error, warn};

use crate::{
    errors::{CallerError, Fault, InternalError, Result},
    group::Group,
    local_storage::LocalStorage,
    log::MessageLog,
    messages::{Message, MessageType},
    protocol::{Credentials, PeerId, RoundId},
};

/// The stages a round moves through.
///
/// The bulk round uses `Offline → Shuffling → DataSharing →
/// [ReceivingLeaderData → ProcessingLeaderData]? → Finished`; shuffle
/// rounds use `Offline → CollectingInputs → Finished`. `Aborted` is the
/// terminal state of a cancelled or structurally failed round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Not yet started; inbound messages are stashed.
    Offline,
    /// The descriptor shuffle is running.
    Shuffling,
    /// XOR rows are being exchanged and aggregated.
    DataSharing,
    /// Waiting for the leader's aggregate (app-broadcast mode, non-leader).
    ReceivingLeaderData,
    /// Processing the leader's aggregate or redistributed rows.
    ProcessingLeaderData,
    /// Collecting shuffle inputs (shuffle rounds only).
    CollectingInputs,
    /// The round produced its output.
    Finished,
    /// The round was cancelled or failed structurally; no output.
    Aborted,
}

/// The result of processing one message.
#[derive(Debug)]
pub enum ProcessOutcome<O> {
    /// The round needs more messages before anything new happens.
    Incomplete,
    /// The round produced messages for the owner to deliver.
    Processed(Vec<Message>),
    /// The round terminated with its output.
    Terminated(O),
    /// The round terminated for this participant, with final messages that
    /// other participants still need.
    TerminatedForThisParticipant(O, Vec<Message>),
}

impl<O> ProcessOutcome<O> {
    /// Assemble an outcome from an optional output and outbound messages.
    pub fn from_parts(output: Option<O>, messages: Vec<Message>) -> Self {
        match (output, messages.is_empty()) {
            (Some(output), true) => Self::Terminated(output),
            (Some(output), false) => Self::TerminatedForThisParticipant(output, messages),
            (None, true) => Self::Incomplete,
            (None, false) => Self::Processed(messages),
        }
    }

    /// Split into the optional output and outbound messages.
    pub fn into_parts(self) -> (Option<O>, Vec<Message>) {
        match self {
            Self::Incomplete => (None, Vec::new()),
            Self::Processed(messages) => (None, messages),
            Self::Terminated(output) => (Some(output), Vec::new()),
            Self::TerminatedForThisParticipant(output, messages) => (Some(output), messages),
        }
    }

    /// Add messages to this outcome.
    pub fn with_messages(self, mut messages: Vec<Message>) -> Self {
        let (output, mut existing) = self.into_parts();
        existing.append(&mut messages);
        Self::from_parts(output, existing)
    }

    /// Merge several outcomes produced while handling a single event.
    ///
    /// At most one of them may carry an output; two terminations from one
    /// event mean the round logic is broken.
    pub fn collect(outcomes: Vec<Self>) -> Result<Self> {
        let mut output = None;
        let mut messages = Vec::new();
        for outcome in outcomes {
            let (o, mut m) = outcome.into_parts();
            if let Some(o) = o {
                if output.is_some() {
                    error!("Multiple outcomes terminated while handling one event");
                    return Err(InternalError::InternalInvariantFailed);
                }
                output = Some(o);
            }
            messages.append(&mut m);
        }
        Ok(Self::from_parts(output, messages))
    }

    /// [`collect`](Self::collect), with extra messages appended.
    pub fn collect_with_messages(outcomes: Vec<Self>, messages: Vec<Message>) -> Result<Self> {
        Ok(Self::collect(outcomes)?.with_messages(messages))
    }

    /// Merge `others` into this outcome.
    pub fn consolidate(self, mut others: Vec<Self>) -> Result<Self> {
        others.insert(0, self);
        Self::collect(others)
    }
}

/// The interface a protocol round exposes to its owner.
///
/// Both the bulk round and the shuffles are driven through this trait; the
/// owner only ever starts a round, feeds it messages, and inspects its
/// status and blamed members.
pub trait ProtocolParticipant {
    /// Protocol-specific input provided at construction.
    type Input;
    /// The output produced on termination.
    type Output;

    /// Create a participant for round `sid` over `group`.
    ///
    /// `credentials` must belong to a member of `group`.
    fn new(
        sid: RoundId,
        credentials: Credentials,
        group: Group,
        input: Self::Input,
    ) -> Result<Self>
    where
        Self: Sized;

    /// The message type that starts this round.
    fn ready_type() -> MessageType;

    /// The local peer's identity.
    fn id(&self) -> PeerId;

    /// The group this round runs over.
    fn group(&self) -> &Group;

    /// The round id.
    fn sid(&self) -> RoundId;

    /// Start the round: processes a self-addressed ready message.
    fn start<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<ProcessOutcome<Self::Output>>;

    /// Handle one inbound message.
    fn process_message<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<Self::Output>>;

    /// The round's current stage.
    fn status(&self) -> &Status;

    /// Group indices of members attributed as faulty so far.
    fn bad_members(&self) -> &[usize];

    /// Whether the round delivered its output.
    fn is_finished(&self) -> bool {
        *self.status() == Status::Finished
    }
}

/// Internal plumbing shared by participant implementations.
pub(crate) trait InnerProtocolParticipant: ProtocolParticipant {
    /// The local peer's credentials.
    fn credentials(&self) -> &Credentials;

    /// In-progress typed storage.
    fn local_storage(&self) -> &LocalStorage;

    /// In-progress typed storage, mutably.
    fn local_storage_mut(&mut self) -> &mut LocalStorage;

    /// The stash of messages that arrived before their phase.
    fn offline_log_mut(&mut self) -> &mut MessageLog;

    /// All group member ids, in roster order.
    fn all_participants(&self) -> Vec<PeerId> {
        self.group().peer_ids()
    }

    /// All group member ids except the local peer.
    fn other_participants(&self) -> Vec<PeerId> {
        self.group()
            .peer_ids()
            .into_iter()
            .filter(|id| *id != self.id())
            .collect()
    }

    /// A signed message to a single recipient.
    fn message_to<T: Serialize>(
        &self,
        message_type: MessageType,
        to: PeerId,
        payload: &T,
    ) -> Result<Message> {
        Message::new(
            message_type,
            self.sid(),
            self.id(),
            to,
            payload,
            self.credentials().signing_key(),
        )
    }

    /// One signed message per other group member.
    fn message_for_other_participants<T: Serialize>(
        &self,
        message_type: MessageType,
        payload: &T,
    ) -> Result<Vec<Message>> {
        self.other_participants()
            .into_iter()
            .map(|to| self.message_to(message_type, to, payload))
            .collect()
    }

    /// The self-addressed message that starts this round.
    fn ready_message(&self) -> Result<Message> {
        self.message_to(Self::ready_type(), self.id(), &())
    }

    /// Stash a message that arrived before the phase that consumes it.
    ///
    /// Redeliveries of an already-stashed message are dropped.
    fn stash_message(&mut self, message: &Message) -> Result<()> {
        if !self.offline_log_mut().append(message) {
            warn!(
                "Ignoring redelivery of early message of type {:?}",
                message.message_type()
            );
        }
        Ok(())
    }

    /// Replay stashed messages of `message_type` in arrival order.
    fn fetch_stashed(&mut self, message_type: MessageType) -> Vec<Message> {
        self.offline_log_mut().drain(message_type)
    }

    /// Authenticate an inbound message: right round, known sender, valid
    /// signature. Returns the sender's group index.
    fn validate_sender(&self, message: &Message) -> Result<usize> {
        validate_sender(message, self.sid(), self.group())
    }
}

/// Authenticate `message` against `group` for round `sid`.
///
/// Returns the sender's group index, [`CallerError::WrongRound`] if the
/// message was routed to the wrong round, and
/// [`Fault::UnauthorizedSender`] for unknown senders or bad signatures.
pub(crate) fn validate_sender(message: &Message, sid: RoundId, group: &Group) -> Result<usize> {
    if message.id() != sid {
        return Err(CallerError::WrongRound.into());
    }
    let idx = group
        .index_of(message.from())
        .ok_or_else(|| InternalError::fault_by(Fault::UnauthorizedSender, message.from()))?;
    let key = group
        .key_at(idx)
        .ok_or(InternalError::InternalInvariantFailed)?;
    message.verify(key)?;
    Ok(idx)
}
