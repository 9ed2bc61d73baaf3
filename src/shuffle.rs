// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The shuffle consumed by the bulk round, behind an injectable interface.
//!
//! The bulk round only relies on the shuffle's contract: every peer submits
//! one opaque input, and every honest peer receives the identical ordered
//! vector of all inputs. The [`ShuffleRound`] trait captures that contract
//! so implementations can be swapped (notably in tests); the bulk round is
//! generic over it.
//!
//! [`PlainShuffle`] is the implementation shipped with this crate: an
//! authenticated exchange in which every peer sends its input to all peers
//! and the collected inputs are ordered canonically (sorted by content). It
//! satisfies the agreement contract but provides **no anonymity**: the
//! sender of each input is visible on the wire. Deployments that need the
//! anonymity guarantees of the bulk round must plug in a verifiable
//! anonymizing shuffle here.

use rand::{CryptoRng, RngCore};
use tracing::{info, warn};

use crate::{
    errors::{CallerError, Fault, InternalError, Result},
    group::Group,
    local_storage::{LocalStorage, TypeTag},
    log::MessageLog,
    messages::{Message, MessageType, ShuffleMessageType},
    participant::{validate_sender, ProcessOutcome, Status},
    protocol::{Credentials, RoundId},
};

/// The contract between the bulk round and its shuffles.
///
/// A shuffle is created with the message tag it owns on the wire, receives
/// the local peer's input, and terminates with the identical ordered input
/// vector at every honest peer.
pub trait ShuffleRound: std::fmt::Debug {
    /// Create a shuffle for round `sid` over `group`, consuming messages
    /// tagged `tag`.
    fn create(
        sid: RoundId,
        credentials: Credentials,
        group: Group,
        tag: ShuffleMessageType,
    ) -> Result<Self>
    where
        Self: Sized;

    /// Provide the local peer's input. Must be called before
    /// [`start`](Self::start).
    fn set_input(&mut self, input: Vec<u8>);

    /// Start the shuffle, producing the local peer's outbound messages.
    ///
    /// May already terminate (for a single-member group, or when every other
    /// input was stashed before the start).
    fn start<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
    ) -> Result<ProcessOutcome<Vec<Vec<u8>>>>;

    /// Handle one inbound message carrying this shuffle's tag.
    fn process_message<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<Vec<Vec<u8>>>>;

    /// The shuffle's current stage.
    fn status(&self) -> &Status;

    /// Group indices of members attributed as faulty.
    fn bad_members(&self) -> &[usize];
}

mod storage {
    use super::TypeTag;

    pub(super) struct Input;
    impl TypeTag for Input {
        type Value = Vec<u8>;
    }
}

/// An authenticated exchange-and-sort [`ShuffleRound`].
///
/// Provides the agreement contract only; see the module documentation for
/// the anonymity caveat.
#[derive(Debug)]
pub struct PlainShuffle {
    sid: RoundId,
    credentials: Credentials,
    group: Group,
    tag: ShuffleMessageType,
    input: Option<Vec<u8>>,
    local_storage: LocalStorage,
    stash: MessageLog,
    status: Status,
    bad_members: Vec<usize>,
}

impl PlainShuffle {
    fn flag_bad(&mut self, idx: usize) {
        if !self.bad_members.contains(&idx) {
            self.bad_members.push(idx);
            self.bad_members.sort_unstable();
        }
    }

    /// Validate and store one peer's input.
    fn handle_input(&mut self, message: &Message) -> Result<ProcessOutcome<Vec<Vec<u8>>>> {
        let idx = match validate_sender(message, self.sid, &self.group) {
            Ok(idx) => idx,
            Err(InternalError::ProtocolFault(fault, peer)) => {
                warn!("Dropping shuffle input: {fault}");
                if let Some(idx) = peer.and_then(|id| self.group.index_of(id)) {
                    self.flag_bad(idx);
                }
                return Ok(ProcessOutcome::Incomplete);
            }
            Err(err) => return Err(err),
        };

        let input: Vec<u8> = match deserialize!(&message.unverified_bytes) {
            Ok(input) => input,
            Err(_) => {
                warn!("Dropping undecodable shuffle input from {}", message.from());
                self.flag_bad(idx);
                return Ok(ProcessOutcome::Incomplete);
            }
        };

        if self.local_storage.contains::<storage::Input>(message.from()) {
            let stored = self.local_storage.retrieve::<storage::Input>(message.from())?;
            if *stored != input {
                warn!(
                    "{} in shuffle input from {}; keeping the first",
                    Fault::DuplicateSubmission,
                    message.from()
                );
                self.flag_bad(idx);
            }
            return Ok(ProcessOutcome::Incomplete);
        }

        self.local_storage
            .store_once::<storage::Input>(message.from(), input)?;
        self.maybe_finish()
    }

    /// Terminate once an input from every member is in.
    fn maybe_finish(&mut self) -> Result<ProcessOutcome<Vec<Vec<u8>>>> {
        let everyone = self.group.peer_ids();
        if !self
            .local_storage
            .contains_for_all_ids::<storage::Input>(&everyone)
        {
            return Ok(ProcessOutcome::Incomplete);
        }

        let mut outputs = everyone
            .into_iter()
            .map(|id| self.local_storage.remove::<storage::Input>(id))
            .collect::<Result<Vec<_>>>()?;
        // Canonical order: every honest peer sorts the same way.
        outputs.sort();

        info!("Shuffle {:?} finished with {} inputs", self.tag, outputs.len());
        self.status = Status::Finished;
        Ok(ProcessOutcome::Terminated(outputs))
    }
}

impl ShuffleRound for PlainShuffle {
    fn create(
        sid: RoundId,
        credentials: Credentials,
        group: Group,
        tag: ShuffleMessageType,
    ) -> Result<Self> {
        if !group.contains(credentials.id()) {
            Err(CallerError::BadInput)?;
        }
        Ok(Self {
            sid,
            credentials,
            group,
            tag,
            input: None,
            local_storage: Default::default(),
            stash: Default::default(),
            status: Status::Offline,
            bad_members: Vec::new(),
        })
    }

    fn set_input(&mut self, input: Vec<u8>) {
        self.input = Some(input);
    }

    fn start<R: RngCore + CryptoRng>(
        &mut self,
        _rng: &mut R,
    ) -> Result<ProcessOutcome<Vec<Vec<u8>>>> {
        if self.status != Status::Offline {
            Err(CallerError::BadInput)?;
        }
        let input = self.input.clone().ok_or(CallerError::BadInput)?;

        self.local_storage
            .store_once::<storage::Input>(self.credentials.id(), input.clone())?;
        self.status = Status::CollectingInputs;

        let messages = crate::messages::messages_to_others(
            MessageType::Shuffle(self.tag),
            self.sid,
            &self.credentials,
            &self.group,
            &input,
        )?;

        // Replay inputs that arrived before we started.
        let mut outcomes = Vec::new();
        for stashed in self.stash.drain(MessageType::Shuffle(self.tag)) {
            outcomes.push(self.handle_input(&stashed)?);
        }
        outcomes.push(self.maybe_finish()?);

        ProcessOutcome::collect_with_messages(outcomes, messages)
    }

    fn process_message<R: RngCore + CryptoRng>(
        &mut self,
        _rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<Vec<Vec<u8>>>> {
        if self.status == Status::Finished {
            Err(CallerError::ProtocolAlreadyTerminated)?;
        }
        message.check_type(MessageType::Shuffle(self.tag))?;

        if self.status == Status::Offline {
            if !self.stash.append(message) {
                warn!("Ignoring redelivered early shuffle input");
            }
            return Ok(ProcessOutcome::Incomplete);
        }

        self.handle_input(message)
    }

    fn status(&self) -> &Status {
        &self.status
    }

    fn bad_members(&self) -> &[usize] {
        &self.bad_members
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        group::{GroupMember, SubgroupPolicy},
        protocol::PeerId,
        utils::testing::init_testing,
    };
    use rand::rngs::StdRng;

    fn quorum(n: usize, rng: &mut StdRng) -> (Vec<Credentials>, Group) {
        let creds = (0..n).map(|_| Credentials::random(rng)).collect::<Vec<_>>();
        let roster = creds.iter().map(GroupMember::from_credentials).collect();
        let group = Group::new(roster, PeerId::ZERO, SubgroupPolicy::CompleteGroup);
        (creds, group)
    }

    fn run_shuffle(
        inputs: &[&[u8]],
        rng: &mut StdRng,
    ) -> Vec<Option<Vec<Vec<u8>>>> {
        let (creds, group) = quorum(inputs.len(), rng);
        let sid = RoundId::random(rng);
        let mut shuffles = creds
            .iter()
            .zip(inputs)
            .map(|(c, input)| {
                let mut s = PlainShuffle::create(
                    sid,
                    c.clone(),
                    group.clone(),
                    ShuffleMessageType::DescriptorInput,
                )
                .unwrap();
                s.set_input(input.to_vec());
                s
            })
            .collect::<Vec<_>>();

        let mut outputs = vec![None; shuffles.len()];
        let mut inbox = Vec::new();
        for (i, shuffle) in shuffles.iter_mut().enumerate() {
            let (output, messages) = shuffle.start(rng).unwrap().into_parts();
            outputs[i] = output;
            inbox.extend(messages);
        }

        while let Some(message) = inbox.pop() {
            let (i, shuffle) = shuffles
                .iter_mut()
                .enumerate()
                .find(|(_, s)| s.credentials.id() == message.to())
                .unwrap();
            let (output, messages) = shuffle.process_message(rng, &message).unwrap().into_parts();
            if let Some(output) = output {
                outputs[i] = Some(output);
            }
            inbox.extend(messages);
        }
        outputs
    }

    #[test]
    fn all_peers_agree_on_the_sorted_output() {
        let mut rng = init_testing();
        let outputs = run_shuffle(&[b"cherry", b"apple", b"banana"], &mut rng);

        let expected: Vec<Vec<u8>> =
            vec![b"apple".to_vec(), b"banana".to_vec(), b"cherry".to_vec()];
        for output in outputs {
            assert_eq!(output.unwrap(), expected);
        }
    }

    #[test]
    fn single_member_shuffle_terminates_at_start() {
        let mut rng = init_testing();
        let outputs = run_shuffle(&[b"solo"], &mut rng);
        assert_eq!(outputs[0].as_ref().unwrap(), &vec![b"solo".to_vec()]);
    }

    #[test]
    fn early_inputs_are_stashed_and_replayed() {
        let mut rng = init_testing();
        let (creds, group) = quorum(2, &mut rng);
        let sid = RoundId::random(&mut rng);

        let mut alice = PlainShuffle::create(
            sid,
            creds[0].clone(),
            group.clone(),
            ShuffleMessageType::DescriptorInput,
        )
        .unwrap();
        alice.set_input(b"a".to_vec());
        let mut bob = PlainShuffle::create(
            sid,
            creds[1].clone(),
            group,
            ShuffleMessageType::DescriptorInput,
        )
        .unwrap();
        bob.set_input(b"b".to_vec());

        // Bob's input reaches Alice before she starts.
        let (_, bob_messages) = bob.start(&mut rng).unwrap().into_parts();
        let to_alice = bob_messages
            .into_iter()
            .find(|m| m.to() == creds[0].id())
            .unwrap();
        let outcome = alice.process_message(&mut rng, &to_alice).unwrap();
        assert!(matches!(outcome, ProcessOutcome::Incomplete));

        // Starting replays the stash and completes immediately.
        let (output, _) = alice.start(&mut rng).unwrap().into_parts();
        assert_eq!(output.unwrap(), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn conflicting_duplicate_input_flags_the_sender() {
        let mut rng = init_testing();
        let (creds, group) = quorum(3, &mut rng);
        let sid = RoundId::random(&mut rng);

        let mut alice = PlainShuffle::create(
            sid,
            creds[0].clone(),
            group.clone(),
            ShuffleMessageType::DescriptorInput,
        )
        .unwrap();
        alice.set_input(b"a".to_vec());
        let _ = alice.start(&mut rng).unwrap();

        let bob_idx = group.index_of(creds[1].id()).unwrap();
        let first = Message::new(
            MessageType::Shuffle(ShuffleMessageType::DescriptorInput),
            sid,
            creds[1].id(),
            creds[0].id(),
            &b"b".to_vec(),
            creds[1].signing_key(),
        )
        .unwrap();
        let conflicting = Message::new(
            MessageType::Shuffle(ShuffleMessageType::DescriptorInput),
            sid,
            creds[1].id(),
            creds[0].id(),
            &b"z".to_vec(),
            creds[1].signing_key(),
        )
        .unwrap();

        let outcome = alice.process_message(&mut rng, &first).unwrap();
        assert!(matches!(outcome, ProcessOutcome::Incomplete));

        // The conflicting copy is dropped, the first input wins, and the
        // sender is flagged.
        let outcome = alice.process_message(&mut rng, &conflicting).unwrap();
        assert!(matches!(outcome, ProcessOutcome::Incomplete));
        assert_eq!(alice.bad_members(), &[bob_idx]);

        // A bit-identical redelivery is idempotent and flags nobody new.
        let outcome = alice.process_message(&mut rng, &first).unwrap();
        assert!(matches!(outcome, ProcessOutcome::Incomplete));
        assert_eq!(alice.bad_members(), &[bob_idx]);
    }

    #[test]
    fn unauthenticated_input_is_dropped() {
        let mut rng = init_testing();
        let (creds, group) = quorum(3, &mut rng);
        let sid = RoundId::random(&mut rng);
        let stranger = Credentials::random(&mut rng);

        let mut alice = PlainShuffle::create(
            sid,
            creds[0].clone(),
            group,
            ShuffleMessageType::DescriptorInput,
        )
        .unwrap();
        alice.set_input(b"a".to_vec());
        let _ = alice.start(&mut rng).unwrap();

        let message = Message::new(
            MessageType::Shuffle(ShuffleMessageType::DescriptorInput),
            sid,
            stranger.id(),
            creds[0].id(),
            &b"x".to_vec(),
            stranger.signing_key(),
        )
        .unwrap();
        let outcome = alice.process_message(&mut rng, &message).unwrap();
        assert!(matches!(outcome, ProcessOutcome::Incomplete));
        assert!(alice.bad_members().is_empty());
    }
}
