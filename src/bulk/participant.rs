// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::{Debug, Formatter};
use tracing::{error, info, warn};
use zeroize::Zeroize;

use crate::{
    bulk::{blame, descriptor::Descriptor, mask, Input, Output, MAX_DATA_PER_ROUND},
    dh::DhKeypair,
    errors::{CallerError, Fault, InternalError, Result},
    group::Group,
    local_storage::{LocalStorage, TypeTag},
    log::MessageLog,
    messages::{BulkMessageType, Message, MessageType, ShuffleMessageType},
    participant::{InnerProtocolParticipant, ProcessOutcome, ProtocolParticipant, Status},
    protocol::{Credentials, PeerId, RoundId},
    shuffle::ShuffleRound,
    utils::{hash, HASH_LEN},
};

mod storage {
    use super::TypeTag;

    /// A validated full XOR row, keyed by the contributing member.
    pub(super) struct XorRow;
    impl TypeTag for XorRow {
        type Value = Vec<u8>;
    }
}

/// An XOR row tagged with the member it originated from, as submitted to
/// and redistributed by the leader in application-broadcast mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LoggedRow {
    origin: PeerId,
    row: Vec<u8>,
}

/**
A [`ProtocolParticipant`] that runs one bulk transmission round.

# Protocol input
A [`Input`]: the application payload source for this member's anonymous
message (up to [`MAX_DATA_PER_ROUND`] bytes are taken per round), and
whether the round runs in application-broadcast (leader) mode.

# Protocol output
An [`Output`]: on success, one recovered cleartext per slot, identical at
every honest member. If verification failed, the cleartexts are withheld
and [`Output::bad_members`] carries the group indices proven to have
deviated.

# 🔒 Storage requirement
The per-round anonymous DH secret lives only inside the participant and is
destroyed when the round finishes, aborts or is cancelled.
**/
pub struct BulkParticipant<S: ShuffleRound = crate::shuffle::PlainShuffle> {
    /// The current round identifier.
    sid: RoundId,
    /// The local member's long-lived secrets.
    credentials: Credentials,
    /// The group this round runs over.
    group: Group,
    /// The current protocol input.
    input: Input,
    /// The local member's position in the sorted roster.
    my_group_idx: usize,
    /// Whether this member aggregates rows in application-broadcast mode.
    is_leader: bool,
    /// Stage of the protocol execution.
    status: Status,
    /// Per-member storage for validated rows.
    local_storage: LocalStorage,
    /// Messages that arrived before the phase that consumes them.
    offline_log: MessageLog,
    /// Validated inbound messages, for replay.
    log: MessageLog,
    /// The descriptor shuffle.
    shuffle: Option<S>,
    /// The blame shuffle, prepared when the descriptor shuffle finishes.
    blame_shuffle: Option<S>,
    /// Whether the blame phase has begun.
    blame_active: bool,
    /// The per-round anonymous DH keypair.
    anon_dh: Option<DhKeypair>,
    /// The local member's own descriptor, to cross-check the shuffle output.
    my_descriptor: Option<Descriptor>,
    /// The closing XOR value for the local member's own slot.
    my_xor_message: Vec<u8>,
    /// Parsed descriptors in slot order.
    descriptors: Vec<Descriptor>,
    /// Byte offset of each slot within a full row.
    slot_offsets: Vec<usize>,
    /// Total row length: the sum of all descriptor lengths.
    expected_bulk_size: usize,
    /// The local member's anonymous slot, once known.
    my_idx: Option<usize>,
    /// Cells `(slot, member)` that failed hash verification.
    bad_message_hash: Vec<(usize, usize)>,
    /// Group indices of members attributed as faulty.
    bad_members: Vec<usize>,
}

impl<S: ShuffleRound> ProtocolParticipant for BulkParticipant<S> {
    type Input = Input;
    type Output = Output;

    fn new(sid: RoundId, credentials: Credentials, group: Group, input: Self::Input) -> Result<Self> {
        let my_group_idx = group
            .index_of(credentials.id())
            .ok_or(CallerError::BadInput)?;
        if input.app_broadcast() && !group.contains(group.leader()) {
            error!("Application broadcast requires the group leader to be a member");
            Err(CallerError::BadInput)?;
        }
        let is_leader = input.app_broadcast() && group.leader() == credentials.id();

        Ok(Self {
            sid,
            credentials,
            group,
            input,
            my_group_idx,
            is_leader,
            status: Status::Offline,
            local_storage: Default::default(),
            offline_log: Default::default(),
            log: Default::default(),
            shuffle: None,
            blame_shuffle: None,
            blame_active: false,
            anon_dh: None,
            my_descriptor: None,
            my_xor_message: Vec::new(),
            descriptors: Vec::new(),
            slot_offsets: Vec::new(),
            expected_bulk_size: 0,
            my_idx: None,
            bad_message_hash: Vec::new(),
            bad_members: Vec::new(),
        })
    }

    fn ready_type() -> MessageType {
        MessageType::Bulk(BulkMessageType::Ready)
    }

    fn id(&self) -> PeerId {
        self.credentials.id()
    }

    fn group(&self) -> &Group {
        &self.group
    }

    fn sid(&self) -> RoundId {
        self.sid
    }

    fn start<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<ProcessOutcome<Output>> {
        let ready = self.ready_message()?;
        self.process_message(rng, &ready)
    }

    fn process_message<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<Output>> {
        info!(
            "BULK: Player {}: received {:?} from {}",
            self.id(),
            message.message_type(),
            message.from()
        );

        match self.status {
            Status::Finished => Err(CallerError::ProtocolAlreadyTerminated)?,
            Status::Aborted => Err(InternalError::fault(Fault::Aborted))?,
            _ => {}
        }
        if message.id() != self.sid {
            Err(CallerError::WrongRound)?;
        }

        match message.message_type() {
            MessageType::Bulk(BulkMessageType::Ready) => self.handle_ready_msg(rng, message),
            MessageType::Shuffle(ShuffleMessageType::DescriptorInput) => {
                self.handle_shuffle_msg(rng, message)
            }
            MessageType::Shuffle(ShuffleMessageType::BlameInput) => {
                self.handle_blame_shuffle_msg(rng, message)
            }
            MessageType::Bulk(BulkMessageType::BulkData) => self.handle_bulk_data(rng, message),
            MessageType::Bulk(BulkMessageType::LoggedBulkData) => {
                self.handle_logged_bulk_data(rng, message)
            }
            MessageType::Bulk(BulkMessageType::AggregatedBulkData) => {
                self.handle_aggregated_bulk_data(rng, message)
            }
        }
    }

    fn status(&self) -> &Status {
        &self.status
    }

    fn bad_members(&self) -> &[usize] {
        &self.bad_members
    }
}

impl<S: ShuffleRound> InnerProtocolParticipant for BulkParticipant<S> {
    fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    fn local_storage(&self) -> &LocalStorage {
        &self.local_storage
    }

    fn local_storage_mut(&mut self) -> &mut LocalStorage {
        &mut self.local_storage
    }

    fn offline_log_mut(&mut self) -> &mut MessageLog {
        &mut self.offline_log
    }
}

impl<S: ShuffleRound> BulkParticipant<S> {
    /// The local member's anonymous slot, known once the shuffle finished.
    pub fn my_index(&self) -> Option<usize> {
        self.my_idx
    }

    /// The descriptor shuffle, once the round started.
    pub fn shuffle_round(&self) -> Option<&S> {
        self.shuffle.as_ref()
    }

    /// Whether this member aggregates rows in application-broadcast mode.
    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    /// Number of members whose row has been validated so far.
    pub fn received_messages(&self) -> usize {
        self.local_storage().count::<storage::XorRow>()
    }

    /// Cells `(slot, member)` that failed hash verification before blame.
    pub fn bad_message_hash(&self) -> &[(usize, usize)] {
        &self.bad_message_hash
    }

    /// Cancel the round. Terminal: no cleartexts are delivered, no blame is
    /// assigned, and round secrets are destroyed.
    pub fn cancel(&mut self) {
        if self.status != Status::Finished && self.status != Status::Aborted {
            info!("BULK: Player {}: round cancelled by owner", self.id());
            self.status = Status::Aborted;
            self.destroy_round_secrets();
        }
    }

    /// Mark `idx` as faulty.
    fn flag_bad(&mut self, idx: usize) {
        if !self.bad_members.contains(&idx) {
            self.bad_members.push(idx);
            self.bad_members.sort_unstable();
        }
    }

    fn inherit_bad_members(&mut self, from: &[usize]) {
        for idx in from {
            self.flag_bad(*idx);
        }
    }

    fn destroy_round_secrets(&mut self) {
        self.anon_dh = None;
        self.my_xor_message.zeroize();
        self.my_xor_message = Vec::new();
    }

    /// Round finished; clean up.
    fn finish(&mut self) {
        self.status = Status::Finished;
        self.destroy_round_secrets();
    }

    /// Terminate the round on a structural failure.
    fn abort(&mut self, fault: Fault) -> InternalError {
        error!("BULK: Player {}: aborting round: {fault}", self.id());
        self.status = Status::Aborted;
        self.destroy_round_secrets();
        InternalError::fault(fault)
    }

    /// Authenticate an inbound message, treating violations as recoverable:
    /// the message is dropped and the sender (if it is a member) flagged.
    /// Returns the sender's group index when the message is good.
    fn authenticate(&mut self, message: &Message) -> Result<Option<usize>> {
        match self.validate_sender(message) {
            Ok(idx) => Ok(Some(idx)),
            Err(InternalError::ProtocolFault(fault, peer)) => {
                warn!("Dropping message from {}: {fault}", message.from());
                if let Some(idx) = peer.and_then(|id| self.group.index_of(id)) {
                    self.flag_bad(idx);
                }
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Handle the self-addressed "Ready" message: create the round's
    /// anonymous DH keypair and descriptor, kick off the descriptor
    /// shuffle, and replay any early shuffle inputs.
    fn handle_ready_msg<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<Output>> {
        self.validate_sender(message)?;
        if message.from() != self.id() {
            return Err(InternalError::fault_by(
                Fault::UnauthorizedSender,
                message.from(),
            ));
        }
        if !self.local_storage_mut().mark_progress("start") {
            warn!("Ignoring repeated start of the bulk round");
            return Ok(ProcessOutcome::Incomplete);
        }
        info!("Handling ready bulk message.");

        let descriptor_bytes = self.create_descriptor(rng)?;

        let mut shuffle = S::create(
            self.sid,
            self.credentials.clone(),
            self.group.clone(),
            ShuffleMessageType::DescriptorInput,
        )?;
        shuffle.set_input(descriptor_bytes);
        let shuffle_outcome = shuffle.start(rng)?;
        self.shuffle = Some(shuffle);
        self.status = Status::Shuffling;

        let mut outcomes = vec![self.absorb_shuffle_outcome(rng, shuffle_outcome)?];
        for stashed in self.fetch_stashed(MessageType::Shuffle(ShuffleMessageType::DescriptorInput))
        {
            if self.status == Status::Finished {
                break;
            }
            outcomes.push(self.handle_shuffle_msg(rng, &stashed)?);
        }
        ProcessOutcome::collect(outcomes)
    }

    /// Build this round's descriptor from the application payload.
    ///
    /// For every other member the expected mask is derived from the
    /// anonymous secret and that member's static DH public; the local
    /// member's own cell commits to the closing value that makes the slot's
    /// XOR sum equal the cleartext.
    fn create_descriptor<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<Vec<u8>> {
        let anon_dh = DhKeypair::generate(rng);
        let (data, more) = self.input.data_mut().get_data(MAX_DATA_PER_ROUND);
        if more {
            info!("Application has more data queued than fits in one round");
        }

        let count = self.group.count();
        let mut xor_hashes = vec![[0u8; HASH_LEN]; count];
        let mut own_contribution = data.clone();
        for idx in 0..count {
            if idx == self.my_group_idx {
                continue;
            }
            let member_dh = self
                .group
                .dh_at(idx)
                .ok_or(InternalError::InternalInvariantFailed)?;
            let mask = mask::keystream(&anon_dh.shared_secret(member_dh), data.len());
            xor_hashes[idx] = hash(&mask);
            mask::xor_assign(&mut own_contribution, &mask)?;
        }
        xor_hashes[self.my_group_idx] = hash(&own_contribution);

        #[cfg(test)]
        let cleartext_hash = if self.input.tampered_cleartext_hash() {
            let mut lying = hash(&data);
            lying[0] ^= 0x01;
            lying
        } else {
            hash(&data)
        };
        #[cfg(not(test))]
        let cleartext_hash = hash(&data);

        let descriptor = Descriptor::new(
            data.len(),
            anon_dh.public_bytes(),
            xor_hashes,
            cleartext_hash,
        );
        let bytes = descriptor.to_bytes();

        self.anon_dh = Some(anon_dh);
        self.my_descriptor = Some(descriptor);
        self.my_xor_message = own_contribution;
        Ok(bytes)
    }

    /// Route a descriptor shuffle message into the inner shuffle.
    fn handle_shuffle_msg<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<Output>> {
        match self.status {
            Status::Offline => {
                self.stash_message(message)?;
                return Ok(ProcessOutcome::Incomplete);
            }
            Status::Shuffling => {}
            _ => {
                warn!("Ignoring late descriptor shuffle message");
                return Ok(ProcessOutcome::Incomplete);
            }
        }

        let shuffle = self
            .shuffle
            .as_mut()
            .ok_or(InternalError::InternalInvariantFailed)?;
        let outcome = match shuffle.process_message(rng, message) {
            Ok(outcome) => outcome,
            Err(InternalError::ProtocolFault(fault, _)) => {
                error!("Descriptor shuffle failed: {fault}");
                let bad = shuffle.bad_members().to_vec();
                self.inherit_bad_members(&bad);
                return Err(self.abort(Fault::ShuffleFailure));
            }
            Err(err) => return Err(err),
        };
        self.absorb_shuffle_outcome(rng, outcome)
    }

    /// Convert a descriptor shuffle outcome, continuing the round when the
    /// shuffle terminates.
    fn absorb_shuffle_outcome<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        outcome: ProcessOutcome<Vec<Vec<u8>>>,
    ) -> Result<ProcessOutcome<Output>> {
        let (outputs, messages) = outcome.into_parts();
        match outputs {
            Some(outputs) => Ok(self
                .handle_shuffle_finished(rng, outputs)?
                .with_messages(messages)),
            None => Ok(ProcessOutcome::from_parts(None, messages)),
        }
    }

    /// The descriptor shuffle delivered the permuted descriptors: determine
    /// the local slot, generate and emit the full XOR row, and move to the
    /// data sharing phase.
    fn handle_shuffle_finished<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        outputs: Vec<Vec<u8>>,
    ) -> Result<ProcessOutcome<Output>> {
        info!("Descriptor shuffle finished with {} slots", outputs.len());

        if let Some(shuffle) = self.shuffle.as_ref() {
            let bad = shuffle.bad_members().to_vec();
            self.inherit_bad_members(&bad);
        }

        let count = self.group.count();
        if outputs.len() != count {
            return Err(self.abort(Fault::MalformedMessage));
        }
        let mut descriptors = Vec::with_capacity(count);
        for bytes in &outputs {
            match Descriptor::from_bytes(bytes, count) {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(_) => {
                    // The submitter is anonymous; nobody can be charged.
                    return Err(self.abort(Fault::MalformedMessage));
                }
            }
        }

        let mut seen_dh = HashSet::new();
        for descriptor in &descriptors {
            if !seen_dh.insert(*descriptor.anon_dh()) {
                error!("Two descriptors share an anonymous DH public");
                return Err(self.abort(Fault::MalformedMessage));
            }
        }

        let anon_dh = self
            .anon_dh
            .as_ref()
            .ok_or(InternalError::InternalInvariantFailed)?;
        let my_public = anon_dh.public_bytes();
        let my_idx = match descriptors
            .iter()
            .position(|descriptor| *descriptor.anon_dh() == my_public)
        {
            Some(idx) => idx,
            None => {
                error!("The shuffle dropped this peer's descriptor");
                return Err(self.abort(Fault::AnonIndexNotFound));
            }
        };
        let my_descriptor = self
            .my_descriptor
            .as_ref()
            .ok_or(InternalError::InternalInvariantFailed)?;
        if descriptors[my_idx] != *my_descriptor {
            error!("The shuffle corrupted this peer's descriptor");
            return Err(self.abort(Fault::ShuffleFailure));
        }

        let mut slot_offsets = Vec::with_capacity(count);
        let mut expected_bulk_size = 0;
        for descriptor in &descriptors {
            slot_offsets.push(expected_bulk_size);
            expected_bulk_size += descriptor.length();
        }

        self.descriptors = descriptors;
        self.slot_offsets = slot_offsets;
        self.expected_bulk_size = expected_bulk_size;
        self.my_idx = Some(my_idx);

        let row = self.generate_xor_row(my_idx)?;

        // Prepared now so blame can start the moment verification fails.
        self.blame_shuffle = Some(S::create(
            self.sid,
            self.credentials.clone(),
            self.group.clone(),
            ShuffleMessageType::BlameInput,
        )?);

        self.local_storage
            .store_once::<storage::XorRow>(self.id(), row.clone())?;
        self.status = Status::DataSharing;

        if self.input.app_broadcast() {
            if self.is_leader {
                let mut outcomes = Vec::new();
                for stashed in
                    self.fetch_stashed(MessageType::Bulk(BulkMessageType::LoggedBulkData))
                {
                    if self.status == Status::Finished {
                        break;
                    }
                    outcomes.push(self.handle_logged_bulk_data(rng, &stashed)?);
                }
                if self.status != Status::Finished {
                    outcomes.push(self.maybe_process_messages(rng)?);
                }
                ProcessOutcome::collect(outcomes)
            } else {
                let submission = self.message_to(
                    MessageType::Bulk(BulkMessageType::LoggedBulkData),
                    self.group.leader(),
                    &LoggedRow {
                        origin: self.id(),
                        row,
                    },
                )?;
                self.status = Status::ReceivingLeaderData;

                let mut outcomes = Vec::new();
                for message_type in [
                    MessageType::Bulk(BulkMessageType::AggregatedBulkData),
                    MessageType::Bulk(BulkMessageType::LoggedBulkData),
                ] {
                    for stashed in self.fetch_stashed(message_type) {
                        if self.status == Status::Finished {
                            break;
                        }
                        outcomes.push(self.process_message(rng, &stashed)?);
                    }
                }
                ProcessOutcome::collect_with_messages(outcomes, vec![submission])
            }
        } else {
            let messages =
                self.message_for_other_participants(MessageType::Bulk(BulkMessageType::BulkData), &row)?;

            let mut outcomes = Vec::new();
            for stashed in self.fetch_stashed(MessageType::Bulk(BulkMessageType::BulkData)) {
                if self.status == Status::Finished {
                    break;
                }
                outcomes.push(self.handle_bulk_data(rng, &stashed)?);
            }
            if self.status != Status::Finished {
                outcomes.push(self.maybe_process_messages(rng)?);
            }
            ProcessOutcome::collect_with_messages(outcomes, messages)
        }
    }

    /// Concatenate this member's per-slot contributions in slot order.
    fn generate_xor_row(&mut self, my_idx: usize) -> Result<Vec<u8>> {
        let static_dh = self.credentials.dh_keypair();
        let mut row = Vec::with_capacity(self.expected_bulk_size);
        for (slot, descriptor) in self.descriptors.iter().enumerate() {
            if slot == my_idx {
                row.extend_from_slice(&self.my_xor_message);
            } else {
                row.extend(mask::keystream(
                    &static_dh.shared_secret(descriptor.anon_dh()),
                    descriptor.length(),
                ));
            }
        }

        #[cfg(test)]
        if let Some(tamper) = self.input.row_tamper_mut() {
            tamper(&mut row, &self.descriptors, &self.slot_offsets, my_idx);
        }

        Ok(row)
    }

    /// Handle a broadcast XOR row (standard mode).
    fn handle_bulk_data<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<Output>> {
        if self.input.app_broadcast() {
            warn!("Broadcast row received in application-broadcast mode");
            if let Some(idx) = self.group.index_of(message.from()) {
                self.flag_bad(idx);
            }
            return Ok(ProcessOutcome::Incomplete);
        }
        match self.status {
            Status::Offline | Status::Shuffling => {
                self.stash_message(message)?;
                return Ok(ProcessOutcome::Incomplete);
            }
            Status::DataSharing => {}
            _ => {
                warn!("Ignoring bulk data in state {:?}", self.status);
                return Ok(ProcessOutcome::Incomplete);
            }
        }

        let Some(idx) = self.authenticate(message)? else {
            return Ok(ProcessOutcome::Incomplete);
        };
        let row: Vec<u8> = match deserialize!(&message.unverified_bytes) {
            Ok(row) => row,
            Err(_) => {
                warn!("Undecodable row from {}", message.from());
                self.flag_bad(idx);
                return Ok(ProcessOutcome::Incomplete);
            }
        };

        self.store_row(message.from(), idx, row, message)?;
        self.maybe_process_messages(rng)
    }

    /// Validate and store one member's row; the first validated row wins.
    fn store_row(
        &mut self,
        origin: PeerId,
        origin_idx: usize,
        row: Vec<u8>,
        message: &Message,
    ) -> Result<()> {
        if row.len() != self.expected_bulk_size {
            warn!(
                "Row from {origin} has length {}, expected {}",
                row.len(),
                self.expected_bulk_size
            );
            self.flag_bad(origin_idx);
            return Ok(());
        }
        if self.local_storage.contains::<storage::XorRow>(origin) {
            let stored = self.local_storage.retrieve::<storage::XorRow>(origin)?;
            if *stored != row {
                warn!(
                    "{} from {origin}; keeping the first row",
                    Fault::DuplicateSubmission
                );
                self.flag_bad(origin_idx);
            }
            return Ok(());
        }
        self.log.append(message);
        self.local_storage
            .store_once::<storage::XorRow>(origin, row)?;
        Ok(())
    }

    /// Aggregate once a row from every member has been validated.
    fn maybe_process_messages<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
    ) -> Result<ProcessOutcome<Output>> {
        let everyone = self.all_participants();
        if !self
            .local_storage
            .contains_for_all_ids::<storage::XorRow>(&everyone)
        {
            return Ok(ProcessOutcome::Incomplete);
        }
        if !self.local_storage_mut().mark_progress("process_messages") {
            return Ok(ProcessOutcome::Incomplete);
        }
        self.process_all_rows(rng)
    }

    /// Every member's row, by group index.
    fn rows_by_index(&self) -> Result<Vec<Vec<u8>>> {
        let mut rows = Vec::with_capacity(self.group.count());
        for id in self.group.peer_ids() {
            rows.push(self.local_storage.retrieve::<storage::XorRow>(id)?.clone());
        }
        Ok(rows)
    }

    /// XOR all rows slot-wise, verify every hash commitment, and either
    /// deliver the cleartexts or route into blame.
    fn process_all_rows<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
    ) -> Result<ProcessOutcome<Output>> {
        info!("Aggregating {} rows", self.group.count());
        let rows = self.rows_by_index()?;

        let mut cleartexts = Vec::with_capacity(self.descriptors.len());
        for (slot, descriptor) in self.descriptors.iter().enumerate() {
            let offset = self.slot_offsets[slot];
            let mut recovered = vec![0u8; descriptor.length()];
            for row in &rows {
                mask::xor_assign(&mut recovered, &row[offset..offset + descriptor.length()])?;
            }
            cleartexts.push(recovered);
        }

        let (all_ok, flagged) = self.verify_hashes(&cleartexts, &rows);
        let replaying = self.status == Status::ProcessingLeaderData;

        if all_ok {
            if replaying {
                // The leader redistributed rows claiming a fault, but they
                // verify cleanly: the leader equivocated.
                warn!("Redistributed rows verify cleanly; the leader equivocated");
                return self.finish_blaming_leader();
            }
            if self.is_leader {
                info!("Leader aggregate verified; redistributing cleartexts");
                let messages = self.message_for_other_participants(
                    MessageType::Bulk(BulkMessageType::AggregatedBulkData),
                    &cleartexts,
                )?;
                self.finish();
                return Ok(ProcessOutcome::TerminatedForThisParticipant(
                    Output::delivered(cleartexts),
                    messages,
                ));
            }
            info!("All hash checks passed; delivering cleartexts");
            self.finish();
            return Ok(ProcessOutcome::Terminated(Output::delivered(cleartexts)));
        }

        warn!("{} on {} cells; entering blame", Fault::HashMismatch, flagged.len());
        if self.is_leader {
            // Redistribute the raw rows so every member can replay the
            // aggregation and enter blame locally.
            let mut messages = Vec::new();
            for (origin, row) in std::iter::zip(self.group.peer_ids(), rows.iter()) {
                messages.extend(self.message_for_other_participants(
                    MessageType::Bulk(BulkMessageType::LoggedBulkData),
                    &LoggedRow {
                        origin,
                        row: row.clone(),
                    },
                )?);
            }
            let outcome = self.begin_blame(rng, flagged)?;
            return Ok(outcome.with_messages(messages));
        }
        self.begin_blame(rng, flagged)
    }

    /// Check every recovered cleartext and every transmitted cell against
    /// the descriptor commitments. Returns whether everything passed and
    /// the flagged `(slot, member)` cells.
    fn verify_hashes(
        &self,
        cleartexts: &[Vec<u8>],
        rows: &[Vec<u8>],
    ) -> (bool, Vec<(usize, usize)>) {
        let mut all_ok = true;
        let mut flagged = Vec::new();
        for (slot, descriptor) in self.descriptors.iter().enumerate() {
            let offset = self.slot_offsets[slot];
            let cleartext_ok = hash(&cleartexts[slot]) == *descriptor.cleartext_hash();
            if !cleartext_ok {
                warn!("Cleartext for slot {slot} fails its hash check");
                all_ok = false;
            }
            let mut slot_has_bad_cell = false;
            for (idx, row) in rows.iter().enumerate() {
                let cell = &row[offset..offset + descriptor.length()];
                if hash(cell) != descriptor.xor_hashes()[idx] {
                    warn!("Contribution of member {idx} to slot {slot} fails its hash check");
                    flagged.push((slot, idx));
                    slot_has_bad_cell = true;
                    all_ok = false;
                }
            }
            if !cleartext_ok && !slot_has_bad_cell {
                // Every cell honors its commitment, so the lie is in the
                // descriptor itself. Flag the whole slot for disclosure:
                // the owner's closing cell is the only one that cannot
                // match the keystream its secret implies.
                flagged.extend((0..rows.len()).map(|idx| (slot, idx)));
            }
        }
        (all_ok, flagged)
    }

    /// Handle a logged row: a submission when this member is the leader, a
    /// redistribution from the leader otherwise.
    fn handle_logged_bulk_data<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<Output>> {
        if !self.input.app_broadcast() {
            warn!("Logged row received outside application-broadcast mode");
            if let Some(idx) = self.group.index_of(message.from()) {
                self.flag_bad(idx);
            }
            return Ok(ProcessOutcome::Incomplete);
        }

        if self.is_leader {
            match self.status {
                Status::Offline | Status::Shuffling => {
                    self.stash_message(message)?;
                    return Ok(ProcessOutcome::Incomplete);
                }
                Status::DataSharing => {}
                _ => {
                    warn!("Ignoring logged row in state {:?}", self.status);
                    return Ok(ProcessOutcome::Incomplete);
                }
            }

            let Some(idx) = self.authenticate(message)? else {
                return Ok(ProcessOutcome::Incomplete);
            };
            let logged: LoggedRow = match deserialize!(&message.unverified_bytes) {
                Ok(logged) => logged,
                Err(_) => {
                    warn!("Undecodable logged row from {}", message.from());
                    self.flag_bad(idx);
                    return Ok(ProcessOutcome::Incomplete);
                }
            };
            if logged.origin != message.from() {
                warn!("Member {} submitted a row for {}", message.from(), logged.origin);
                self.flag_bad(idx);
                return Ok(ProcessOutcome::Incomplete);
            }

            self.store_row(logged.origin, idx, logged.row, message)?;
            self.maybe_process_messages(rng)
        } else {
            match self.status {
                Status::Offline | Status::Shuffling | Status::DataSharing => {
                    self.stash_message(message)?;
                    return Ok(ProcessOutcome::Incomplete);
                }
                Status::ReceivingLeaderData => self.status = Status::ProcessingLeaderData,
                Status::ProcessingLeaderData => {}
                _ => {
                    warn!("Ignoring logged row in state {:?}", self.status);
                    return Ok(ProcessOutcome::Incomplete);
                }
            }

            let Some(_) = self.authenticate(message)? else {
                return Ok(ProcessOutcome::Incomplete);
            };
            if message.from() != self.group.leader() {
                warn!("Row redistribution from non-leader {}", message.from());
                if let Some(idx) = self.group.index_of(message.from()) {
                    self.flag_bad(idx);
                }
                return Ok(ProcessOutcome::Incomplete);
            }

            let logged: LoggedRow = match deserialize!(&message.unverified_bytes) {
                Ok(logged) => logged,
                Err(_) => {
                    warn!("Leader redistributed an undecodable row");
                    return self.finish_blaming_leader();
                }
            };
            if !self.group.contains(logged.origin) || logged.row.len() != self.expected_bulk_size {
                warn!("Leader redistributed a malformed row");
                return self.finish_blaming_leader();
            }

            if self.local_storage.contains::<storage::XorRow>(logged.origin) {
                let stored = self
                    .local_storage
                    .retrieve::<storage::XorRow>(logged.origin)?;
                if *stored != logged.row {
                    // Two different rows for one origin: the leader is not
                    // relaying faithfully.
                    warn!("Leader redistributed conflicting rows for {}", logged.origin);
                    return self.finish_blaming_leader();
                }
                return Ok(ProcessOutcome::Incomplete);
            }

            self.log.append(message);
            self.local_storage
                .store_once::<storage::XorRow>(logged.origin, logged.row)?;
            self.maybe_process_messages(rng)
        }
    }

    /// Handle the leader's aggregated cleartexts (non-leader).
    fn handle_aggregated_bulk_data<R: RngCore + CryptoRng>(
        &mut self,
        _rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<Output>> {
        if !self.input.app_broadcast() || self.is_leader {
            warn!("Unexpected aggregate from {}", message.from());
            if let Some(idx) = self.group.index_of(message.from()) {
                self.flag_bad(idx);
            }
            return Ok(ProcessOutcome::Incomplete);
        }
        match self.status {
            Status::Offline | Status::Shuffling | Status::DataSharing => {
                self.stash_message(message)?;
                return Ok(ProcessOutcome::Incomplete);
            }
            Status::ReceivingLeaderData => {}
            Status::ProcessingLeaderData => {
                // The leader redistributed rows and also sent an aggregate.
                warn!("Leader sent both rows and an aggregate; it equivocated");
                return self.finish_blaming_leader();
            }
            _ => {
                warn!("Ignoring aggregate in state {:?}", self.status);
                return Ok(ProcessOutcome::Incomplete);
            }
        }

        let Some(_) = self.authenticate(message)? else {
            return Ok(ProcessOutcome::Incomplete);
        };
        if message.from() != self.group.leader() {
            warn!("Aggregate from non-leader {}", message.from());
            if let Some(idx) = self.group.index_of(message.from()) {
                self.flag_bad(idx);
            }
            return Ok(ProcessOutcome::Incomplete);
        }
        self.status = Status::ProcessingLeaderData;

        let cleartexts: Vec<Vec<u8>> = match deserialize!(&message.unverified_bytes) {
            Ok(cleartexts) => cleartexts,
            Err(_) => {
                warn!("Leader sent an undecodable aggregate");
                return self.finish_blaming_leader();
            }
        };
        if cleartexts.len() != self.descriptors.len()
            || std::iter::zip(&cleartexts, &self.descriptors)
                .any(|(cleartext, descriptor)| cleartext.len() != descriptor.length())
        {
            warn!("Leader aggregate has the wrong shape");
            return self.finish_blaming_leader();
        }

        let verified = std::iter::zip(&cleartexts, &self.descriptors)
            .all(|(cleartext, descriptor)| hash(cleartext) == *descriptor.cleartext_hash());
        if !verified {
            // Without the raw rows there is nothing to replay; an aggregate
            // that fails its own hash checks convicts the leader.
            warn!("{} in the leader's aggregate", Fault::HashMismatch);
            return self.finish_blaming_leader();
        }

        info!("Leader aggregate verified; delivering cleartexts");
        self.finish();
        Ok(ProcessOutcome::Terminated(Output::delivered(cleartexts)))
    }

    /// Mark the leader bad and terminate.
    fn finish_blaming_leader(&mut self) -> Result<ProcessOutcome<Output>> {
        let leader_idx = self
            .group
            .index_of(self.group.leader())
            .ok_or(InternalError::InternalInvariantFailed)?;
        self.flag_bad(leader_idx);
        self.finish();
        Ok(ProcessOutcome::Terminated(Output::blamed(
            self.bad_members.clone(),
        )))
    }

    /// Verification failed: disclose the shared secrets for the flagged
    /// cells the local member can open and run them through the blame
    /// shuffle.
    fn begin_blame<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        flagged: Vec<(usize, usize)>,
    ) -> Result<ProcessOutcome<Output>> {
        self.bad_message_hash = flagged.clone();
        self.blame_active = true;

        let my_idx = self.my_idx.ok_or(InternalError::InternalInvariantFailed)?;
        let anon_dh = self
            .anon_dh
            .as_ref()
            .ok_or(InternalError::InternalInvariantFailed)?;
        let entries = blame::entries_for(
            &flagged,
            self.my_group_idx,
            my_idx,
            self.credentials.dh_keypair(),
            anon_dh,
            &self.descriptors,
            &self.group,
        );
        info!("Entering blame with {} disclosures", entries.len());

        let shuffle = self
            .blame_shuffle
            .as_mut()
            .ok_or(InternalError::InternalInvariantFailed)?;
        shuffle.set_input(blame::encode_entries(&entries));
        let outcome = shuffle.start(rng)?;

        let mut outcomes = vec![self.absorb_blame_outcome(outcome)?];
        for stashed in self.fetch_stashed(MessageType::Shuffle(ShuffleMessageType::BlameInput)) {
            if self.status == Status::Finished {
                break;
            }
            outcomes.push(self.handle_blame_shuffle_msg(rng, &stashed)?);
        }
        ProcessOutcome::collect(outcomes)
    }

    /// Route a blame shuffle message into the blame shuffle.
    fn handle_blame_shuffle_msg<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<Output>> {
        if !self.blame_active {
            self.stash_message(message)?;
            return Ok(ProcessOutcome::Incomplete);
        }

        let shuffle = self
            .blame_shuffle
            .as_mut()
            .ok_or(InternalError::InternalInvariantFailed)?;
        let outcome = match shuffle.process_message(rng, message) {
            Ok(outcome) => outcome,
            Err(InternalError::ProtocolFault(fault, _)) => {
                error!("Blame shuffle failed: {fault}");
                let bad = shuffle.bad_members().to_vec();
                self.inherit_bad_members(&bad);
                return Err(self.abort(Fault::ShuffleFailure));
            }
            Err(err) => return Err(err),
        };
        self.absorb_blame_outcome(outcome)
    }

    fn absorb_blame_outcome(
        &mut self,
        outcome: ProcessOutcome<Vec<Vec<u8>>>,
    ) -> Result<ProcessOutcome<Output>> {
        let (outputs, messages) = outcome.into_parts();
        match outputs {
            Some(outputs) => Ok(self.handle_blame_finished(outputs)?.with_messages(messages)),
            None => Ok(ProcessOutcome::from_parts(None, messages)),
        }
    }

    /// The blame shuffle delivered everyone's disclosures: attribute the
    /// faults and terminate.
    fn handle_blame_finished(&mut self, outputs: Vec<Vec<u8>>) -> Result<ProcessOutcome<Output>> {
        let mut entries = Vec::new();
        for bytes in outputs {
            match blame::decode_entries(&bytes) {
                Ok(mut parsed) => entries.append(&mut parsed),
                Err(_) => warn!("Dropping undecodable blame entry vector"),
            }
        }

        let rows = self.rows_by_index()?;
        let proven = blame::process_blame(&entries, &self.descriptors, &self.slot_offsets, &rows);
        self.inherit_bad_members(&proven);

        info!("Blame finished; bad members: {:?}", self.bad_members);
        self.finish();
        Ok(ProcessOutcome::Terminated(Output::blamed(
            self.bad_members.clone(),
        )))
    }
}

impl<S: ShuffleRound> Debug for BulkParticipant<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkParticipant")
            .field("sid", &self.sid)
            .field("id", &self.credentials.id())
            .field("status", &self.status)
            .field("is_leader", &self.is_leader)
            .field("my_idx", &self.my_idx)
            .field("bad_members", &self.bad_members)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bulk::{RowTamper, SingleMessage},
        group::{GroupMember, SubgroupPolicy},
        shuffle::PlainShuffle,
        utils::testing::init_testing,
    };
    use rand::{rngs::StdRng, Rng};
    use std::collections::HashMap;
    use tracing::debug;

    type TestBulk = BulkParticipant<PlainShuffle>;

    fn new_quorum(
        payloads: &[&[u8]],
        app_broadcast: bool,
        rng: &mut StdRng,
    ) -> (Vec<TestBulk>, Vec<Credentials>, Group, RoundId) {
        let creds = (0..payloads.len())
            .map(|_| Credentials::random(rng))
            .collect::<Vec<_>>();
        let roster = creds.iter().map(GroupMember::from_credentials).collect();
        let leader = if app_broadcast {
            creds[0].id()
        } else {
            PeerId::ZERO
        };
        let group = Group::new(roster, leader, SubgroupPolicy::CompleteGroup);
        let sid = RoundId::random(rng);

        let quorum = std::iter::zip(&creds, payloads)
            .map(|(credentials, payload)| {
                let input = Input::new(SingleMessage::new(payload.to_vec()), app_broadcast);
                TestBulk::new(sid, credentials.clone(), group.clone(), input).unwrap()
            })
            .collect();
        (quorum, creds, group, sid)
    }

    /// Delivers all messages into their respective participant's inboxes.
    fn deliver_all(messages: &[Message], inboxes: &mut HashMap<PeerId, Vec<Message>>) {
        for message in messages {
            inboxes
                .get_mut(&message.to())
                .unwrap()
                .push(message.clone());
        }
    }

    fn is_done(quorum: &[TestBulk]) -> bool {
        quorum.iter().all(|p| *p.status() == Status::Finished)
    }

    /// Pick a random participant and have it process a random inbox entry.
    fn process_messages(
        quorum: &mut [TestBulk],
        inboxes: &mut HashMap<PeerId, Vec<Message>>,
        rng: &mut StdRng,
    ) -> Option<(usize, ProcessOutcome<Output>)> {
        let index = rng.gen_range(0..quorum.len());
        let participant = quorum.get_mut(index).unwrap();
        let inbox = inboxes.get_mut(&participant.id()).unwrap();
        if inbox.is_empty() {
            return None;
        }
        let message = inbox.remove(rng.gen_range(0..inbox.len()));
        debug!(
            "processing participant: {}, with message type: {:?} from {}",
            &participant.id(),
            &message.message_type(),
            &message.from(),
        );
        Some((index, participant.process_message(rng, &message).unwrap()))
    }

    fn empty_inboxes(quorum: &[TestBulk]) -> HashMap<PeerId, Vec<Message>> {
        quorum.iter().map(|p| (p.id(), Vec::new())).collect()
    }

    fn push_ready(quorum: &[TestBulk], inboxes: &mut HashMap<PeerId, Vec<Message>>) {
        for participant in quorum {
            let inbox = inboxes.get_mut(&participant.id()).unwrap();
            inbox.push(participant.ready_message().unwrap());
        }
    }

    /// Run the quorum to completion, delivering messages in random order.
    fn run_until_done(
        quorum: &mut [TestBulk],
        inboxes: &mut HashMap<PeerId, Vec<Message>>,
        outputs: &mut [Option<Output>],
        rng: &mut StdRng,
    ) {
        while !is_done(quorum) {
            let (index, outcome) = match process_messages(quorum, inboxes, rng) {
                None => {
                    if inboxes.values().all(|inbox| inbox.is_empty()) {
                        panic!("we're stuck");
                    }
                    continue;
                }
                Some(x) => x,
            };

            match outcome {
                ProcessOutcome::Incomplete => {}
                ProcessOutcome::Processed(messages) => deliver_all(&messages, inboxes),
                ProcessOutcome::Terminated(output) => outputs[index] = Some(output),
                ProcessOutcome::TerminatedForThisParticipant(output, messages) => {
                    deliver_all(&messages, inboxes);
                    outputs[index] = Some(output);
                }
            }
        }
    }

    fn run_quorum(
        payloads: &[&[u8]],
        app_broadcast: bool,
        rng: &mut StdRng,
    ) -> (Vec<TestBulk>, Vec<Credentials>, Group, Vec<Output>) {
        let (mut quorum, creds, group, _) = new_quorum(payloads, app_broadcast, rng);
        let mut inboxes = empty_inboxes(&quorum);
        push_ready(&quorum, &mut inboxes);
        let mut outputs = vec![None; quorum.len()];
        run_until_done(&mut quorum, &mut inboxes, &mut outputs, rng);
        let outputs = outputs.into_iter().map(Option::unwrap).collect();
        (quorum, creds, group, outputs)
    }

    fn participant_mut(quorum: &mut [TestBulk], id: PeerId) -> &mut TestBulk {
        quorum.iter_mut().find(|p| p.id() == id).unwrap()
    }

    #[test]
    fn three_honest_peers_deliver_the_same_cleartexts() {
        let mut rng = init_testing();
        let (_, _, _, outputs) = run_quorum(&[b"", b"hi", b""], false, &mut rng);

        // Message delivery order is randomized, so agreement across peers
        // also exercises commutativity of the aggregation.
        assert!(outputs.windows(2).all(|o| o[0] == o[1]));
        let output = &outputs[0];
        assert_eq!(output.cleartexts().len(), 3);
        assert_eq!(output.messages(), vec![b"hi".as_slice()]);
        assert!(output.bad_members().is_empty());
    }

    #[test]
    fn all_empty_slots_still_complete() {
        let mut rng = init_testing();
        let (_, _, _, outputs) = run_quorum(&[b"", b"", b""], false, &mut rng);

        assert!(outputs.windows(2).all(|o| o[0] == o[1]));
        assert_eq!(outputs[0].cleartexts(), &[vec![], vec![], vec![]]);
        assert!(outputs[0].messages().is_empty());
    }

    #[test]
    fn single_member_round_is_trivial() {
        let mut rng = init_testing();
        let (mut quorum, _, _, _) = new_quorum(&[b"solo"], false, &mut rng);

        let outcome = quorum[0].start(&mut rng).unwrap();
        let (output, messages) = outcome.into_parts();
        assert!(messages.is_empty());
        let output = output.unwrap();
        assert_eq!(output.cleartexts(), &[b"solo".to_vec()]);
        assert!(quorum[0].is_finished());
        assert_eq!(quorum[0].my_index(), Some(0));
    }

    #[test]
    fn leader_aggregate_happy_path() {
        let mut rng = init_testing();
        let (quorum, _, _, outputs) = run_quorum(&[b"", b"", b"", b"abcd"], true, &mut rng);

        assert!(quorum[0].is_leader());
        assert!(quorum.iter().skip(1).all(|p| !p.is_leader()));
        assert!(outputs.windows(2).all(|o| o[0] == o[1]));
        assert_eq!(outputs[0].messages(), vec![b"abcd".as_slice()]);
        assert!(outputs[0].bad_members().is_empty());
    }

    fn flip_first_foreign_slot() -> RowTamper {
        Box::new(|row, descriptors, offsets, my_idx| {
            for (slot, descriptor) in descriptors.iter().enumerate() {
                if slot != my_idx && descriptor.length() > 0 {
                    row[offsets[slot]] ^= 0x01;
                    return;
                }
            }
            panic!("no foreign non-empty slot to corrupt");
        })
    }

    fn tampered_quorum(
        payloads: &[&[u8]],
        tampered: usize,
        app_broadcast: bool,
        rng: &mut StdRng,
    ) -> (Vec<TestBulk>, usize) {
        let creds = (0..payloads.len())
            .map(|_| Credentials::random(rng))
            .collect::<Vec<_>>();
        let roster = creds.iter().map(GroupMember::from_credentials).collect();
        let leader = if app_broadcast {
            creds[0].id()
        } else {
            PeerId::ZERO
        };
        let group = Group::new(roster, leader, SubgroupPolicy::CompleteGroup);
        let sid = RoundId::random(rng);

        let quorum = creds
            .iter()
            .enumerate()
            .map(|(i, credentials)| {
                let mut input =
                    Input::new(SingleMessage::new(payloads[i].to_vec()), app_broadcast);
                if i == tampered {
                    input = input.with_row_tamper(flip_first_foreign_slot());
                }
                TestBulk::new(sid, credentials.clone(), group.clone(), input).unwrap()
            })
            .collect::<Vec<_>>();
        let tampered_idx = group.index_of(creds[tampered].id()).unwrap();
        (quorum, tampered_idx)
    }

    #[test]
    fn mask_corruption_is_attributed_to_the_corrupting_member() {
        let mut rng = init_testing();
        let (mut quorum, tampered_idx) =
            tampered_quorum(&[b"", b"", b"", b"abcd"], 2, false, &mut rng);
        let mut inboxes = empty_inboxes(&quorum);
        push_ready(&quorum, &mut inboxes);
        let mut outputs = vec![None; quorum.len()];
        run_until_done(&mut quorum, &mut inboxes, &mut outputs, &mut rng);

        for output in outputs {
            let output = output.unwrap();
            assert_eq!(output.bad_members(), &[tampered_idx]);
            assert!(output.cleartexts().is_empty());
        }
        // Honest members recorded the failing cell before blame ran.
        let honest = quorum.iter().find(|p| !p.bad_members().is_empty()).unwrap();
        assert!(!honest.bad_message_hash().is_empty());
    }

    #[test]
    fn lying_cleartext_hash_is_attributed_to_the_slot_owner() {
        let mut rng = init_testing();
        let payloads: [&[u8]; 3] = [b"", b"hi", b""];
        let liar = 1;

        let creds = (0..payloads.len())
            .map(|_| Credentials::random(&mut rng))
            .collect::<Vec<_>>();
        let roster = creds.iter().map(GroupMember::from_credentials).collect();
        let group = Group::new(roster, PeerId::ZERO, SubgroupPolicy::CompleteGroup);
        let sid = RoundId::random(&mut rng);
        let mut quorum = creds
            .iter()
            .enumerate()
            .map(|(i, credentials)| {
                let mut input = Input::new(SingleMessage::new(payloads[i].to_vec()), false);
                if i == liar {
                    input = input.with_tampered_cleartext_hash();
                }
                TestBulk::new(sid, credentials.clone(), group.clone(), input).unwrap()
            })
            .collect::<Vec<_>>();
        let liar_idx = group.index_of(creds[liar].id()).unwrap();

        let mut inboxes = empty_inboxes(&quorum);
        push_ready(&quorum, &mut inboxes);
        let mut outputs = vec![None; quorum.len()];
        run_until_done(&mut quorum, &mut inboxes, &mut outputs, &mut rng);

        // Every transmitted cell honors its commitment, so the whole slot
        // is opened and the owner's closing cell gives it away.
        for output in outputs {
            let output = output.unwrap();
            assert_eq!(output.bad_members(), &[liar_idx]);
            assert!(output.cleartexts().is_empty());
        }
        let flagged = quorum[0].bad_message_hash();
        assert_eq!(flagged.len(), quorum.len());
        assert!(flagged.windows(2).all(|w| w[0].0 == w[1].0));
    }

    #[test]
    fn leader_redistributes_rows_and_everyone_blames() {
        let mut rng = init_testing();
        let (mut quorum, tampered_idx) =
            tampered_quorum(&[b"", b"hello", b""], 2, true, &mut rng);
        let mut inboxes = empty_inboxes(&quorum);
        push_ready(&quorum, &mut inboxes);
        let mut outputs = vec![None; quorum.len()];
        run_until_done(&mut quorum, &mut inboxes, &mut outputs, &mut rng);

        for output in outputs {
            let output = output.unwrap();
            assert_eq!(output.bad_members(), &[tampered_idx]);
            assert!(output.cleartexts().is_empty());
        }
    }

    #[test]
    fn messages_before_start_are_stashed_and_replayed() {
        let mut rng = init_testing();
        let (mut quorum, _, _, _) = new_quorum(&[b"late", b"", b""], false, &mut rng);
        let mut inboxes = empty_inboxes(&quorum);

        // Everyone but the last member starts; their shuffle inputs reach
        // the unstarted member, which can only stash them.
        for participant in quorum.iter().take(2) {
            let inbox = inboxes.get_mut(&participant.id()).unwrap();
            inbox.push(participant.ready_message().unwrap());
        }
        let mut outputs: Vec<Option<Output>> = vec![None; quorum.len()];
        loop {
            match process_messages(&mut quorum, &mut inboxes, &mut rng) {
                Some((_, outcome)) => {
                    let (_, messages) = outcome.into_parts();
                    deliver_all(&messages, &mut inboxes);
                }
                None => {
                    if inboxes.values().all(|inbox| inbox.is_empty()) {
                        break;
                    }
                }
            }
        }
        assert_eq!(*quorum[2].status(), Status::Offline);

        // Starting replays the stash; the round completes as if nothing had
        // arrived early.
        let inbox = inboxes.get_mut(&quorum[2].id()).unwrap();
        inbox.push(quorum[2].ready_message().unwrap());
        run_until_done(&mut quorum, &mut inboxes, &mut outputs, &mut rng);

        let outputs: Vec<Output> = outputs.into_iter().map(Option::unwrap).collect();
        assert!(outputs.windows(2).all(|o| o[0] == o[1]));
        assert_eq!(outputs[0].messages(), vec![b"late".as_slice()]);
    }

    #[test]
    fn row_arriving_before_shuffle_completion_is_stashed() {
        let mut rng = init_testing();
        let (mut quorum, creds, _, _) = new_quorum(&[b"ab", b""], false, &mut rng);

        let (_, alice_msgs) = quorum[0].start(&mut rng).unwrap().into_parts();
        let (_, bob_msgs) = quorum[1].start(&mut rng).unwrap().into_parts();

        // Bob completes his shuffle first and emits his row.
        let to_bob = alice_msgs
            .iter()
            .find(|m| m.to() == creds[1].id())
            .unwrap();
        let (_, bob_row_msgs) = quorum[1]
            .process_message(&mut rng, to_bob)
            .unwrap()
            .into_parts();
        let bob_row = bob_row_msgs
            .iter()
            .find(|m| m.message_type() == MessageType::Bulk(BulkMessageType::BulkData))
            .unwrap();

        // The row reaches Alice before Bob's shuffle input does.
        let outcome = quorum[0].process_message(&mut rng, bob_row).unwrap();
        assert!(matches!(outcome, ProcessOutcome::Incomplete));
        assert_eq!(*quorum[0].status(), Status::Shuffling);

        // Once the shuffle completes the stashed row is replayed and the
        // round terminates.
        let to_alice = bob_msgs
            .iter()
            .find(|m| m.to() == creds[0].id())
            .unwrap();
        let (output, alice_row_msgs) = quorum[0]
            .process_message(&mut rng, to_alice)
            .unwrap()
            .into_parts();
        let alice_output = output.unwrap();
        assert_eq!(alice_output.messages(), vec![b"ab".as_slice()]);

        // Bob finishes with the identical result.
        let alice_row = alice_row_msgs
            .iter()
            .find(|m| m.message_type() == MessageType::Bulk(BulkMessageType::BulkData))
            .unwrap();
        let (output, _) = quorum[1]
            .process_message(&mut rng, alice_row)
            .unwrap()
            .into_parts();
        assert_eq!(output.unwrap(), alice_output);
    }

    /// Drive a three-member round up to the point where everyone is in the
    /// data sharing phase, returning the captured row broadcasts.
    fn drive_to_data_sharing(
        quorum: &mut [TestBulk],
        rng: &mut StdRng,
    ) -> Vec<Message> {
        let mut shuffle_inputs = Vec::new();
        for participant in quorum.iter_mut() {
            let (_, messages) = participant.start(rng).unwrap().into_parts();
            shuffle_inputs.extend(messages);
        }
        let mut rows = Vec::new();
        for message in &shuffle_inputs {
            let participant = participant_mut(quorum, message.to());
            let (_, messages) = participant.process_message(rng, message).unwrap().into_parts();
            rows.extend(messages);
        }
        rows
    }

    #[test]
    fn redelivered_row_is_idempotent() {
        let mut rng = init_testing();
        let (mut quorum, creds, _, _) = new_quorum(&[b"x", b"", b""], false, &mut rng);
        let rows = drive_to_data_sharing(&mut quorum, &mut rng);

        let alice = creds[0].id();
        let from_bob = rows
            .iter()
            .find(|m| m.to() == alice && m.from() == creds[1].id())
            .unwrap();
        let from_carol = rows
            .iter()
            .find(|m| m.to() == alice && m.from() == creds[2].id())
            .unwrap();

        let participant = participant_mut(&mut quorum, alice);
        assert_eq!(participant.received_messages(), 1);

        let outcome = participant.process_message(&mut rng, from_bob).unwrap();
        assert!(matches!(outcome, ProcessOutcome::Incomplete));
        assert_eq!(participant.received_messages(), 2);

        // A bit-identical redelivery changes nothing and blames nobody.
        let outcome = participant.process_message(&mut rng, from_bob).unwrap();
        assert!(matches!(outcome, ProcessOutcome::Incomplete));
        assert_eq!(participant.received_messages(), 2);
        assert!(participant.bad_members().is_empty());

        let (output, _) = participant
            .process_message(&mut rng, from_carol)
            .unwrap()
            .into_parts();
        assert_eq!(output.unwrap().messages(), vec![b"x".as_slice()]);
    }

    #[test]
    fn conflicting_duplicate_row_flags_the_sender() {
        let mut rng = init_testing();
        let (mut quorum, creds, group, sid) = new_quorum(&[b"x", b"", b""], false, &mut rng);
        let rows = drive_to_data_sharing(&mut quorum, &mut rng);

        let alice = creds[0].id();
        let from_bob = rows
            .iter()
            .find(|m| m.to() == alice && m.from() == creds[1].id())
            .unwrap();

        // Re-sign a bit-flipped copy of Bob's row with Bob's own key.
        let mut row: Vec<u8> = bincode::deserialize(&from_bob.unverified_bytes).unwrap();
        row[0] ^= 0xff;
        let conflicting = Message::new(
            MessageType::Bulk(BulkMessageType::BulkData),
            sid,
            creds[1].id(),
            alice,
            &row,
            creds[1].signing_key(),
        )
        .unwrap();

        let bob_idx = group.index_of(creds[1].id()).unwrap();
        let participant = participant_mut(&mut quorum, alice);
        let outcome = participant.process_message(&mut rng, from_bob).unwrap();
        assert!(matches!(outcome, ProcessOutcome::Incomplete));

        let outcome = participant.process_message(&mut rng, &conflicting).unwrap();
        assert!(matches!(outcome, ProcessOutcome::Incomplete));
        assert_eq!(participant.bad_members(), &[bob_idx]);
        // The first validated row wins.
        assert_eq!(participant.received_messages(), 2);
    }

    #[test]
    fn wrong_length_row_flags_the_sender() {
        let mut rng = init_testing();
        let (mut quorum, creds, group, sid) = new_quorum(&[b"x", b"", b""], false, &mut rng);
        let _ = drive_to_data_sharing(&mut quorum, &mut rng);

        let alice = creds[0].id();
        let too_long = Message::new(
            MessageType::Bulk(BulkMessageType::BulkData),
            sid,
            creds[1].id(),
            alice,
            &vec![0u8; 2],
            creds[1].signing_key(),
        )
        .unwrap();

        let bob_idx = group.index_of(creds[1].id()).unwrap();
        let participant = participant_mut(&mut quorum, alice);
        let outcome = participant.process_message(&mut rng, &too_long).unwrap();
        assert!(matches!(outcome, ProcessOutcome::Incomplete));
        assert_eq!(participant.bad_members(), &[bob_idx]);
        assert_eq!(participant.received_messages(), 1);
        assert_eq!(*participant.status(), Status::DataSharing);
    }

    /// A two-member group where the second member exists only as
    /// credentials the test signs messages with.
    fn one_real_one_scripted(
        payload: &[u8],
        app_broadcast: bool,
        rng: &mut StdRng,
    ) -> (TestBulk, Credentials, Group, RoundId) {
        let real = Credentials::random(rng);
        let scripted = Credentials::random(rng);
        let roster = vec![
            GroupMember::from_credentials(&real),
            GroupMember::from_credentials(&scripted),
        ];
        let leader = if app_broadcast {
            scripted.id()
        } else {
            PeerId::ZERO
        };
        let group = Group::new(roster, leader, SubgroupPolicy::CompleteGroup);
        let sid = RoundId::random(rng);
        let input = Input::new(SingleMessage::new(payload.to_vec()), app_broadcast);
        let participant = TestBulk::new(sid, real, group.clone(), input).unwrap();
        (participant, scripted, group, sid)
    }

    #[test]
    fn malformed_descriptor_in_shuffle_output_aborts() {
        let mut rng = init_testing();
        let (mut participant, scripted, _, sid) = one_real_one_scripted(b"hi", false, &mut rng);
        let _ = participant.start(&mut rng).unwrap();

        let garbage = Message::new(
            MessageType::Shuffle(ShuffleMessageType::DescriptorInput),
            sid,
            scripted.id(),
            participant.id(),
            &b"not a descriptor".to_vec(),
            scripted.signing_key(),
        )
        .unwrap();

        let err = participant.process_message(&mut rng, &garbage).unwrap_err();
        assert!(matches!(
            err,
            InternalError::ProtocolFault(Fault::MalformedMessage, None)
        ));
        assert_eq!(*participant.status(), Status::Aborted);
        // The submitter is anonymous; nobody is blamed.
        assert!(participant.bad_members().is_empty());
    }

    #[test]
    fn duplicate_anonymous_dh_publics_abort() {
        let mut rng = init_testing();
        let (mut participant, scripted, _, sid) = one_real_one_scripted(b"hi", false, &mut rng);
        let (_, messages) = participant.start(&mut rng).unwrap().into_parts();

        // The scripted member replays the real member's own descriptor.
        let copied: Vec<u8> = bincode::deserialize(&messages[0].unverified_bytes).unwrap();
        let replayed = Message::new(
            MessageType::Shuffle(ShuffleMessageType::DescriptorInput),
            sid,
            scripted.id(),
            participant.id(),
            &copied,
            scripted.signing_key(),
        )
        .unwrap();

        let err = participant.process_message(&mut rng, &replayed).unwrap_err();
        assert!(matches!(
            err,
            InternalError::ProtocolFault(Fault::MalformedMessage, None)
        ));
        assert_eq!(*participant.status(), Status::Aborted);
    }

    #[test]
    fn leader_aggregate_failing_hash_checks_blames_the_leader() {
        let mut rng = init_testing();
        let (mut participant, leader, group, sid) = one_real_one_scripted(b"hi", true, &mut rng);
        let (_, messages) = participant.start(&mut rng).unwrap().into_parts();
        let own_descriptor: Vec<u8> = bincode::deserialize(&messages[0].unverified_bytes).unwrap();

        // A structurally valid descriptor for the leader's empty slot.
        let leader_descriptor = Descriptor::new(
            0,
            rng.gen(),
            vec![hash(b""), hash(b"")],
            hash(b""),
        );
        let leader_input = Message::new(
            MessageType::Shuffle(ShuffleMessageType::DescriptorInput),
            sid,
            leader.id(),
            participant.id(),
            &leader_descriptor.to_bytes(),
            leader.signing_key(),
        )
        .unwrap();
        let (_, submission) = participant
            .process_message(&mut rng, &leader_input)
            .unwrap()
            .into_parts();
        assert!(submission
            .iter()
            .all(|m| m.message_type() == MessageType::Bulk(BulkMessageType::LoggedBulkData)));
        assert_eq!(*participant.status(), Status::ReceivingLeaderData);

        // The leader's aggregate has the right shape but wrong content.
        let mut slots = vec![own_descriptor, leader_descriptor.to_bytes()];
        slots.sort();
        let bogus: Vec<Vec<u8>> = slots
            .iter()
            .map(|bytes| {
                let length = Descriptor::from_bytes(bytes, 2).unwrap().length();
                vec![b'x'; length]
            })
            .collect();
        let aggregate = Message::new(
            MessageType::Bulk(BulkMessageType::AggregatedBulkData),
            sid,
            leader.id(),
            participant.id(),
            &bogus,
            leader.signing_key(),
        )
        .unwrap();

        let (output, _) = participant
            .process_message(&mut rng, &aggregate)
            .unwrap()
            .into_parts();
        let leader_idx = group.index_of(leader.id()).unwrap();
        assert_eq!(output.unwrap().bad_members(), &[leader_idx]);
        assert!(participant.is_finished());
    }

    #[test]
    fn cancellation_is_terminal() {
        let mut rng = init_testing();
        let (mut quorum, _, _, _) = new_quorum(&[b"x", b""], false, &mut rng);

        let _ = quorum[0].start(&mut rng).unwrap();
        quorum[0].cancel();
        assert_eq!(*quorum[0].status(), Status::Aborted);
        assert!(quorum[0].bad_members().is_empty());

        // Cancellation is idempotent and further messages report the abort.
        quorum[0].cancel();
        assert_eq!(*quorum[0].status(), Status::Aborted);
        let ready = quorum[0].ready_message().unwrap();
        assert!(matches!(
            quorum[0].process_message(&mut rng, &ready),
            Err(InternalError::ProtocolFault(Fault::Aborted, None))
        ));
    }

    #[test]
    fn messages_for_a_different_round_are_rejected() {
        let mut rng = init_testing();
        let (mut quorum, creds, _, _) = new_quorum(&[b"x", b""], false, &mut rng);
        let other_round = RoundId::random(&mut rng);

        let stray = Message::new(
            MessageType::Bulk(BulkMessageType::BulkData),
            other_round,
            creds[1].id(),
            creds[0].id(),
            &vec![1u8],
            creds[1].signing_key(),
        )
        .unwrap();
        assert!(matches!(
            quorum[0].process_message(&mut rng, &stray),
            Err(InternalError::CallingApplicationMistake(
                CallerError::WrongRound
            ))
        ));
    }
}
