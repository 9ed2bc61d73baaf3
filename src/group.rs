// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The immutable, canonically-ordered roster of an anonymity group.
//!
//! A [`Group`] holds one [`GroupMember`] per peer (identity, message
//! signing key and static Diffie–Hellman public), sorted ascending by
//! `(id, key bytes, dh bytes)` and deduplicated by id. The value is
//! immutable behind a shared handle; [`Group::add_member`] and
//! [`Group::remove_member`] return new groups.

use std::{cmp::Ordering, collections::HashMap, sync::Arc};

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{
    dh::DH_PUBLIC_LEN,
    protocol::{Credentials, PeerId},
};

/// Number of roster members placed in the inner subgroup under
/// [`SubgroupPolicy::FixedSubgroup`].
const FIXED_SUBGROUP_SIZE: usize = 10;

/// One member of an anonymity group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    id: PeerId,
    key: VerifyingKey,
    dh: [u8; DH_PUBLIC_LEN],
}

impl GroupMember {
    /// Assemble a member record.
    pub fn new(id: PeerId, key: VerifyingKey, dh: [u8; DH_PUBLIC_LEN]) -> Self {
        Self { id, key, dh }
    }

    /// The public half of a peer's [`Credentials`].
    pub fn from_credentials(credentials: &Credentials) -> Self {
        Self {
            id: credentials.id(),
            key: credentials.verifying_key(),
            dh: credentials.dh_keypair().public_bytes(),
        }
    }

    /// The member's identity.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// The member's message verification key.
    pub fn key(&self) -> &VerifyingKey {
        &self.key
    }

    /// The member's static Diffie–Hellman public.
    pub fn dh(&self) -> &[u8; DH_PUBLIC_LEN] {
        &self.dh
    }
}

impl Ord for GroupMember {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id
            .cmp(&other.id)
            .then_with(|| self.key.as_bytes().cmp(other.key.as_bytes()))
            .then_with(|| self.dh.cmp(&other.dh))
    }
}

impl PartialOrd for GroupMember {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Rules governing the group's inner subgroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubgroupPolicy {
    /// The subgroup is the whole group.
    CompleteGroup,
    /// The subgroup is a fixed-size prefix of the sorted roster.
    FixedSubgroup,
    /// There is no subgroup.
    DisabledGroup,
}

// The policy is a single byte on the wire.
impl SubgroupPolicy {
    fn to_u8(self) -> u8 {
        match self {
            SubgroupPolicy::CompleteGroup => 0,
            SubgroupPolicy::FixedSubgroup => 1,
            SubgroupPolicy::DisabledGroup => 255,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SubgroupPolicy::CompleteGroup),
            1 => Some(SubgroupPolicy::FixedSubgroup),
            255 => Some(SubgroupPolicy::DisabledGroup),
            _ => None,
        }
    }
}

impl Serialize for SubgroupPolicy {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.to_u8())
    }
}

impl<'de> Deserialize<'de> for SubgroupPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = u8::deserialize(deserializer)?;
        SubgroupPolicy::from_u8(value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid subgroup policy {value}")))
    }
}

#[derive(Debug)]
struct GroupData {
    roster: Vec<GroupMember>,
    index: HashMap<PeerId, usize>,
    leader: PeerId,
    policy: SubgroupPolicy,
    subgroup: Option<Group>,
}

/// Members of an anonymity session, sorted in ascending order.
///
/// Immutable. Cloning is cheap (the roster is shared).
#[derive(Debug, Clone)]
pub struct Group {
    data: Arc<GroupData>,
}

impl Group {
    /// Build a group from a potentially unsorted roster.
    ///
    /// The roster is sorted and deduplicated by id; `leader` may be
    /// [`PeerId::ZERO`] for a leaderless group.
    pub fn new(roster: Vec<GroupMember>, leader: PeerId, policy: SubgroupPolicy) -> Self {
        let mut roster = roster;
        roster.sort();
        roster.dedup_by(|a, b| a.id == b.id);

        let index = roster
            .iter()
            .enumerate()
            .map(|(i, member)| (member.id, i))
            .collect::<HashMap<_, _>>();

        let subgroup = match policy {
            // CompleteGroup resolves to `self` at lookup time.
            SubgroupPolicy::CompleteGroup | SubgroupPolicy::DisabledGroup => None,
            SubgroupPolicy::FixedSubgroup => {
                let prefix = roster
                    .iter()
                    .take(FIXED_SUBGROUP_SIZE)
                    .cloned()
                    .collect::<Vec<_>>();
                let inner_leader = if prefix.iter().any(|m| m.id == leader) {
                    leader
                } else {
                    PeerId::ZERO
                };
                Some(Group::new(prefix, inner_leader, SubgroupPolicy::CompleteGroup))
            }
        };

        Self {
            data: Arc::new(GroupData {
                roster,
                index,
                leader,
                policy,
                subgroup,
            }),
        }
    }

    /// An empty, leaderless group.
    pub fn empty() -> Self {
        Group::new(Vec::new(), PeerId::ZERO, SubgroupPolicy::CompleteGroup)
    }

    /// The sorted roster.
    pub fn roster(&self) -> &[GroupMember] {
        &self.data.roster
    }

    /// Number of members.
    pub fn count(&self) -> usize {
        self.data.roster.len()
    }

    /// Whether `id` is a member.
    pub fn contains(&self, id: PeerId) -> bool {
        self.data.index.contains_key(&id)
    }

    /// The position of `id` in the sorted roster.
    pub fn index_of(&self, id: PeerId) -> Option<usize> {
        self.data.index.get(&id).copied()
    }

    /// The id at position `idx` in the sorted roster.
    pub fn id_at(&self, idx: usize) -> Option<PeerId> {
        self.data.roster.get(idx).map(|m| m.id)
    }

    /// The member following `id`, cyclically.
    pub fn next(&self, id: PeerId) -> Option<PeerId> {
        let idx = self.index_of(id)?;
        self.id_at((idx + 1) % self.count())
    }

    /// The member preceding `id`, cyclically.
    pub fn previous(&self, id: PeerId) -> Option<PeerId> {
        let idx = self.index_of(id)?;
        self.id_at((idx + self.count() - 1) % self.count())
    }

    /// The verification key for `id`.
    pub fn key_of(&self, id: PeerId) -> Option<&VerifyingKey> {
        self.index_of(id).and_then(|idx| self.key_at(idx))
    }

    /// The verification key at roster position `idx`.
    pub fn key_at(&self, idx: usize) -> Option<&VerifyingKey> {
        self.data.roster.get(idx).map(|m| &m.key)
    }

    /// The static Diffie–Hellman public for `id`.
    pub fn dh_of(&self, id: PeerId) -> Option<&[u8; DH_PUBLIC_LEN]> {
        self.index_of(id).and_then(|idx| self.dh_at(idx))
    }

    /// The static Diffie–Hellman public at roster position `idx`.
    pub fn dh_at(&self, idx: usize) -> Option<&[u8; DH_PUBLIC_LEN]> {
        self.data.roster.get(idx).map(|m| &m.dh)
    }

    /// The group's leader, or [`PeerId::ZERO`] if leaderless.
    pub fn leader(&self) -> PeerId {
        self.data.leader
    }

    /// The subgroup policy.
    pub fn policy(&self) -> SubgroupPolicy {
        self.data.policy
    }

    /// The inner subgroup, if the policy defines one.
    pub fn subgroup(&self) -> Option<&Group> {
        match self.data.policy {
            SubgroupPolicy::CompleteGroup => Some(self),
            SubgroupPolicy::FixedSubgroup => self.data.subgroup.as_ref(),
            SubgroupPolicy::DisabledGroup => None,
        }
    }

    /// All member ids in roster order.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.data.roster.iter().map(|m| m.id).collect()
    }

    /// A new group with `member` added.
    pub fn add_member(&self, member: GroupMember) -> Group {
        let mut roster = self.data.roster.clone();
        roster.push(member);
        Group::new(roster, self.data.leader, self.data.policy)
    }

    /// A new group with `id` removed.
    pub fn remove_member(&self, id: PeerId) -> Group {
        let roster = self
            .data
            .roster
            .iter()
            .filter(|m| m.id != id)
            .cloned()
            .collect();
        Group::new(roster, self.data.leader, self.data.policy)
    }
}

impl PartialEq for Group {
    fn eq(&self, other: &Self) -> bool {
        self.data.roster == other.data.roster
            && self.data.leader == other.data.leader
            && self.data.policy == other.data.policy
    }
}

impl Eq for Group {}

/// Whether every member of `subset` is contained in `set`.
pub fn is_subset(set: &Group, subset: &Group) -> bool {
    subset
        .roster()
        .iter()
        .all(|m| set.roster().binary_search(m).is_ok())
}

/// The members removed from and added to a group, comparing sorted rosters.
pub fn difference(old: &Group, new: &Group) -> (Vec<GroupMember>, Vec<GroupMember>) {
    let lost = old
        .roster()
        .iter()
        .filter(|m| new.roster().binary_search(m).is_err())
        .cloned()
        .collect();
    let gained = new
        .roster()
        .iter()
        .filter(|m| old.roster().binary_search(m).is_err())
        .cloned()
        .collect();
    (lost, gained)
}

// The canonical encoding is `(leader, policy, roster-in-order)`; the index
// and subgroup are rebuilt on deserialization.
impl Serialize for Group {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        (self.data.leader, self.data.policy, &self.data.roster).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Group {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let (leader, policy, roster): (PeerId, SubgroupPolicy, Vec<GroupMember>) =
            Deserialize::deserialize(deserializer)?;
        Ok(Group::new(roster, leader, policy))
    }
}
