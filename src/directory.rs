use std::net::SocketAddrV4;

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::messaging::message::UserRecord;

/// What a participant knows about another participant (or itself)
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PeerRecord {
    pub id: u8,
    pub username: String,
    pub group_id: u8,
    pub addr: SocketAddrV4,
}

impl From<&UserRecord> for PeerRecord {
    fn from(value: &UserRecord) -> Self {
        PeerRecord {
            id: value.client_id,
            username: value.username.clone(),
            group_id: value.group_id,
            addr: value.addr,
        }
    }
}

impl From<&PeerRecord> for UserRecord {
    fn from(value: &PeerRecord) -> Self {
        UserRecord {
            client_id: value.id,
            group_id: value.group_id,
            username: value.username.clone(),
            addr: value.addr,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum UpsertOutcome {
    Inserted,
    GroupChanged { old_group_id: u8 },
    Unchanged,
}

/// In-memory mapping from peer id to peer metadata. A peer's group is the only thing that can
///  change over its lifetime, so an upsert for a known id touches nothing else.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: FxHashMap<u8, PeerRecord>,
}

impl PeerDirectory {
    pub fn new() -> PeerDirectory {
        PeerDirectory::default()
    }

    pub fn upsert(&mut self, record: PeerRecord) -> UpsertOutcome {
        if let Some(existing) = self.peers.get_mut(&record.id) {
            if existing.group_id == record.group_id {
                return UpsertOutcome::Unchanged;
            }
            let old_group_id = existing.group_id;
            trace!(id = record.id, old_group_id, new_group_id = record.group_id, "group changed");
            existing.group_id = record.group_id;
            return UpsertOutcome::GroupChanged { old_group_id };
        }

        trace!(?record, "new peer");
        self.peers.insert(record.id, record);
        UpsertOutcome::Inserted
    }

    pub fn set_group(&mut self, id: u8, group_id: u8) -> Option<UpsertOutcome> {
        let existing = self.peers.get(&id)?.clone();
        Some(self.upsert(PeerRecord { group_id, ..existing }))
    }

    pub fn remove(&mut self, id: u8) -> Option<PeerRecord> {
        self.peers.remove(&id)
    }

    pub fn find(&self, id: u8) -> Option<&PeerRecord> {
        self.peers.get(&id)
    }

    pub fn find_by_username(&self, username: &str) -> Option<&PeerRecord> {
        self.peers.values()
            .find(|p| p.username == username)
    }

    /// sorted by id to make listings and broadcasts deterministic
    pub fn all(&self) -> Vec<&PeerRecord> {
        let mut result = self.peers.values().collect::<Vec<_>>();
        result.sort_by_key(|p| p.id);
        result
    }

    pub fn members_of(&self, group_id: u8) -> Vec<&PeerRecord> {
        let mut result = self.peers.values()
            .filter(|p| p.group_id == group_id)
            .collect::<Vec<_>>();
        result.sort_by_key(|p| p.id);
        result
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
