//! The per-client ordered view of a mailbox's messages.
//!
//! Unlike the teacher's Bayou-replicated `UidIndex` (a CRDT op-log replayed
//! from K2V), this index is rebuilt from `mailbox_messages` rows returned by
//! a `refresh()` query (SPEC §4.F) — there is no op log, no merge, and no
//! replication: the database is the single source of truth and this
//! structure is simply a deduplicated, ordered cache of what a particular
//! `Session` has already seen.

use im::{HashMap, OrdMap};

use pv_db::{ImapUid, MessageId, ModSeq};

pub type Flag = String;

/// `(uid, modseq, flags)` as last observed for one message.
pub type IndexEntry = (ImapUid, ModSeq, Vec<Flag>);

/// Ordered, deduplicated cache of the messages a session currently knows
/// about in one mailbox. `msn(uid) = 1 + position of uid in sorted order`.
#[derive(Clone, Default)]
pub struct MailboxIndex {
    table: OrdMap<MessageId, IndexEntry>,
    idx_by_uid: OrdMap<ImapUid, MessageId>,
    idx_by_flag: FlagIndex,
    /// Sorted ascending; gives O(log n) msn<->uid via binary search, the
    /// direct analogue of spec §4.F's "ordered vector of UIDs currently
    /// visible to the client".
    uids: Vec<ImapUid>,
}

impl MailboxIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.uids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uids.is_empty()
    }

    /// Inserts or updates a message. If the message was already present
    /// under the same uid, flags and modseq are replaced in place; a uid
    /// change is treated as delete-then-insert (can't happen in practice
    /// since uids are immutable for the mailbox's uidvalidity lifetime).
    pub fn upsert(&mut self, id: MessageId, uid: ImapUid, modseq: ModSeq, flags: Vec<Flag>) {
        if let Some((old_uid, _, old_flags)) = self.table.get(&id) {
            if *old_uid != uid {
                self.remove(&id);
            } else {
                self.idx_by_flag.remove(uid, old_flags);
                self.idx_by_flag.insert(uid, &flags);
                self.table.insert(id, (uid, modseq, flags));
                return;
            }
        }

        if let Err(pos) = self.uids.binary_search(&uid) {
            self.uids.insert(pos, uid);
        }
        self.idx_by_uid.insert(uid, id);
        self.idx_by_flag.insert(uid, &flags);
        self.table.insert(id, (uid, modseq, flags));
    }

    /// Removes a message (EXPUNGE). Returns the uid it held, if present.
    pub fn remove(&mut self, id: &MessageId) -> Option<ImapUid> {
        let (uid, _, flags) = self.table.remove(id)?;
        if let Ok(pos) = self.uids.binary_search(&uid) {
            self.uids.remove(pos);
        }
        self.idx_by_uid.remove(&uid);
        self.idx_by_flag.remove(uid, &flags);
        Some(uid)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.table.contains_key(id)
    }

    pub fn entry(&self, id: &MessageId) -> Option<&IndexEntry> {
        self.table.get(id)
    }

    pub fn id_by_uid(&self, uid: ImapUid) -> Option<MessageId> {
        self.idx_by_uid.get(&uid).copied()
    }

    /// 1-based message sequence number for a uid, per invariant 2:
    /// `uid(msn(u)) == u`.
    pub fn msn(&self, uid: ImapUid) -> Option<usize> {
        self.uids.binary_search(&uid).ok().map(|pos| pos + 1)
    }

    /// Inverse of `msn`: `msn(uid(k)) == k` for `1 <= k <= count`.
    pub fn uid(&self, msn: usize) -> Option<ImapUid> {
        msn.checked_sub(1).and_then(|i| self.uids.get(i)).copied()
    }

    pub fn uids(&self) -> &[ImapUid] {
        &self.uids
    }

    pub fn highest_modseq(&self) -> Option<ModSeq> {
        self.table.values().map(|(_, m, _)| *m).max()
    }

    pub fn flagged(&self, flag: &str) -> impl Iterator<Item = ImapUid> + '_ {
        self.idx_by_flag
            .get(flag)
            .into_iter()
            .flat_map(|uids| uids.iter().copied())
    }
}

// ---- Per-flag uid index, used to answer SEARCH/STATUS UNSEEN quickly ----

#[derive(Clone, Default)]
struct FlagIndex(HashMap<Flag, Vec<ImapUid>>);

impl FlagIndex {
    fn insert(&mut self, uid: ImapUid, flags: &[Flag]) {
        for flag in flags {
            let v = self.0.entry(flag.clone()).or_insert_with(Vec::new);
            if let Err(pos) = v.binary_search(&uid) {
                v.insert(pos, uid);
            }
        }
    }

    fn remove(&mut self, uid: ImapUid, flags: &[Flag]) {
        for flag in flags {
            if let Some(v) = self.0.get_mut(flag) {
                if let Ok(pos) = v.binary_search(&uid) {
                    v.remove(pos);
                }
                if v.is_empty() {
                    self.0.remove(flag);
                }
            }
        }
    }

    fn get(&self, flag: &str) -> Option<&Vec<ImapUid>> {
        self.0.get(flag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::{NonZeroU32, NonZeroU64};
    use uuid::Uuid;

    fn uid(n: u32) -> ImapUid {
        NonZeroU32::new(n).unwrap()
    }
    fn modseq(n: u64) -> ModSeq {
        NonZeroU64::new(n).unwrap()
    }

    #[test]
    fn msn_tracks_insertion_order_by_uid() {
        let mut idx = MailboxIndex::new();
        let m1 = MessageId(Uuid::from_u128(1));
        let m2 = MessageId(Uuid::from_u128(2));
        let m3 = MessageId(Uuid::from_u128(3));

        idx.upsert(m1, uid(1), modseq(1), vec!["\\Seen".into()]);
        idx.upsert(m2, uid(2), modseq(2), vec![]);
        idx.upsert(m3, uid(3), modseq(3), vec!["\\Seen".into()]);

        assert_eq!(idx.msn(uid(1)), Some(1));
        assert_eq!(idx.msn(uid(2)), Some(2));
        assert_eq!(idx.msn(uid(3)), Some(3));
        assert_eq!(idx.uid(2), Some(uid(2)));

        // invariant 2: uid(msn(u)) == u && msn(uid(k)) == k
        for k in 1..=3usize {
            let u = idx.uid(k).unwrap();
            assert_eq!(idx.msn(u), Some(k));
        }

        assert_eq!(idx.flagged("\\Seen").count(), 2);
    }

    #[test]
    fn expunge_shifts_subsequent_msns_down() {
        let mut idx = MailboxIndex::new();
        let m1 = MessageId(Uuid::from_u128(1));
        let m2 = MessageId(Uuid::from_u128(2));
        let m3 = MessageId(Uuid::from_u128(3));
        idx.upsert(m1, uid(1), modseq(1), vec![]);
        idx.upsert(m2, uid(2), modseq(2), vec![]);
        idx.upsert(m3, uid(3), modseq(3), vec![]);

        idx.remove(&m2);

        assert_eq!(idx.len(), 2);
        assert_eq!(idx.msn(uid(1)), Some(1));
        assert_eq!(idx.msn(uid(3)), Some(2));
        assert_eq!(idx.msn(uid(2)), None);
    }
}
