//! Session / MailboxView (SPEC §4.F): the per-client projection of one open
//! mailbox.
//!
//! Ported in spirit from the teacher's `aero-proto/src/imap/mailbox_view.rs`
//! diffing algorithm (EXPUNGE-then-EXISTS-then-FETCH ordering), but driven
//! by `refresh()` querying `mailbox_messages where modseq >= $1` instead of
//! replaying a Bayou op-log (SPEC_FULL §4.F).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use sqlx::PgPool;
use tokio::sync::Notify;

use pv_db::{ImapUid, MailboxId, MessageId, ModSeq, Uidvalidity};

use crate::mail::registry::MailboxRegistry;
use crate::mail::uidindex::MailboxIndex;

/// One queued client-visible event, emitted in protocol order by
/// `emit_responses`.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Exists(usize),
    Expunge(usize),
    Fetch { uid: ImapUid, flags: Vec<String>, modseq: ModSeq },
    Vanished(Vec<ImapUid>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    New,
    Modified,
    All,
}

/// A weak, non-owning reference a `MailboxHandle` can hold to wake a
/// session without extending its lifetime (§3 ownership: the mailbox owns
/// the session *list*, never the sessions themselves).
#[derive(Clone)]
pub struct SessionHandle {
    notify: Weak<Notify>,
}

impl SessionHandle {
    /// Wakes the session if it is still alive. Returns `false` when the
    /// session has already been dropped, so `MailboxHandle::announce` can
    /// prune it from the watch list.
    pub fn notify(&self) -> bool {
        match self.notify.upgrade() {
            Some(n) => {
                n.notify_waiters();
                true
            }
            None => false,
        }
    }
}

/// Per-client open view of one mailbox. Carries only a mailbox id, never a
/// strong reference to the `MailboxHandle`, so sessions and mailboxes don't
/// form an ownership cycle (§9 design notes).
pub struct Session {
    pool: PgPool,
    registry: MailboxRegistry,
    pub owner: String,
    pub path: String,
    pub readonly: bool,
    pub mailbox_id: i64,

    pub uidvalidity: Uidvalidity,
    pub uidnext: ImapUid,

    index: MailboxIndex,
    recent: HashSet<ImapUid>,
    last_seen_modseq: ModSeq,
    pending: VecDeque<SessionEvent>,

    refreshing: AtomicBool,
    wake: Arc<Notify>,
}

impl Session {
    /// Loads the mailbox's current rows and establishes the initial view.
    /// \Recent is assigned to every uid >= `first_recent` and, per §3,
    /// cleared for every other open session on this mailbox.
    pub async fn open(
        pool: PgPool,
        registry: MailboxRegistry,
        owner: impl Into<String>,
        path: impl Into<String>,
        readonly: bool,
    ) -> sqlx::Result<Self> {
        let owner = owner.into();
        let path = path.into();

        let row: (i64, i64, i64, i64, i64) = sqlx::query_as(
            "select uidnext, uidvalidity, nextmodseq, first_recent, id from mailboxes \
             where owner = $1 and name = $2 and not deleted",
        )
        .bind(&owner)
        .bind(&path)
        .fetch_one(&pool)
        .await?;
        let (uidnext, uidvalidity, nextmodseq, first_recent, mailbox_id) = row;

        let mut session = Self {
            pool,
            registry,
            owner,
            path,
            readonly,
            mailbox_id,
            uidvalidity: Uidvalidity::new(uidvalidity as u32).unwrap_or_else(|| Uidvalidity::new(1).unwrap()),
            uidnext: ImapUid::new(uidnext as u32).unwrap_or_else(|| ImapUid::new(1).unwrap()),
            index: MailboxIndex::new(),
            recent: HashSet::new(),
            last_seen_modseq: ModSeq::new(1).unwrap(),
            pending: VecDeque::new(),
            refreshing: AtomicBool::new(false),
            wake: Arc::new(Notify::new()),
        };

        session.load_initial(mailbox_id, first_recent, nextmodseq).await?;
        Ok(session)
    }

    async fn load_initial(&mut self, mailbox_id: i64, first_recent: i64, nextmodseq: i64) -> sqlx::Result<()> {
        let rows: Vec<(uuid::Uuid, i64, i64, Vec<String>)> =
            sqlx::query_as("select message, uid, modseq, flags from mailbox_messages where mailbox = $1 order by uid")
                .bind(mailbox_id)
                .fetch_all(&self.pool)
                .await
                .unwrap_or_default();

        for (uuid, uid, modseq, flags) in rows {
            let id = MessageId(uuid);
            let uid = match ImapUid::new(uid as u32) {
                Some(u) => u,
                None => continue,
            };
            let modseq = match ModSeq::new(modseq as u64) {
                Some(m) => m,
                None => continue,
            };
            if uid.get() as i64 >= first_recent {
                self.recent.insert(uid);
            }
            self.index.upsert(id, uid, modseq, flags);
        }
        self.last_seen_modseq = ModSeq::new(nextmodseq as u64).unwrap_or_else(|| ModSeq::new(1).unwrap());
        Ok(())
    }

    /// §4.F refresh protocol: at most one refresh runs at a time; a second
    /// caller arriving mid-refresh just awaits the same completion instead
    /// of issuing a duplicate query (the "bouncer").
    pub async fn refresh(&mut self) -> sqlx::Result<()> {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.wake.notified().await;
            return Ok(());
        }

        let result = self.do_refresh().await;
        self.refreshing.store(false, Ordering::Release);
        self.wake.notify_waiters();
        result
    }

    async fn do_refresh(&mut self) -> sqlx::Result<()> {
        let rows: Vec<(uuid::Uuid, i64, i64, Vec<String>)> = sqlx::query_as(
            "select message, uid, modseq, flags from mailbox_messages \
             where mailbox = $1 and modseq >= $2 order by uid",
        )
        .bind(self.mailbox_id)
        .bind(self.last_seen_modseq.get() as i64)
        .fetch_all(&self.pool)
        .await?;

        let seen_uids: Vec<(i64,)> =
            sqlx::query_as("select uid from mailbox_messages where mailbox = $1")
                .bind(self.mailbox_id)
                .fetch_all(&self.pool)
                .await?;
        let still_present: HashSet<u32> = seen_uids.into_iter().map(|(u,)| u as u32).collect();

        // EXPUNGE first, highest MSN to lowest, so later indices stay valid
        // as each expunge shifts everything above it down by one (§5).
        let gone: Vec<ImapUid> = self
            .index
            .uids()
            .iter()
            .copied()
            .filter(|u| !still_present.contains(&u.get()))
            .collect();
        for uid in gone.iter().rev() {
            if let Some(msn) = self.index.msn(*uid) {
                self.pending.push_back(SessionEvent::Expunge(msn));
            }
            if let Some(id) = self.index.id_by_uid(*uid) {
                self.index.remove(&id);
            }
            self.recent.remove(uid);
        }

        let mut new_count = 0;
        for (uuid, uid, modseq, flags) in rows {
            let id = MessageId(uuid);
            let Some(uid) = ImapUid::new(uid as u32) else { continue };
            let Some(modseq) = ModSeq::new(modseq as u64) else { continue };
            let is_new = !self.index.contains(&id);
            self.index.upsert(id, uid, modseq, flags.clone());
            if is_new {
                new_count += 1;
            } else {
                self.pending.push_back(SessionEvent::Fetch { uid, flags, modseq });
            }
        }
        if new_count > 0 || !gone.is_empty() {
            self.pending.push_back(SessionEvent::Exists(self.index.len()));
        }

        if let Some(h) = self.index.highest_modseq() {
            self.last_seen_modseq = ModSeq::new(h.get() + 1).unwrap_or(self.last_seen_modseq);
        }

        if let Some(handle) = self.registry.find(&self.owner, &self.path).await {
            self.uidnext = ImapUid::new(handle.uidnext()).unwrap_or(self.uidnext);
            self.uidvalidity = Uidvalidity::new(handle.uidvalidity()).unwrap_or(self.uidvalidity);
        }

        Ok(())
    }

    /// `true` iff the in-memory view is caught up to the mailbox's
    /// `uidnext` — the base contract of `ready()`; subclasses (subject
    /// threading) extend it with their own readiness condition.
    pub fn ready(&self) -> bool {
        self.index
            .uids()
            .last()
            .map(|u| u.get() + 1 >= self.uidnext.get())
            .unwrap_or(self.uidnext.get() <= 1)
    }

    pub fn msn(&self, uid: ImapUid) -> Option<usize> {
        self.index.msn(uid)
    }

    pub fn uid(&self, msn: usize) -> Option<ImapUid> {
        self.index.uid(msn)
    }

    pub fn exists(&self) -> usize {
        self.index.len()
    }

    pub fn is_recent(&self, uid: ImapUid) -> bool {
        self.recent.contains(&uid)
    }

    pub fn recent_count(&self) -> usize {
        self.recent.len()
    }

    /// Count of messages lacking `\Seen`, for the STATUS/SELECT UNSEEN item.
    pub fn unseen_count(&self) -> usize {
        self.index.len() - self.index.flagged("\\Seen").count()
    }

    /// Highest modseq known to this session's view, for HIGHESTMODSEQ
    /// (RFC 7162 §3.1.1). Falls back to 1 for an empty CONDSTORE-enabled
    /// mailbox, matching RFC 7162 §3.1.2.
    pub fn highest_modseq(&self) -> ModSeq {
        self.index.highest_modseq().unwrap_or_else(|| ModSeq::new(1).unwrap())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn message_id(&self, uid: ImapUid) -> Option<MessageId> {
        self.index.id_by_uid(uid)
    }

    pub fn flags(&self, uid: ImapUid) -> Vec<String> {
        self.index
            .id_by_uid(uid)
            .and_then(|id| self.index.entry(&id).cloned())
            .map(|(_, _, flags)| flags)
            .unwrap_or_default()
    }

    /// Stored RFC822 size, for POP3 LIST/STAT and IMAP RFC822.SIZE.
    pub async fn message_size(&self, uid: ImapUid) -> sqlx::Result<Option<i64>> {
        let Some(id) = self.message_id(uid) else {
            return Ok(None);
        };
        let row: Option<(i64,)> = sqlx::query_as("select rfc822size from messages where id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(s,)| s))
    }

    /// Best-effort `BODY[]` reconstruction: concatenates every text
    /// bodypart in part-number order. Used by IMAP FETCH BODY[] and POP3
    /// RETR/TOP — neither protocol has a stored verbatim byte copy of the
    /// original message (§3's data model keeps parsed header/bodypart rows,
    /// not a raw blob), so both reconstruct from the same rows.
    pub async fn message_body(&self, uid: ImapUid) -> sqlx::Result<Option<Vec<u8>>> {
        let Some(id) = self.message_id(uid) else {
            return Ok(None);
        };
        let rows: Vec<(Vec<u8>,)> = sqlx::query_as(
            "select b.text from part_numbers p join bodyparts b on b.id = p.bodypart \
             where p.message = $1 and b.text is not null order by p.part",
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(Some(rows.into_iter().flat_map(|(t,)| t).collect()))
    }

    /// Drains the pending expunge/exists/fetch queue into client-visible
    /// events, in the order they were recorded.
    pub fn emit_responses(&mut self, scope: Scope) -> Vec<SessionEvent> {
        match scope {
            Scope::All => self.pending.drain(..).collect(),
            Scope::New | Scope::Modified => {
                // both scopes currently share one FIFO; a protocol layer
                // wanting finer split would tag events at push time.
                self.pending.drain(..).collect()
            }
        }
    }

    pub fn clear_expunged(&mut self) -> Vec<usize> {
        let mut out = Vec::new();
        self.pending.retain(|ev| {
            if let SessionEvent::Expunge(msn) = ev {
                out.push(*msn);
                false
            } else {
                true
            }
        });
        out
    }

    /// Persists a new flag set for `uid`, atomically allocating the next
    /// `modseq` so STORE responses and other sessions' FETCH diffs agree on
    /// ordering (§4.A Query/Transaction pattern: `UPDATE ... RETURNING`).
    pub async fn set_flags(&self, uid: ImapUid, flags: Vec<String>) -> sqlx::Result<ModSeq> {
        let mut txn = self.pool.begin().await?;
        let (allocated,): (i64,) = sqlx::query_as(
            "update mailboxes set nextmodseq = nextmodseq + 1 where id = $1 returning nextmodseq - 1",
        )
        .bind(self.mailbox_id)
        .fetch_one(&mut *txn)
        .await?;
        sqlx::query(
            "update mailbox_messages set flags = $1, modseq = $2 where mailbox = $3 and uid = $4",
        )
        .bind(&flags)
        .bind(allocated)
        .bind(self.mailbox_id)
        .bind(uid.get() as i64)
        .execute(&mut *txn)
        .await?;
        txn.commit().await?;

        let modseq = ModSeq::new(allocated as u64 + 1).unwrap_or_else(|| ModSeq::new(1).unwrap());
        if let Some(handle) = self.registry.find(&self.owner, &self.path).await {
            handle.bump_modseq(modseq);
            handle.announce().await;
        }
        Ok(ModSeq::new(allocated as u64).unwrap_or_else(|| ModSeq::new(1).unwrap()))
    }

    /// Removes every `\Deleted`-flagged row from this mailbox. Callers see
    /// the resulting EXPUNGE on their next `refresh()`, including the
    /// caller itself — EXPUNGE is never synthesized locally, it always
    /// round-trips through the database so every session observes the same
    /// order (§5 invariant).
    pub async fn expunge(&self) -> sqlx::Result<u64> {
        let result = sqlx::query(
            "delete from mailbox_messages where mailbox = $1 and '\\Deleted' = any(flags)",
        )
        .bind(self.mailbox_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            if let Some(handle) = self.registry.find(&self.owner, &self.path).await {
                handle.announce().await;
            }
        }
        Ok(result.rows_affected())
    }

    /// COPY (RFC 3501 §6.4.7): since a message's bytes live independently of
    /// any one mailbox (`messages`/`bodyparts` are keyed by content, not by
    /// mailbox), copying is just allocating a uid/modseq in the destination
    /// and pointing a new `mailbox_messages` row at the same message id —
    /// no re-injection needed. Returns `(source_uid, dest_uid)` pairs in the
    /// order given, for the COPYUID response code (RFC 4315).
    pub async fn copy_to(
        &self,
        uids: &[ImapUid],
        dest_mailbox_id: i64,
    ) -> sqlx::Result<(Uidvalidity, Vec<(ImapUid, ImapUid)>)> {
        let mut out = Vec::with_capacity(uids.len());
        let mut txn = self.pool.begin().await?;
        let (dest_uidvalidity,): (i64,) = sqlx::query_as(
            "select uidvalidity from mailboxes where id = $1",
        )
        .bind(dest_mailbox_id)
        .fetch_one(&mut *txn)
        .await?;
        let mut last: Option<(i64, i64)> = None;
        for &uid in uids {
            let Some(id) = self.message_id(uid) else { continue };
            let flags = self.flags(uid);
            let (dest_uid, dest_modseq): (i64, i64) = sqlx::query_as(
                "update mailboxes set uidnext = uidnext + 1, nextmodseq = nextmodseq + 1 \
                 where id = $1 returning uidnext - 1, nextmodseq - 1",
            )
            .bind(dest_mailbox_id)
            .fetch_one(&mut *txn)
            .await?;
            sqlx::query(
                "insert into mailbox_messages (mailbox, uid, message, modseq, seen, flags) \
                 values ($1, $2, $3, $4, false, $5)",
            )
            .bind(dest_mailbox_id)
            .bind(dest_uid)
            .bind(id.0)
            .bind(dest_modseq)
            .bind(&flags)
            .execute(&mut *txn)
            .await?;
            out.push((uid, ImapUid::new(dest_uid as u32).unwrap_or(uid)));
            last = Some((dest_uid, dest_modseq));
        }
        txn.commit().await?;

        if let Some(handle) = self.registry.find_by_id(MailboxId::from(dest_mailbox_id)).await {
            if let Some((dest_uid, dest_modseq)) = last {
                handle.advance(
                    ImapUid::new(dest_uid as u32 + 1).unwrap_or_else(|| ImapUid::new(1).unwrap()),
                    ModSeq::new(dest_modseq as u64 + 1).unwrap_or_else(|| ModSeq::new(1).unwrap()),
                );
            }
            handle.announce().await;
        }

        let uidvalidity = Uidvalidity::new(dest_uidvalidity as u32).unwrap_or_else(|| Uidvalidity::new(1).unwrap());
        Ok((uidvalidity, out))
    }

    /// MOVE (RFC 6851): removes exactly the named uids from this mailbox,
    /// unlike `expunge()` which removes every `\Deleted` message. Used after
    /// `copy_to` has landed the messages in their destination.
    pub async fn remove_uids(&self, uids: &[ImapUid]) -> sqlx::Result<()> {
        if uids.is_empty() {
            return Ok(());
        }
        let raw: Vec<i64> = uids.iter().map(|u| u.get() as i64).collect();
        sqlx::query("delete from mailbox_messages where mailbox = $1 and uid = any($2)")
            .bind(self.mailbox_id)
            .bind(&raw)
            .execute(&self.pool)
            .await?;
        if let Some(handle) = self.registry.find(&self.owner, &self.path).await {
            handle.announce().await;
        }
        Ok(())
    }

    /// A weak, non-owning handle the mailbox can keep in its session list
    /// to wake this session without owning it.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            notify: Arc::downgrade(&self.wake),
        }
    }
}

// ---- Subject threading (RFC 5256 §2.1), resolving the §9 open question ----

/// Strips reply/forward prefixes, trailing `(fwd)` markers and bracketed
/// `[...]` noise per RFC 5256 §2.1 to get the canonical thread key.
pub fn base_subject(subject: &str) -> String {
    let mut s = subject.trim();
    loop {
        let start_len = s.len();

        s = s.trim();
        if let Some(rest) = s.strip_suffix("(fwd)") {
            s = rest.trim_end();
            continue;
        }
        while s.starts_with('[') {
            if let Some(end) = s.find(']') {
                s = s[end + 1..].trim_start();
            } else {
                break;
            }
        }
        let lower = s.to_ascii_lowercase();
        for prefix in ["re:", "fw:", "fwd:"] {
            if lower.starts_with(prefix) {
                s = s[prefix.len()..].trim_start();
                break;
            }
        }

        if s.len() == start_len {
            break;
        }
    }
    s.to_ascii_lowercase()
}

/// O(1) `thread(uid)` index — the §9 open-question resolution: a direct
/// `MessageId -> ThreadId` map instead of the teacher's flagged O(n²) scan.
#[derive(Default)]
pub struct ThreadIndex {
    by_subject: HashMap<String, u64>,
    by_message: HashMap<MessageId, u64>,
    next_id: u64,
}

impl ThreadIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `message` to its thread, creating one on first sight of its
    /// base subject. Threads are maintained in insertion order implicitly:
    /// callers that need ordered membership keep a separate
    /// `ThreadId -> Vec<MessageId>` alongside this index.
    pub fn record(&mut self, message: MessageId, subject: &str) -> u64 {
        let key = base_subject(subject);
        let id = *self.by_subject.entry(key).or_insert_with(|| {
            self.next_id += 1;
            self.next_id
        });
        self.by_message.insert(message, id);
        id
    }

    pub fn thread(&self, message: &MessageId) -> Option<u64> {
        self.by_message.get(message).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_subject_strips_reply_and_bracket_noise() {
        assert_eq!(base_subject("Re: hello"), "hello");
        assert_eq!(base_subject("Re: Re: [ext] hello (fwd)"), "hello");
        assert_eq!(base_subject("Fwd: hello"), "hello");
        assert_eq!(base_subject("hello"), "hello");
    }

    #[test]
    fn thread_lookup_is_a_direct_index() {
        let mut idx = ThreadIndex::new();
        let m1 = MessageId(uuid::Uuid::from_u128(1));
        let m2 = MessageId(uuid::Uuid::from_u128(2));
        let t1 = idx.record(m1, "hello world");
        let t2 = idx.record(m2, "Re: hello world");
        assert_eq!(t1, t2);
        assert_eq!(idx.thread(&m1), Some(t1));
        assert_eq!(idx.thread(&MessageId(uuid::Uuid::from_u128(99))), None);
    }
}
