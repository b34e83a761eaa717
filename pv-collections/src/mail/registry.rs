//! Mailbox registry (SPEC §4.E): a process-global, append-only tree of
//! mailboxes keyed by `(owner, path)`, giving O(log n) `find`/`obtain` and
//! holding the in-memory mirror of each mailbox's monotonic counters.
//!
//! Grounded on the teacher's lazy `Mailbox`/`MailboxList` construction
//! (`aero-collections/src/mail/{mailbox,namespace}.rs`), reworked per
//! SPEC_FULL §4.E against Postgres rows instead of K2V: the SQL row is the
//! source of truth, the registry is a cache that is never dropped (entries
//! are marked deleted, never removed, matching §3's ownership rules).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use im::OrdMap;
use tokio::sync::RwLock;

use pv_db::{ImapUid, MailboxId, ModSeq, Uidvalidity};

use crate::mail::names::{AddressCache, FieldNameCache, FlagCache};
use crate::mail::session::SessionHandle;

/// In-memory mirror of one `mailboxes` row plus the list of sessions
/// currently watching it. Counters are atomics so `Injector::select_uids`
/// and concurrent readers never need to take a lock to observe them;
/// authoritative allocation still happens under `SELECT ... FOR UPDATE`
/// inside the owning transaction (see `mail::injector`).
pub struct MailboxHandle {
    pub id: MailboxId,
    pub owner: String,
    pub path: String,
    uidnext: AtomicU64,
    uidvalidity: AtomicU64,
    nextmodseq: AtomicU64,
    first_recent: AtomicU64,
    deleted: AtomicBool,
    /// Mailboxes synthesized in memory (e.g. a virtual \All view) rather
    /// than backed by a `mailboxes` row.
    pub synthetic: bool,
    sessions: RwLock<Vec<SessionHandle>>,
}

impl MailboxHandle {
    pub fn new(
        id: MailboxId,
        owner: impl Into<String>,
        path: impl Into<String>,
        uidnext: ImapUid,
        uidvalidity: Uidvalidity,
        nextmodseq: ModSeq,
        first_recent: ImapUid,
    ) -> Self {
        Self {
            id,
            owner: owner.into(),
            path: path.into(),
            uidnext: AtomicU64::new(uidnext.get() as u64),
            uidvalidity: AtomicU64::new(uidvalidity.get() as u64),
            nextmodseq: AtomicU64::new(nextmodseq.get() as u64),
            first_recent: AtomicU64::new(first_recent.get() as u64),
            deleted: AtomicBool::new(false),
            synthetic: false,
            sessions: RwLock::new(Vec::new()),
        }
    }

    pub fn uidnext(&self) -> u32 {
        self.uidnext.load(Ordering::Acquire) as u32
    }

    pub fn uidvalidity(&self) -> u32 {
        self.uidvalidity.load(Ordering::Acquire) as u32
    }

    pub fn nextmodseq(&self) -> u64 {
        self.nextmodseq.load(Ordering::Acquire)
    }

    pub fn first_recent(&self) -> u32 {
        self.first_recent.load(Ordering::Acquire) as u32
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    /// Reflects a post-commit counter advance (from `Injector::announce` or
    /// any other writer) into memory. Only ever moves forward: callers pass
    /// the new value read back from the database inside the same
    /// transaction that advanced it, so there is no ABA risk.
    pub fn advance(&self, new_uidnext: ImapUid, new_nextmodseq: ModSeq) {
        self.uidnext
            .fetch_max(new_uidnext.get() as u64, Ordering::AcqRel);
        self.nextmodseq
            .fetch_max(new_nextmodseq.get() as u64, Ordering::AcqRel);
    }

    pub fn bump_modseq(&self, new_nextmodseq: ModSeq) {
        self.nextmodseq
            .fetch_max(new_nextmodseq.get() as u64, Ordering::AcqRel);
    }

    pub fn bump_uidvalidity(&self, new_uidvalidity: Uidvalidity) {
        self.uidvalidity
            .fetch_max(new_uidvalidity.get() as u64, Ordering::AcqRel);
    }

    /// Registers a session so it is woken on the next `announce()`. The
    /// mailbox owns this list (§3 ownership rules); sessions only ever hold
    /// a mailbox id and look themselves up through the registry.
    pub async fn watch(&self, session: SessionHandle) {
        self.sessions.write().await.push(session);
    }

    /// Notifies every live session that new state is available. Dead
    /// (closed) sessions are pruned opportunistically.
    pub async fn announce(&self) {
        let mut sessions = self.sessions.write().await;
        sessions.retain(|s| s.notify());
    }
}

/// Process-wide, append-only registry of mailboxes by `(owner, path)`, with
/// a secondary index by id for callers (like the Injector) that only know
/// the mailbox's surrogate key.
#[derive(Clone, Default)]
pub struct MailboxRegistry {
    inner: Arc<RwLock<Inner>>,
    /// Process-wide name caches (§4.D), shared by every `Injector` run
    /// regardless of which user or mailbox it targets.
    field_names: FieldNameCache,
    flags: FlagCache,
    addresses: AddressCache,
}

#[derive(Default)]
struct Inner {
    by_path: OrdMap<(String, String), Arc<MailboxHandle>>,
    by_id: OrdMap<MailboxId, Arc<MailboxHandle>>,
}

impl MailboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field_names(&self) -> &FieldNameCache {
        &self.field_names
    }

    pub fn flags(&self) -> &FlagCache {
        &self.flags
    }

    pub fn addresses(&self) -> &AddressCache {
        &self.addresses
    }

    /// Returns the cached handle, if any, without touching the database.
    pub async fn find(&self, owner: &str, path: &str) -> Option<Arc<MailboxHandle>> {
        self.inner
            .read()
            .await
            .by_path
            .get(&(owner.to_string(), path.to_string()))
            .cloned()
    }

    pub async fn find_by_id(&self, id: MailboxId) -> Option<Arc<MailboxHandle>> {
        self.inner.read().await.by_id.get(&id).cloned()
    }

    /// Inserts a freshly loaded/created handle. Idempotent: if a
    /// concurrent `obtain` raced us and already inserted one, we keep that
    /// one (append-only — we never replace a live handle).
    pub async fn insert(&self, handle: Arc<MailboxHandle>) -> Arc<MailboxHandle> {
        let key = (handle.owner.clone(), handle.path.clone());
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.by_path.get(&key) {
            return existing.clone();
        }
        inner.by_path.insert(key, handle.clone());
        inner.by_id.insert(handle.id, handle.clone());
        handle
    }

    pub async fn paths_for_owner(&self, owner: &str) -> Vec<String> {
        self.inner
            .read()
            .await
            .by_path
            .iter()
            .filter(|((o, _), h)| o == owner && !h.is_deleted())
            .map(|((_, path), _)| path.clone())
            .collect()
    }
}
