//! A connected account: its identity plus access to its mailbox namespace.
//!
//! The teacher's `User` aggregated an encrypted K2V storage profile
//! (`aero-user::storage`) on top of login credentials. That storage layer
//! has no counterpart here — message content lives in the `mailboxes` /
//! `messages` SQL tables (§3), not in a per-user encrypted blob store — so
//! `User` is now just the authenticated username plus a handle on the
//! shared `Store`/`MailboxRegistry`, matching SPEC_FULL §4.E's "obtain
//! through an explicit root context, never an ambient global" design note.

use std::sync::Arc;

use sqlx::PgPool;

use pv_db::MailboxId;

use crate::mail::namespace::{self, DEFAULT_MAILBOXES, INBOX};
use crate::mail::permissions::{Permissions, Right};
use crate::mail::registry::{MailboxHandle, MailboxRegistry};
use crate::mail::session::Session;

pub struct User {
    pub username: String,
    pool: PgPool,
    registry: MailboxRegistry,
}

impl User {
    pub fn new(username: impl Into<String>, pool: PgPool, registry: MailboxRegistry) -> Arc<Self> {
        Arc::new(Self {
            username: username.into(),
            pool,
            registry,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn registry(&self) -> &MailboxRegistry {
        &self.registry
    }

    /// Lists the user's mailbox paths (excluding deleted ones).
    pub async fn list_mailboxes(&self) -> sqlx::Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "select name from mailboxes where owner = $1 and not deleted order by name",
        )
        .bind(&self.username)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(n,)| n).collect())
    }

    pub async fn has_mailbox(&self, name: &str) -> sqlx::Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "select id from mailboxes where owner = $1 and name = $2 and not deleted",
        )
        .bind(&self.username)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Obtains (loading or lazily creating the registry entry for) an
    /// existing mailbox. Returns `None` if it doesn't exist in SQL.
    pub async fn open_mailbox(&self, name: &str) -> sqlx::Result<Option<Arc<MailboxHandle>>> {
        if let Some(handle) = self.registry.find(&self.username, name).await {
            return Ok(Some(handle));
        }

        let row: Option<(i64, i64, i64, i64, i64)> = sqlx::query_as(
            "select id, uidnext, uidvalidity, nextmodseq, first_recent from mailboxes \
             where owner = $1 and name = $2 and not deleted",
        )
        .bind(&self.username)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        let Some((id, uidnext, uidvalidity, nextmodseq, first_recent)) = row else {
            return Ok(None);
        };

        let handle = Arc::new(MailboxHandle::new(
            MailboxId(id),
            &self.username,
            name,
            std::num::NonZeroU32::new(uidnext as u32).unwrap_or(std::num::NonZeroU32::new(1).unwrap()),
            std::num::NonZeroU32::new(uidvalidity as u32).unwrap_or(std::num::NonZeroU32::new(1).unwrap()),
            std::num::NonZeroU64::new(nextmodseq as u64).unwrap_or(std::num::NonZeroU64::new(1).unwrap()),
            std::num::NonZeroU32::new(first_recent as u32).unwrap_or(std::num::NonZeroU32::new(1).unwrap()),
        ));
        Ok(Some(self.registry.insert(handle).await))
    }

    /// Creates a mailbox row, per SPEC §3 with `uidnext`/`nextmodseq`
    /// starting at 1. Fails if the path already exists.
    pub async fn create_mailbox(&self, name: &str) -> sqlx::Result<Arc<MailboxHandle>> {
        let id: (i64,) = sqlx::query_as(
            "insert into mailboxes (name, owner) values ($1, $2) returning id",
        )
        .bind(name)
        .bind(&self.username)
        .fetch_one(&self.pool)
        .await?;

        let handle = Arc::new(MailboxHandle::new(
            MailboxId(id.0),
            &self.username,
            name,
            std::num::NonZeroU32::new(1).unwrap(),
            std::num::NonZeroU32::new(1).unwrap(),
            std::num::NonZeroU64::new(1).unwrap(),
            std::num::NonZeroU32::new(1).unwrap(),
        ));
        Ok(self.registry.insert(handle).await)
    }

    /// Opens a per-client `Session` on a mailbox, registering it with the
    /// mailbox's `MailboxHandle` so it gets woken on the next `announce()`
    /// (SELECT/EXAMINE's entry point into §4.F). Returns `None` if the
    /// mailbox doesn't exist.
    pub async fn open_session(&self, name: &str, readonly: bool) -> sqlx::Result<Option<Session>> {
        let Some(handle) = self.open_mailbox(name).await? else {
            return Ok(None);
        };
        let session = Session::open(self.pool.clone(), self.registry.clone(), &self.username, name, readonly).await?;
        handle.watch(session.handle()).await;
        Ok(Some(session))
    }

    /// Obtains (loading or lazily creating the registry entry for) a mailbox
    /// owned by a different account, without any access check — callers use
    /// this only after confirming [`Right::Read`] via [`Permissions`].
    async fn open_mailbox_owned_by(&self, owner: &str, name: &str) -> sqlx::Result<Option<Arc<MailboxHandle>>> {
        if let Some(handle) = self.registry.find(owner, name).await {
            return Ok(Some(handle));
        }

        let row: Option<(i64, i64, i64, i64, i64)> = sqlx::query_as(
            "select id, uidnext, uidvalidity, nextmodseq, first_recent from mailboxes \
             where owner = $1 and name = $2 and not deleted",
        )
        .bind(owner)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        let Some((id, uidnext, uidvalidity, nextmodseq, first_recent)) = row else {
            return Ok(None);
        };

        let handle = Arc::new(MailboxHandle::new(
            MailboxId(id),
            owner,
            name,
            std::num::NonZeroU32::new(uidnext as u32).unwrap_or(std::num::NonZeroU32::new(1).unwrap()),
            std::num::NonZeroU32::new(uidvalidity as u32).unwrap_or(std::num::NonZeroU32::new(1).unwrap()),
            std::num::NonZeroU64::new(nextmodseq as u64).unwrap_or(std::num::NonZeroU64::new(1).unwrap()),
            std::num::NonZeroU32::new(first_recent as u32).unwrap_or(std::num::NonZeroU32::new(1).unwrap()),
        ));
        Ok(Some(self.registry.insert(handle).await))
    }

    /// Opens a `Session` on a mailbox owned by another account, reached
    /// through the RFC 2342 "Other Users" namespace. Checks
    /// [`Permissions`] (§4.I) before granting access: a missing
    /// [`Right::Read`] is reported the same way as a nonexistent mailbox
    /// (§7 never distinguishes the two), and a missing [`Right::KeepSeen`]
    /// silently downgrades the session to read-only regardless of what the
    /// client asked for.
    pub async fn open_session_shared(
        &self,
        owner: &str,
        name: &str,
        readonly: bool,
    ) -> sqlx::Result<Option<Session>> {
        let Some(handle) = self.open_mailbox_owned_by(owner, name).await? else {
            return Ok(None);
        };

        let perms = Permissions::load(&self.pool, handle.id, &self.username, owner).await;
        if !perms.allowed(Right::Read) {
            return Ok(None);
        }
        let effective_readonly = readonly || !perms.allowed(Right::KeepSeen);

        let session = Session::open(self.pool.clone(), self.registry.clone(), owner, name, effective_readonly).await?;
        handle.watch(session.handle()).await;
        Ok(Some(session))
    }

    /// Marks a mailbox deleted (never physically removed — §3 ownership).
    pub async fn delete_mailbox(&self, name: &str) -> sqlx::Result<()> {
        if name == INBOX {
            return Err(sqlx::Error::Protocol("cannot delete INBOX".into()));
        }
        sqlx::query("update mailboxes set deleted = true where owner = $1 and name = $2")
            .bind(&self.username)
            .bind(name)
            .execute(&self.pool)
            .await?;
        if let Some(handle) = self.registry.find(&self.username, name).await {
            handle.mark_deleted();
        }
        Ok(())
    }

    /// Renames a mailbox and every descendant in its hierarchy (e.g.
    /// renaming `Lists` also moves `Lists/rust`), per the teacher's
    /// `rename_mailbox` semantics, now against SQL rows instead of a K2V
    /// CRDT list.
    pub async fn rename_mailbox(&self, old_name: &str, new_name: &str) -> sqlx::Result<()> {
        let names = self.list_mailboxes().await?;
        let mut txn = self.pool.begin().await?;
        for name in names.iter().filter(|n| namespace::is_under(old_name, n)) {
            let suffix = &name[old_name.len()..];
            let renamed = format!("{new_name}{suffix}");
            sqlx::query("update mailboxes set name = $1 where owner = $2 and name = $3")
                .bind(&renamed)
                .bind(&self.username)
                .bind(name)
                .execute(&mut *txn)
                .await?;
        }
        txn.commit().await?;
        Ok(())
    }

    /// Ensures INBOX plus the default RFC 6154 special-use mailboxes exist
    /// for a freshly provisioned account.
    pub async fn ensure_defaults(&self) -> sqlx::Result<()> {
        for name in std::iter::once(INBOX).chain(DEFAULT_MAILBOXES) {
            if !self.has_mailbox(name).await? {
                let _ = self.create_mailbox(name).await?;
            }
        }
        Ok(())
    }
}
