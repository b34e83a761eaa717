//! Permissions / ACL (SPEC §4.I).

use std::collections::HashSet;
use std::sync::Arc;

use sqlx::PgPool;

use pv_db::MailboxId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Right {
    Read,
    Insert,
    KeepSeen,
    Expunge,
    Admin,
}

impl Right {
    fn from_char(c: char) -> Option<Self> {
        match c {
            'r' => Some(Right::Read),
            'i' => Some(Right::Insert),
            's' => Some(Right::KeepSeen),
            'e' => Some(Right::Expunge),
            'a' => Some(Right::Admin),
            _ => None,
        }
    }
}

/// Per-session ACL snapshot. Loaded once when a shared mailbox is opened
/// (see [`crate::user::User::open_session_shared`]) and held for the
/// session's lifetime — a pure data holder; the "degrade to read-only when
/// `KeepSeen` is missing" rule is applied by the caller, not here
/// (SPEC_FULL §4.I).
pub struct Permissions {
    rights: Arc<HashSet<Right>>,
}

impl Permissions {
    /// Resolves the ACL row set for `(mailbox, user)`, falling back to the
    /// `"-anyone"` row the schema allows for "everyone" grants. Owner is
    /// implicitly granted every right without a row: a mailbox's owner
    /// always has full rights over it.
    pub async fn load(pool: &PgPool, mailbox: MailboxId, user: &str, owner: &str) -> Self {
        if user == owner {
            return Self {
                rights: Arc::new(
                    [
                        Right::Read,
                        Right::Insert,
                        Right::KeepSeen,
                        Right::Expunge,
                        Right::Admin,
                    ]
                    .into_iter()
                    .collect(),
                ),
            };
        }

        let row: Option<(String,)> = sqlx::query_as(
            "select rights from permissions where mailbox = $1 and identifier in ($2, '-anyone')
             order by (identifier = $2) desc limit 1",
        )
        .bind(mailbox.0)
        .bind(user)
        .fetch_optional(pool)
        .await
        .ok()
        .flatten();

        let rights = row
            .map(|(s,)| s.chars().filter_map(Right::from_char).collect())
            .unwrap_or_default();

        Self {
            rights: Arc::new(rights),
        }
    }

    /// Always `true`: `load` is a single awaited call, so by the time the
    /// caller holds a `Permissions` it is already ready. Kept as a named
    /// predicate to mirror spec §4.I's async-readiness contract and make
    /// call sites self-documenting ("don't act before this is true").
    pub fn ready(&self) -> bool {
        true
    }

    pub fn allowed(&self, right: Right) -> bool {
        self.rights.contains(&right)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn right_parsing_matches_dovecot_style_letters() {
        assert_eq!(Right::from_char('r'), Some(Right::Read));
        assert_eq!(Right::from_char('a'), Some(Right::Admin));
        assert_eq!(Right::from_char('z'), None);
    }
}
