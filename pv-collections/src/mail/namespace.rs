//! IMAP mailbox-path conventions (unchanged in meaning from the teacher's
//! `namespace.rs`; the K2V-backed `MailboxList` CRDT it used to hold is gone
//! — mailbox existence and naming now live in the `mailboxes` SQL table and
//! are served through [`crate::mail::registry`]).

pub const MAILBOX_HIERARCHY_DELIMITER: char = '/';

/// INBOX is the only mailbox that must always exist; it is created
/// automatically the first time a user's namespace is touched.
pub const INBOX: &str = "INBOX";

/// RFC 6154 SPECIAL-USE mailboxes created alongside INBOX for new users.
pub const DRAFTS: &str = "Drafts";
pub const ARCHIVE: &str = "Archive";
pub const SENT: &str = "Sent";
pub const TRASH: &str = "Trash";

pub const DEFAULT_MAILBOXES: [&str; 4] = [DRAFTS, ARCHIVE, SENT, TRASH];

/// Splits a hierarchical mailbox path into its components, e.g.
/// `"Lists/rust/core"` -> `["Lists", "rust", "core"]`.
pub fn components(path: &str) -> Vec<&str> {
    path.split(MAILBOX_HIERARCHY_DELIMITER)
        .filter(|s| !s.is_empty())
        .collect()
}

/// `true` if `child` is `parent` itself or lives anywhere below it in the
/// hierarchy — used by rename to reject moving a mailbox into its own
/// subtree and by LIST's wildcard matching.
pub fn is_under(parent: &str, child: &str) -> bool {
    child == parent || child.starts_with(&format!("{parent}{MAILBOX_HIERARCHY_DELIMITER}"))
}

/// RFC 2342-style "Other Users" namespace root: the prefix under which a
/// client addresses a mailbox owned by a different account, ACL-gated by
/// [`crate::mail::permissions::Permissions`] (SPEC §4.I / §3 Permissions).
pub const OTHER_USERS_PREFIX: &str = "Other Users";

/// Splits `"Other Users/<owner>/<rest>"` into `(owner, rest)`. Returns
/// `None` for any path outside that namespace, including the bare prefix
/// itself (no owner named).
pub fn split_other_user(path: &str) -> Option<(&str, &str)> {
    let rest = path
        .strip_prefix(OTHER_USERS_PREFIX)?
        .strip_prefix(MAILBOX_HIERARCHY_DELIMITER)?;
    let (owner, mailbox) = rest.split_once(MAILBOX_HIERARCHY_DELIMITER)?;
    if owner.is_empty() || mailbox.is_empty() {
        return None;
    }
    Some((owner, mailbox))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_delimiter() {
        assert_eq!(components("a/b/c"), vec!["a", "b", "c"]);
        assert_eq!(components("INBOX"), vec!["INBOX"]);
    }

    #[test]
    fn under_includes_self_and_descendants() {
        assert!(is_under("Lists", "Lists"));
        assert!(is_under("Lists", "Lists/rust"));
        assert!(!is_under("Lists", "Listsx"));
    }

    #[test]
    fn splits_other_users_namespace() {
        assert_eq!(
            split_other_user("Other Users/bob/Archive"),
            Some(("bob", "Archive"))
        );
        assert_eq!(
            split_other_user("Other Users/bob/Lists/rust"),
            Some(("bob", "Lists/rust"))
        );
        assert_eq!(split_other_user("Other Users/bob"), None);
        assert_eq!(split_other_user("INBOX"), None);
    }
}
