//! IMAP connection state machine (RFC 3501 §3): which commands are legal
//! right now is entirely a function of this enum, never ad-hoc flags
//! scattered through the command handlers.

use std::sync::Arc;

use anyhow::{bail, Result};
use imap_codec::imap_types::core::Tag;
use tokio::sync::Notify;

use pv_collections::user::User;

use crate::imap::mailbox_view::MailboxView;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxPerm {
    ReadWrite,
    ReadOnly,
}

pub enum State {
    NotAuthenticated,
    Authenticated(Arc<User>),
    Selected(Arc<User>, MailboxView, MailboxPerm),
    Idle(Arc<User>, MailboxView, MailboxPerm, Tag<'static>, Arc<Notify>),
    Logout,
}

pub enum Transition {
    None,
    Authenticate(Arc<User>),
    Select(MailboxView, MailboxPerm),
    Unselect,
    Idle(Tag<'static>, Notify),
    UnIdle,
    Logout,
}

impl State {
    /// Applies a transition produced by a command handler. Mismatched
    /// transitions (e.g. `Select` while not authenticated) are a handler
    /// bug, so this is the single choke point that would catch them.
    pub fn apply(&mut self, tr: Transition) -> Result<()> {
        *self = match (std::mem::replace(self, State::Logout), tr) {
            (s, Transition::None) => s,
            (State::NotAuthenticated, Transition::Authenticate(user)) => {
                State::Authenticated(user)
            }
            (State::Authenticated(user), Transition::Select(mailbox, perm)) => {
                State::Selected(user, mailbox, perm)
            }
            (State::Selected(user, mailbox, perm), Transition::Select(new_mailbox, new_perm)) => {
                let _ = (mailbox, perm);
                State::Selected(user, new_mailbox, new_perm)
            }
            (State::Selected(user, _, _), Transition::Unselect) => State::Authenticated(user),
            (State::Selected(user, mailbox, perm), Transition::Idle(tag, notify)) => {
                State::Idle(user, mailbox, perm, tag, Arc::new(notify))
            }
            (State::Idle(user, mailbox, perm, _, _), Transition::UnIdle) => {
                State::Selected(user, mailbox, perm)
            }
            (_, Transition::Logout) => State::Logout,
            (_, _) => bail!("illegal IMAP state transition"),
        };
        Ok(())
    }

    pub fn notify(&self) -> Option<Arc<Notify>> {
        match self {
            State::Idle(_, _, _, _, n) => Some(n.clone()),
            _ => None,
        }
    }
}
