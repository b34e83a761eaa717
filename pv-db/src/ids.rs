use std::num::{NonZeroU32, NonZeroU64};

use uuid::Uuid;

/// Per-mailbox UID, assigned at injection time and immutable for the life
/// of a `uidvalidity`.
pub type ImapUid = NonZeroU32;

/// Per-mailbox monotonically increasing change counter (CONDSTORE).
pub type ModSeq = NonZeroU64;

/// Opaque integer that changes only when a mailbox's UID space is
/// invalidated (e.g. destructive recreation under the same path).
pub type Uidvalidity = NonZeroU32;

macro_rules! surrogate_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub i64);

        impl From<i64> for $name {
            fn from(v: i64) -> Self {
                Self(v)
            }
        }

        impl From<$name> for i64 {
            fn from(v: $name) -> Self {
                v.0
            }
        }
    };
}

surrogate_id!(FieldNameId);
surrogate_id!(FlagId);
surrogate_id!(AddressId);
surrogate_id!(MailboxId);

/// A message's per-injection identity, distinct from the per-mailbox
/// `ImapUid`: the same injected message can carry a different UID in every
/// target mailbox it lands in, but only one `MessageId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl From<Uuid> for MessageId {
    fn from(v: Uuid) -> Self {
        Self(v)
    }
}

impl From<MessageId> for Uuid {
    fn from(v: MessageId) -> Self {
        v.0
    }
}

/// Stable id of a subject-threading bucket (RFC 5256 §2.1 "base subject").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);
