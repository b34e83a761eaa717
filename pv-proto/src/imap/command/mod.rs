pub mod anonymous;
pub mod anystate;
pub mod authenticated;
pub mod selected;

use imap_codec::imap_types::mailbox::Mailbox as MailboxCodec;

use pv_collections::mail::namespace::INBOX;

/// Converts an IMAP mailbox name/identifier representation to the utf-8
/// string used internally (case-insensitive `INBOX` per RFC 3501 §5.1).
pub struct MailboxName<'a>(pub &'a MailboxCodec<'a>);

impl<'a> TryInto<&'a str> for MailboxName<'a> {
    type Error = std::str::Utf8Error;
    fn try_into(self) -> Result<&'a str, Self::Error> {
        match self.0 {
            MailboxCodec::Inbox => Ok(INBOX),
            MailboxCodec::Other(aname) => std::str::from_utf8(aname.as_ref()),
        }
    }
}
