//! Commands for the Authenticated state (RFC 3501 §6.3): mailbox
//! management, LIST/LSUB, STATUS, SELECT/EXAMINE, APPEND and ENABLE.

use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use anyhow::{anyhow, bail, Result};
use imap_codec::imap_types::command::{
    Command, CommandBody, ListReturnItem, SelectExamineModifier,
};
use imap_codec::imap_types::core::{Atom, Literal, QuotedChar, Vec1};
use imap_codec::imap_types::datetime::DateTime;
use imap_codec::imap_types::extensions::enable::CapabilityEnable;
use imap_codec::imap_types::flag::{Flag, FlagNameAttribute};
use imap_codec::imap_types::mailbox::{ListMailbox, Mailbox as MailboxCodec};
use imap_codec::imap_types::response::{Code, CodeOther, Data};
use imap_codec::imap_types::status::{StatusDataItem, StatusDataItemName};

use pv_collections::mail::namespace;
use pv_collections::mail::namespace::MAILBOX_HIERARCHY_DELIMITER as MBX_HIER_DELIM_RAW;
use pv_collections::mail::injector;
use pv_collections::mail::message::Message;
use pv_collections::mail::IMF;
use pv_collections::user::User;

use crate::imap::capability::{ClientCapability, ServerCapability};
use crate::imap::command::{anystate, MailboxName};
use crate::imap::flow;
use crate::imap::mailbox_view::MailboxView;
use crate::imap::response::Response;

pub struct AuthenticatedContext<'a> {
    pub req: &'a Command<'static>,
    pub server_capabilities: &'a ServerCapability,
    pub client_capabilities: &'a mut ClientCapability,
    pub user: &'a Arc<User>,
}

pub async fn dispatch<'a>(
    mut ctx: AuthenticatedContext<'a>,
) -> Result<(Response<'static>, flow::Transition)> {
    match &ctx.req.body {
        // Any state
        CommandBody::Noop => Ok((
            Response::build().to_req(ctx.req).message("Noop completed.").ok()?,
            flow::Transition::None,
        )),
        CommandBody::Capability => {
            anystate::capability(ctx.req.tag.clone(), ctx.server_capabilities)
        }
        CommandBody::Logout => anystate::logout(),

        // Specific to this state (11 commands)
        CommandBody::Create { mailbox } => ctx.create(mailbox).await,
        CommandBody::Delete { mailbox } => ctx.delete(mailbox).await,
        CommandBody::Rename { from, to } => ctx.rename(from, to).await,
        CommandBody::Lsub {
            reference,
            mailbox_wildcard,
        } => ctx.list(reference, mailbox_wildcard, &[], true).await,
        CommandBody::List {
            reference,
            mailbox_wildcard,
            r#return,
        } => ctx.list(reference, mailbox_wildcard, r#return, false).await,
        CommandBody::Status {
            mailbox,
            item_names,
        } => ctx.status(mailbox, item_names).await,
        CommandBody::Subscribe { mailbox } => ctx.subscribe(mailbox).await,
        CommandBody::Unsubscribe { mailbox } => ctx.unsubscribe(mailbox).await,
        CommandBody::Select { mailbox, modifiers } => ctx.select(mailbox, modifiers).await,
        CommandBody::Examine { mailbox, modifiers } => ctx.examine(mailbox, modifiers).await,
        CommandBody::Append {
            mailbox,
            flags,
            date,
            message,
        } => ctx.append(mailbox, flags, date, message).await,

        // rfc5161 ENABLE
        CommandBody::Enable { capabilities } => ctx.enable(capabilities),

        // Collect other commands
        _ => anystate::wrong_state(ctx.req.tag.clone()),
    }
}

// --- PRIVATE ---
impl<'a> AuthenticatedContext<'a> {
    async fn create(
        self,
        mailbox: &MailboxCodec<'a>,
    ) -> Result<(Response<'static>, flow::Transition)> {
        let name = match mailbox {
            MailboxCodec::Inbox => {
                return Ok((
                    Response::build()
                        .to_req(self.req)
                        .message("Cannot create INBOX")
                        .bad()?,
                    flow::Transition::None,
                ));
            }
            MailboxCodec::Other(aname) => std::str::from_utf8(aname.as_ref())?,
        };

        match self.user.create_mailbox(name).await {
            Ok(_) => Ok((
                Response::build()
                    .to_req(self.req)
                    .message("CREATE complete")
                    .ok()?,
                flow::Transition::None,
            )),
            Err(e) => Ok((
                Response::build()
                    .to_req(self.req)
                    .message(e.to_string())
                    .no()?,
                flow::Transition::None,
            )),
        }
    }

    async fn delete(
        self,
        mailbox: &MailboxCodec<'a>,
    ) -> Result<(Response<'static>, flow::Transition)> {
        let name: &str = MailboxName(mailbox).try_into()?;

        match self.user.delete_mailbox(name).await {
            Ok(()) => Ok((
                Response::build()
                    .to_req(self.req)
                    .message("DELETE complete")
                    .ok()?,
                flow::Transition::None,
            )),
            Err(e) => Ok((
                Response::build()
                    .to_req(self.req)
                    .message(e.to_string())
                    .no()?,
                flow::Transition::None,
            )),
        }
    }

    async fn rename(
        self,
        from: &MailboxCodec<'a>,
        to: &MailboxCodec<'a>,
    ) -> Result<(Response<'static>, flow::Transition)> {
        let name: &str = MailboxName(from).try_into()?;
        let new_name: &str = MailboxName(to).try_into()?;

        match self.user.rename_mailbox(name, new_name).await {
            Ok(()) => Ok((
                Response::build()
                    .to_req(self.req)
                    .message("RENAME complete")
                    .ok()?,
                flow::Transition::None,
            )),
            Err(e) => Ok((
                Response::build()
                    .to_req(self.req)
                    .message(e.to_string())
                    .no()?,
                flow::Transition::None,
            )),
        }
    }

    async fn list(
        &mut self,
        reference: &MailboxCodec<'a>,
        mailbox_wildcard: &ListMailbox<'a>,
        must_return: &[ListReturnItem],
        is_lsub: bool,
    ) -> Result<(Response<'static>, flow::Transition)> {
        let mbx_hier_delim: QuotedChar = QuotedChar::unvalidated(MBX_HIER_DELIM_RAW);

        let reference: &str = MailboxName(reference).try_into()?;
        if !reference.is_empty() {
            return Ok((
                Response::build()
                    .to_req(self.req)
                    .message("References not supported")
                    .bad()?,
                flow::Transition::None,
            ));
        }

        let status_item_names = must_return.iter().find_map(|m| match m {
            ListReturnItem::Status(v) => Some(v),
            _ => None,
        });

        let wildcard = match mailbox_wildcard {
            ListMailbox::Token(v) => std::str::from_utf8(v.as_ref())?,
            ListMailbox::String(v) => std::str::from_utf8(v.as_ref())?,
        };
        if wildcard.is_empty() {
            if is_lsub {
                return Ok((
                    Response::build()
                        .to_req(self.req)
                        .message("LSUB complete")
                        .data(Data::Lsub {
                            items: vec![],
                            delimiter: Some(mbx_hier_delim),
                            mailbox: "".try_into().unwrap(),
                        })
                        .ok()?,
                    flow::Transition::None,
                ));
            } else {
                return Ok((
                    Response::build()
                        .to_req(self.req)
                        .message("LIST complete")
                        .data(Data::List {
                            items: vec![],
                            delimiter: Some(mbx_hier_delim),
                            mailbox: "".try_into().unwrap(),
                        })
                        .ok()?,
                    flow::Transition::None,
                ));
            }
        }

        let mailboxes = self.user.list_mailboxes().await?;
        let mut vmailboxes = BTreeMap::new();
        for mb in mailboxes.iter() {
            for (i, _) in mb.match_indices(MBX_HIER_DELIM_RAW) {
                if i > 0 {
                    let smb = &mb[..i];
                    vmailboxes.entry(smb).or_insert(false);
                }
            }
            vmailboxes.insert(mb.as_str(), true);
        }

        let mut ret = vec![];
        for (mb, is_real) in vmailboxes.iter() {
            if matches_wildcard(wildcard, mb) {
                let mailbox: MailboxCodec = mb
                    .to_string()
                    .try_into()
                    .map_err(|_| anyhow!("invalid mailbox name"))?;
                let mut items = vec![FlagNameAttribute::from(Atom::unvalidated("Subscribed"))];

                if !*is_real {
                    items.push(FlagNameAttribute::Noselect);
                } else {
                    match *mb {
                        "Drafts" => items.push(Atom::unvalidated("Drafts").into()),
                        "Archive" => items.push(Atom::unvalidated("Archive").into()),
                        "Sent" => items.push(Atom::unvalidated("Sent").into()),
                        "Trash" => items.push(Atom::unvalidated("Trash").into()),
                        _ => (),
                    };
                }

                if is_lsub {
                    ret.push(Data::Lsub {
                        items,
                        delimiter: Some(mbx_hier_delim),
                        mailbox: mailbox.clone(),
                    });
                } else {
                    ret.push(Data::List {
                        items,
                        delimiter: Some(mbx_hier_delim),
                        mailbox: mailbox.clone(),
                    });
                }

                if let Some(sin) = status_item_names {
                    let ret_attrs = match self.status_items(mb, sin).await {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::error!(err=?e, mailbox=%mb, "Unable to fetch status for mailbox");
                            continue;
                        }
                    };

                    ret.push(Data::Status {
                        mailbox,
                        items: ret_attrs.into(),
                    });
                }
            }
        }

        let msg = if is_lsub {
            "LSUB completed"
        } else {
            "LIST completed"
        };
        Ok((
            Response::build()
                .to_req(self.req)
                .message(msg)
                .many_data(ret)
                .ok()?,
            flow::Transition::None,
        ))
    }

    async fn status(
        &mut self,
        mailbox: &MailboxCodec<'static>,
        attributes: &[StatusDataItemName],
    ) -> Result<(Response<'static>, flow::Transition)> {
        let name: &str = MailboxName(mailbox).try_into()?;

        let ret_attrs = match self.status_items(name, attributes).await {
            Ok(v) => v,
            Err(e) => match e.downcast_ref::<CommandError>() {
                Some(CommandError::MailboxNotFound) => {
                    return Ok((
                        Response::build()
                            .to_req(self.req)
                            .message("Mailbox does not exist")
                            .no()?,
                        flow::Transition::None,
                    ))
                }
                _ => return Err(e),
            },
        };

        let data = Data::Status {
            mailbox: mailbox.clone(),
            items: ret_attrs.into(),
        };

        Ok((
            Response::build()
                .to_req(self.req)
                .message("STATUS completed")
                .data(data)
                .ok()?,
            flow::Transition::None,
        ))
    }

    /// Opens a throwaway read-only session just long enough to answer
    /// STATUS/LIST-STATUS: these don't keep the mailbox selected, so there's
    /// no `MailboxView` to reuse across calls (§9 open question: X-GUID is
    /// simply never asked for here, STATUS has no such item).
    async fn status_items(
        &mut self,
        name: &str,
        attributes: &[StatusDataItemName],
    ) -> Result<Vec<StatusDataItem>> {
        let session = self
            .user
            .open_session(name, true)
            .await?
            .ok_or(CommandError::MailboxNotFound)?;

        let view = MailboxView::new(session, self.client_capabilities.condstore.is_enabled());

        let mut ret_attrs = vec![];
        for attr in attributes.iter() {
            ret_attrs.push(match attr {
                StatusDataItemName::Messages => StatusDataItem::Messages(view.exists()),
                StatusDataItemName::Unseen => StatusDataItem::Unseen(view.unseen_count()),
                StatusDataItemName::Recent => StatusDataItem::Recent(view.recent()),
                StatusDataItemName::UidNext => {
                    StatusDataItem::UidNext(view.uidnext().try_into().unwrap())
                }
                StatusDataItemName::UidValidity => {
                    StatusDataItem::UidValidity(view.uidvalidity().try_into().unwrap())
                }
                StatusDataItemName::Deleted => {
                    bail!("quota not implemented, can't return deleted elements waiting for EXPUNGE");
                }
                StatusDataItemName::DeletedStorage => {
                    bail!("quota not implemented, can't return freed storage after EXPUNGE will be run");
                }
                StatusDataItemName::HighestModSeq => {
                    self.client_capabilities.enable_condstore();
                    StatusDataItem::HighestModSeq(view.highestmodseq())
                }
            });
        }
        Ok(ret_attrs)
    }

    async fn subscribe(
        self,
        mailbox: &MailboxCodec<'a>,
    ) -> Result<(Response<'static>, flow::Transition)> {
        let name: &str = MailboxName(mailbox).try_into()?;

        if self.user.has_mailbox(name).await? {
            Ok((
                Response::build()
                    .to_req(self.req)
                    .message("SUBSCRIBE complete")
                    .ok()?,
                flow::Transition::None,
            ))
        } else {
            Ok((
                Response::build()
                    .to_req(self.req)
                    .message(format!("Mailbox {} does not exist", name))
                    .bad()?,
                flow::Transition::None,
            ))
        }
    }

    async fn unsubscribe(
        self,
        mailbox: &MailboxCodec<'a>,
    ) -> Result<(Response<'static>, flow::Transition)> {
        let name: &str = MailboxName(mailbox).try_into()?;

        if self.user.has_mailbox(name).await? {
            Ok((
                Response::build()
                    .to_req(self.req)
                    .message(format!(
                        "Cannot unsubscribe from mailbox {}: not supported",
                        name
                    ))
                    .bad()?,
                flow::Transition::None,
            ))
        } else {
            Ok((
                Response::build()
                    .to_req(self.req)
                    .message(format!("Mailbox {} does not exist", name))
                    .no()?,
                flow::Transition::None,
            ))
        }
    }

    async fn select(
        self,
        mailbox: &MailboxCodec<'a>,
        modifiers: &[SelectExamineModifier],
    ) -> Result<(Response<'static>, flow::Transition)> {
        self.client_capabilities.select_enable(modifiers);

        let name: &str = MailboxName(mailbox).try_into()?;

        let session_opt = match namespace::split_other_user(name) {
            Some((owner, rest)) => self.user.open_session_shared(owner, rest, false).await?,
            None => self.user.open_session(name, false).await?,
        };
        let session = match session_opt {
            Some(s) => s,
            None => {
                return Ok((
                    Response::build()
                        .to_req(self.req)
                        .message("Mailbox does not exist")
                        .no()?,
                    flow::Transition::None,
                ))
            }
        };
        tracing::info!(username=%self.user.username, mailbox=%name, "mailbox.selected");

        // A shared mailbox missing the KeepSeen right silently downgrades to
        // read-only (§4.I) regardless of the client having asked for SELECT.
        let (code, perm) = if session.readonly {
            (Code::ReadOnly, flow::MailboxPerm::ReadOnly)
        } else {
            (Code::ReadWrite, flow::MailboxPerm::ReadWrite)
        };

        let mb = MailboxView::new(session, self.client_capabilities.condstore.is_enabled());
        let data = mb.summary();
        let permanent = mb.permanent_flags();

        Ok((
            Response::build()
                .message("Select completed")
                .to_req(self.req)
                .code(code)
                .untagged_ok(Code::PermanentFlags(permanent), "Flags permitted")?
                .set_body(data)
                .ok()?,
            flow::Transition::Select(mb, perm),
        ))
    }

    async fn examine(
        self,
        mailbox: &MailboxCodec<'a>,
        modifiers: &[SelectExamineModifier],
    ) -> Result<(Response<'static>, flow::Transition)> {
        self.client_capabilities.select_enable(modifiers);

        let name: &str = MailboxName(mailbox).try_into()?;

        let session_opt = match namespace::split_other_user(name) {
            Some((owner, rest)) => self.user.open_session_shared(owner, rest, true).await?,
            None => self.user.open_session(name, true).await?,
        };
        let session = match session_opt {
            Some(s) => s,
            None => {
                return Ok((
                    Response::build()
                        .to_req(self.req)
                        .message("Mailbox does not exist")
                        .no()?,
                    flow::Transition::None,
                ))
            }
        };
        tracing::info!(username=%self.user.username, mailbox=%name, "mailbox.examined");

        let mb = MailboxView::new(session, self.client_capabilities.condstore.is_enabled());
        let data = mb.summary();
        let permanent = mb.permanent_flags();

        Ok((
            Response::build()
                .to_req(self.req)
                .message("Examine completed")
                .code(Code::ReadOnly)
                .untagged_ok(Code::PermanentFlags(permanent), "Flags permitted")?
                .set_body(data)
                .ok()?,
            flow::Transition::Select(mb, flow::MailboxPerm::ReadOnly),
        ))
    }

    async fn append(
        self,
        mailbox: &MailboxCodec<'a>,
        flags: &[Flag<'a>],
        date: &Option<DateTime>,
        message: &Literal<'a>,
    ) -> Result<(Response<'static>, flow::Transition)> {
        let append_tag = self.req.tag.clone();
        match self.append_internal(mailbox, flags, date, message).await {
            Ok((uidvalidity, uid)) => Ok((
                Response::build()
                    .tag(append_tag)
                    .message("APPEND completed")
                    .code(Code::Other(CodeOther::unvalidated(
                        format!("APPENDUID {} {}", uidvalidity, uid).into_bytes(),
                    )))
                    .ok()?,
                flow::Transition::None,
            )),
            Err(e) => Ok((
                Response::build()
                    .tag(append_tag)
                    .message(e.to_string())
                    .no()?,
                flow::Transition::None,
            )),
        }
    }

    fn enable(
        self,
        cap_enable: &Vec1<CapabilityEnable<'static>>,
    ) -> Result<(Response<'static>, flow::Transition)> {
        let mut response_builder = Response::build().to_req(self.req);
        let capabilities = self.client_capabilities.try_enable(cap_enable.as_ref());
        if !capabilities.is_empty() {
            response_builder = response_builder.data(Data::Enabled { capabilities });
        }
        Ok((
            response_builder.message("ENABLE completed").ok()?,
            flow::Transition::None,
        ))
    }

    /// APPEND (RFC 3501 §6.3.11): parses the literal as an RFC 822 message
    /// and runs it through the same injector pipeline LMTP delivery uses,
    /// targeting the one named mailbox with no `delivery` row. `date` (the
    /// client-requested INTERNALDATE override) isn't honored — the injector
    /// always stamps the server's receipt time, matching the teacher's own
    /// `@FIXME` on this path.
    async fn append_internal(
        &self,
        mailbox: &MailboxCodec<'a>,
        flags: &[Flag<'a>],
        date: &Option<DateTime>,
        message: &Literal<'a>,
    ) -> Result<(u32, u32)> {
        let name: &str = MailboxName(mailbox).try_into()?;

        let mailbox_handle = self
            .user
            .open_mailbox(name)
            .await?
            .ok_or_else(|| anyhow!("Mailbox does not exist"))?;

        if date.is_some() {
            tracing::warn!("Cannot set INTERNALDATE when appending message");
        }

        let imf =
            IMF::try_from(message.data()).map_err(|_| anyhow!("Could not parse e-mail message"))?;
        let msg = Message::from_imf(&imf, message.data().len() as i64);
        let flag_strings = flags.iter().map(|x| x.to_string()).collect::<Vec<_>>();

        let pool = self.user.pool();
        let registry = self.user.registry();
        let caches = injector::Caches {
            field_names: registry.field_names(),
            flags: registry.flags(),
            addresses: registry.addresses(),
        };
        let report = injector::inject(
            pool,
            caches,
            registry,
            &msg,
            &[mailbox_handle.id],
            &flag_strings,
            &[],
            None,
        )
        .await
        .map_err(|e| anyhow!("{e}"))?;

        let uid = report
            .uid(mailbox_handle.id)
            .ok_or_else(|| anyhow!("append did not land in the target mailbox"))?;

        Ok((mailbox_handle.uidvalidity(), uid.get()))
    }
}

fn matches_wildcard(wildcard: &str, name: &str) -> bool {
    let wildcard = wildcard.chars().collect::<Vec<char>>();
    let name = name.chars().collect::<Vec<char>>();

    let mut matches = vec![vec![false; wildcard.len() + 1]; name.len() + 1];

    for i in 0..=name.len() {
        for j in 0..=wildcard.len() {
            matches[i][j] = (i == 0 && j == 0)
                || (j > 0
                    && matches[i][j - 1]
                    && (wildcard[j - 1] == '%' || wildcard[j - 1] == '*'))
                || (i > 0
                    && j > 0
                    && matches[i - 1][j - 1]
                    && wildcard[j - 1] == name[i - 1]
                    && wildcard[j - 1] != '%'
                    && wildcard[j - 1] != '*')
                || (i > 0
                    && j > 0
                    && matches[i - 1][j]
                    && (wildcard[j - 1] == '*'
                        || (wildcard[j - 1] == '%' && name[i - 1] != MBX_HIER_DELIM_RAW)));
        }
    }

    matches[name.len()][wildcard.len()]
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Mailbox not found")]
    MailboxNotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_matches() {
        assert!(matches_wildcard("INBOX", "INBOX"));
        assert!(matches_wildcard("*", "INBOX"));
        assert!(matches_wildcard("%", "INBOX"));
        assert!(!matches_wildcard("%", "Test.Azerty"));
        assert!(!matches_wildcard("INBOX.*", "INBOX"));
        assert!(matches_wildcard("Sent.*", "Sent.A"));
        assert!(matches_wildcard("Sent.*", "Sent.A.B"));
        assert!(!matches_wildcard("Sent.%", "Sent.A.B"));
    }
}
