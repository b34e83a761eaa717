//! Commands legal in the Selected state (RFC 3501 §6.4): FETCH, SEARCH,
//! STORE, COPY, MOVE (RFC 6851), EXPUNGE/CLOSE, UNSELECT (RFC 3691).

use std::sync::Arc;

use anyhow::Result;
use imap_codec::imap_types::command::{Command, CommandBody};
use imap_codec::imap_types::fetch::MacroOrMessageDataItemNames;
use imap_codec::imap_types::flag::{Flag, StoreResponse, StoreType};
use imap_codec::imap_types::mailbox::Mailbox as MailboxCodec;
use imap_codec::imap_types::response::{Code, CodeOther};
use imap_codec::imap_types::search::SearchKey;
use imap_codec::imap_types::sequence::SequenceSet;

use pv_collections::user::User;

use crate::imap::capability::{ClientCapability, ServerCapability};
use crate::imap::command::{anystate, authenticated, MailboxName};
use crate::imap::flow;
use crate::imap::mailbox_view::MailboxView;
use crate::imap::response::Response;

pub struct SelectedContext<'a> {
    pub req: &'a Command<'static>,
    pub user: &'a Arc<User>,
    pub mailbox: &'a mut MailboxView,
    pub server_capabilities: &'a ServerCapability,
    pub client_capabilities: &'a mut ClientCapability,
    pub perm: &'a flow::MailboxPerm,
}

pub async fn dispatch<'a>(
    ctx: SelectedContext<'a>,
) -> Result<(Response<'static>, flow::Transition)> {
    match &ctx.req.body {
        // Any state
        CommandBody::Capability => {
            anystate::capability(ctx.req.tag.clone(), ctx.server_capabilities)
        }
        CommandBody::Logout => anystate::logout(),

        // Specific to this state
        CommandBody::Close => match ctx.perm {
            flow::MailboxPerm::ReadWrite => ctx.close().await,
            flow::MailboxPerm::ReadOnly => ctx.examine_close().await,
        },
        CommandBody::Noop | CommandBody::Check => ctx.noop().await,
        CommandBody::Fetch {
            sequence_set,
            macro_or_item_names,
            uid,
            ..
        } => ctx.fetch(sequence_set, macro_or_item_names, *uid).await,
        CommandBody::Search { criteria, uid, .. } => ctx.search(criteria, *uid).await,
        CommandBody::Expunge { .. } => ctx.expunge().await,
        CommandBody::Store {
            sequence_set,
            kind,
            response,
            flags,
            uid,
            ..
        } => ctx.store(sequence_set, kind, response, flags, *uid).await,
        CommandBody::Copy {
            sequence_set,
            mailbox,
            uid,
        } => ctx.copy(sequence_set, mailbox, *uid).await,
        CommandBody::Move {
            sequence_set,
            mailbox,
            uid,
        } => ctx.r#move(sequence_set, mailbox, *uid).await,

        // UNSELECT extension (rfc3691)
        CommandBody::Unselect => ctx.unselect().await,

        // Mailbox management (CREATE/DELETE/LIST/STATUS/APPEND/...) is legal
        // in this state too (RFC 3501 §6.3); delegate to the same handlers
        // used from Authenticated.
        _ => {
            authenticated::dispatch(authenticated::AuthenticatedContext {
                req: ctx.req,
                server_capabilities: ctx.server_capabilities,
                client_capabilities: ctx.client_capabilities,
                user: ctx.user,
            })
            .await
        }
    }
}

// --- PRIVATE ---

impl<'a> SelectedContext<'a> {
    async fn close(self) -> Result<(Response<'static>, flow::Transition)> {
        // CLOSE expunges silently: no untagged EXPUNGE is sent to the client.
        self.mailbox.expunge().await?;
        Ok((
            Response::build()
                .to_req(self.req)
                .message("CLOSE completed")
                .ok()?,
            flow::Transition::Unselect,
        ))
    }

    /// CLOSE on an EXAMINEd mailbox doesn't expunge.
    async fn examine_close(self) -> Result<(Response<'static>, flow::Transition)> {
        Ok((
            Response::build()
                .to_req(self.req)
                .message("CLOSE completed")
                .ok()?,
            flow::Transition::Unselect,
        ))
    }

    async fn unselect(self) -> Result<(Response<'static>, flow::Transition)> {
        Ok((
            Response::build()
                .to_req(self.req)
                .message("UNSELECT completed")
                .ok()?,
            flow::Transition::Unselect,
        ))
    }

    async fn noop(self) -> Result<(Response<'static>, flow::Transition)> {
        let updates = self.mailbox.update().await?;
        Ok((
            Response::build()
                .to_req(self.req)
                .message("NOOP completed.")
                .set_body(updates)
                .ok()?,
            flow::Transition::None,
        ))
    }

    async fn fetch(
        self,
        sequence_set: &SequenceSet,
        attributes: &MacroOrMessageDataItemNames<'static>,
        uid: bool,
    ) -> Result<(Response<'static>, flow::Transition)> {
        let items = match attributes {
            MacroOrMessageDataItemNames::Macro(m) => m.expand(),
            MacroOrMessageDataItemNames::MessageDataItemNames(v) => v.clone(),
        };

        match self.mailbox.fetch(sequence_set, &items, uid).await {
            Ok(resp) => Ok((
                Response::build()
                    .to_req(self.req)
                    .message("FETCH completed")
                    .set_body(resp)
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

    async fn search(
        self,
        criteria: &SearchKey<'static>,
        uid: bool,
    ) -> Result<(Response<'static>, flow::Transition)> {
        let found = self.mailbox.search(criteria, uid).await?;
        Ok((
            Response::build()
                .to_req(self.req)
                .data(imap_codec::imap_types::response::Data::Search(found))
                .message("SEARCH completed")
                .ok()?,
            flow::Transition::None,
        ))
    }

    async fn expunge(self) -> Result<(Response<'static>, flow::Transition)> {
        if let Some(failed) = self.fail_read_only() {
            return Ok((failed, flow::Transition::None));
        }

        let data = self.mailbox.expunge().await?;
        Ok((
            Response::build()
                .to_req(self.req)
                .message("EXPUNGE completed")
                .set_body(data)
                .ok()?,
            flow::Transition::None,
        ))
    }

    async fn store(
        self,
        sequence_set: &SequenceSet,
        kind: &StoreType,
        response: &StoreResponse,
        flags: &[Flag<'static>],
        uid: bool,
    ) -> Result<(Response<'static>, flow::Transition)> {
        if let Some(failed) = self.fail_read_only() {
            return Ok((failed, flow::Transition::None));
        }

        let data = self
            .mailbox
            .store(sequence_set, kind, response, flags, uid)
            .await?;

        Ok((
            Response::build()
                .to_req(self.req)
                .message("STORE completed")
                .set_body(data)
                .ok()?,
            flow::Transition::None,
        ))
    }

    async fn copy(
        self,
        sequence_set: &SequenceSet,
        mailbox: &MailboxCodec<'static>,
        uid: bool,
    ) -> Result<(Response<'static>, flow::Transition)> {
        if let Some(failed) = self.fail_read_only() {
            return Ok((failed, flow::Transition::None));
        }

        let name: &str = MailboxName(mailbox).try_into()?;

        let mb = match self.user.open_mailbox(name).await? {
            Some(mb) => mb,
            None => {
                return Ok((
                    Response::build()
                        .to_req(self.req)
                        .message("Destination mailbox does not exist")
                        .code(Code::TryCreate)
                        .no()?,
                    flow::Transition::None,
                ))
            }
        };

        let (uidval, uid_map) = self.mailbox.copy(sequence_set, mb.id.0, uid).await?;

        Ok((
            Response::build()
                .to_req(self.req)
                .message("COPY completed")
                .code(Code::Other(CodeOther::unvalidated(
                    copyuid_code(uidval, &uid_map).into_bytes(),
                )))
                .ok()?,
            flow::Transition::None,
        ))
    }

    async fn r#move(
        self,
        sequence_set: &SequenceSet,
        mailbox: &MailboxCodec<'static>,
        uid: bool,
    ) -> Result<(Response<'static>, flow::Transition)> {
        if let Some(failed) = self.fail_read_only() {
            return Ok((failed, flow::Transition::None));
        }

        let name: &str = MailboxName(mailbox).try_into()?;

        let mb = match self.user.open_mailbox(name).await? {
            Some(mb) => mb,
            None => {
                return Ok((
                    Response::build()
                        .to_req(self.req)
                        .message("Destination mailbox does not exist")
                        .code(Code::TryCreate)
                        .no()?,
                    flow::Transition::None,
                ))
            }
        };

        let (uidval, uid_map, data) = self.mailbox.r#move(sequence_set, mb.id.0, uid).await?;

        Ok((
            Response::build()
                .to_req(self.req)
                .message("MOVE completed")
                .code(Code::Other(CodeOther::unvalidated(
                    copyuid_code(uidval, &uid_map).into_bytes(),
                )))
                .set_body(data)
                .ok()?,
            flow::Transition::None,
        ))
    }

    fn fail_read_only(&self) -> Option<Response<'static>> {
        match self.perm {
            flow::MailboxPerm::ReadWrite => None,
            flow::MailboxPerm::ReadOnly => Some(
                Response::build()
                    .to_req(self.req)
                    .message("Write commands are forbidden while examining a mailbox")
                    .no()
                    .unwrap(),
            ),
        }
    }
}

/// Builds the `COPYUID uidvalidity source-uids dest-uids` response code
/// text (RFC 4315 §4).
fn copyuid_code(uidvalidity: u32, pairs: &[(pv_db::ImapUid, pv_db::ImapUid)]) -> String {
    format!(
        "COPYUID {} {} {}",
        uidvalidity,
        pairs
            .iter()
            .map(|(src, _)| src.get().to_string())
            .collect::<Vec<_>>()
            .join(","),
        pairs
            .iter()
            .map(|(_, dst)| dst.get().to_string())
            .collect::<Vec<_>>()
            .join(",")
    )
}
