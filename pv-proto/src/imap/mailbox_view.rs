//! The IMAP-facing wrapper around `pv_collections::mail::session::Session`:
//! turns its `SessionEvent` queue and counters into `imap_codec` `Data`
//! lines for SELECT/EXAMINE/STATUS/NOOP/FETCH/STORE/EXPUNGE.
//!
//! Grounded on the teacher's `aero-proto/src/imap/mailbox_view.rs`
//! EXPUNGE-then-EXISTS-then-FETCH diffing discipline, now driven by
//! `Session::refresh()` instead of a Bayou snapshot diff.

use std::num::NonZeroU32;

use anyhow::Result;
use imap_codec::imap_types::core::NonEmptyVec;
use imap_codec::imap_types::fetch::{MessageDataItem, MessageDataItemName, Section};
use imap_codec::imap_types::flag::{Flag, FlagFetch, FlagPerm, StoreResponse, StoreType};
use imap_codec::imap_types::response::Data;
use imap_codec::imap_types::search::SearchKey;
use imap_codec::imap_types::sequence::SequenceSet;

use pv_collections::mail::session::Session;
use pv_db::ImapUid;

use crate::imap::flags;
use crate::imap::response::Body;

const DEFAULT_FLAGS: [Flag<'static>; 5] = [
    Flag::Seen,
    Flag::Answered,
    Flag::Flagged,
    Flag::Deleted,
    Flag::Draft,
];

pub struct MailboxView {
    pub session: Session,
    pub is_condstore: bool,
}

impl MailboxView {
    pub fn new(session: Session, is_condstore: bool) -> Self {
        Self {
            session,
            is_condstore,
        }
    }

    /// Drains whatever the last `refresh()` queued into IMAP untagged data,
    /// in the EXPUNGE-then-EXISTS-then-FETCH order the session already
    /// maintains (§5 invariant).
    pub async fn update(&mut self) -> Result<Vec<Body<'static>>> {
        self.session.refresh().await?;
        let mut data = Vec::new();
        for ev in self.session.emit_responses(pv_collections::mail::session::Scope::All) {
            match ev {
                pv_collections::mail::session::SessionEvent::Expunge(msn) => {
                    let Some(msn) = NonZeroU32::new(msn as u32) else { continue };
                    data.push(Body::Data(Data::Expunge(msn)));
                }
                pv_collections::mail::session::SessionEvent::Exists(count) => {
                    data.push(Body::Data(Data::Exists(count as u32)));
                }
                pv_collections::mail::session::SessionEvent::Fetch { uid, flags: f, modseq } => {
                    let Some(msn) = self.session.msn(uid).and_then(|m| NonZeroU32::new(m as u32)) else {
                        continue;
                    };
                    let mut items = vec![MessageDataItem::Flags(
                        f.iter().filter_map(|x| flags::from_str(x)).collect(),
                    )];
                    if self.is_condstore {
                        items.push(MessageDataItem::ModSeq(modseq.get().try_into().unwrap()));
                    }
                    if let Ok(items) = NonEmptyVec::try_from(items) {
                        data.push(Body::Data(Data::Fetch { seq: msn, items }));
                    }
                }
                pv_collections::mail::session::SessionEvent::Vanished(_) => {}
            }
        }
        Ok(data)
    }

    /// The SELECT/EXAMINE greeting block (RFC 3501 §6.3.1/6.3.2): EXISTS,
    /// RECENT, FLAGS and PERMANENTFLAGS. The caller is responsible for
    /// wrapping PERMANENTFLAGS in the untagged OK/code the RFC expects;
    /// `permanent_flags()` hands back the list for that.
    pub fn summary(&self) -> Vec<Data<'static>> {
        vec![
            Data::Exists(self.session.exists() as u32),
            Data::Recent(self.session.recent_count() as u32),
            Data::Flags(DEFAULT_FLAGS.to_vec()),
        ]
    }

    pub fn permanent_flags(&self) -> Vec<FlagPerm<'static>> {
        DEFAULT_FLAGS
            .iter()
            .map(|f| FlagPerm::Flag(FlagFetch::Flag(f.clone())))
            .chain(std::iter::once(FlagPerm::Asterisk))
            .collect()
    }

    pub fn uidvalidity(&self) -> u32 {
        self.session.uidvalidity.get()
    }

    pub fn uidnext(&self) -> u32 {
        self.session.uidnext.get()
    }

    pub fn exists(&self) -> u32 {
        self.session.exists() as u32
    }

    pub fn recent(&self) -> u32 {
        self.session.recent_count() as u32
    }

    pub fn unseen_count(&self) -> u32 {
        self.session.unseen_count() as u32
    }

    pub fn highestmodseq(&self) -> u64 {
        self.session.highest_modseq().get()
    }

    /// STORE (RFC 3501 §6.4.6): applies Add/Remove/Replace against every
    /// uid named in `sequence_set`, then folds the result through `update`
    /// unless the client asked for `.SILENT`.
    pub async fn store<'a>(
        &mut self,
        sequence_set: &SequenceSet,
        kind: &StoreType,
        response: &StoreResponse,
        requested_flags: &[Flag<'a>],
        is_uid_store: bool,
    ) -> Result<Vec<Body<'static>>> {
        let wanted = requested_flags
            .iter()
            .map(|x| x.to_string())
            .collect::<Vec<_>>();

        let uids = self.resolve_sequence_set(sequence_set, is_uid_store);
        for uid in uids {
            let mut current = self.session.flags(uid);
            match kind {
                StoreType::Add => {
                    for f in &wanted {
                        if !current.contains(f) {
                            current.push(f.clone());
                        }
                    }
                }
                StoreType::Remove => current.retain(|f| !wanted.contains(f)),
                StoreType::Replace => current = wanted.clone(),
            }
            self.session.set_flags(uid, current).await?;
        }

        let summary = self.update().await?;
        Ok(match response {
            StoreResponse::Answer => summary,
            StoreResponse::Silent => vec![],
        })
    }

    pub async fn expunge(&mut self) -> Result<Vec<Body<'static>>> {
        self.session.expunge().await?;
        self.update().await
    }

    pub async fn idle_sync(&mut self) -> Result<Vec<Body<'static>>> {
        self.session.refresh().await?;
        self.update().await
    }

    /// A deliberately small FETCH: UID, FLAGS, INTERNALDATE, RFC822.SIZE and
    /// a best-effort `BODY[]` reconstructed by concatenating the message's
    /// stored bodyparts in part order. Full BODYSTRUCTURE/ENVELOPE
    /// rendering is out of scope (see DESIGN.md).
    pub async fn fetch(
        &mut self,
        sequence_set: &SequenceSet,
        items: &[MessageDataItemName<'static>],
        is_uid_fetch: bool,
    ) -> Result<Vec<Body<'static>>> {
        let mut out = Vec::new();
        for uid in self.resolve_sequence_set(sequence_set, is_uid_fetch) {
            let Some(msn) = self.session.msn(uid).and_then(|m| NonZeroU32::new(m as u32)) else {
                continue;
            };
            let mut data_items = Vec::new();
            let mut touched_seen = false;
            for item in items {
                match item {
                    MessageDataItemName::Uid => {
                        data_items.push(MessageDataItem::Uid(uid.get().try_into().unwrap()));
                    }
                    MessageDataItemName::Flags => {
                        data_items.push(MessageDataItem::Flags(
                            self.session
                                .flags(uid)
                                .iter()
                                .filter_map(|x| flags::from_str(x))
                                .collect(),
                        ));
                    }
                    MessageDataItemName::Rfc822Size => {
                        let size = self.message_size(uid).await.unwrap_or(0);
                        data_items.push(MessageDataItem::Rfc822Size(size as u32));
                    }
                    MessageDataItemName::BodyExt { peek, section, .. } => {
                        if matches!(section, None | Some(Section::Text(None))) && !*peek {
                            touched_seen = true;
                        }
                        let body = self.message_body(uid).await.unwrap_or_default();
                        data_items.push(MessageDataItem::BodyExt {
                            section: section.clone(),
                            origin: None,
                            data: imap_codec::imap_types::core::NString(
                                imap_codec::imap_types::core::IString::try_from(body).ok(),
                            ),
                        });
                    }
                    _ => {}
                }
            }
            if touched_seen {
                let mut f = self.session.flags(uid);
                let seen = Flag::Seen.to_string();
                if !f.contains(&seen) {
                    f.push(seen);
                    self.session.set_flags(uid, f).await?;
                }
            }
            if let Ok(items) = NonEmptyVec::try_from(data_items) {
                out.push(Body::Data(Data::Fetch { seq: msn, items }));
            }
        }
        Ok(out)
    }

    /// SEARCH (RFC 3501 §6.4.4): evaluates flag- and set-based keys against
    /// the session's in-memory view. String/header/date keys (BODY, TEXT,
    /// SUBJECT, SENTON, ...) would need a text index this mailbox doesn't
    /// maintain, so they match nothing rather than scanning every body —
    /// see DESIGN.md.
    pub async fn search(&mut self, criteria: &SearchKey<'_>, is_uid: bool) -> Result<Vec<u32>> {
        let mut uids = self.eval_search(criteria).await;
        uids.sort_unstable();
        uids.dedup();
        Ok(uids
            .into_iter()
            .filter_map(|u| {
                if is_uid {
                    Some(u.get())
                } else {
                    self.session.msn(u).map(|m| m as u32)
                }
            })
            .collect())
    }

    fn eval_search<'b>(
        &'b self,
        criteria: &'b SearchKey<'_>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Vec<ImapUid>> + Send + 'b>> {
        Box::pin(async move {
            match criteria {
                SearchKey::All => self.all_uids(),
                SearchKey::SequenceSet(set) => self.resolve_sequence_set(set, false),
                SearchKey::Uid(set) => self.resolve_sequence_set(set, true),
                SearchKey::Seen => self.by_flag("\\Seen", true),
                SearchKey::Unseen => self.by_flag("\\Seen", false),
                SearchKey::Answered => self.by_flag("\\Answered", true),
                SearchKey::Unanswered => self.by_flag("\\Answered", false),
                SearchKey::Deleted => self.by_flag("\\Deleted", true),
                SearchKey::Undeleted => self.by_flag("\\Deleted", false),
                SearchKey::Draft => self.by_flag("\\Draft", true),
                SearchKey::Undraft => self.by_flag("\\Draft", false),
                SearchKey::Flagged => self.by_flag("\\Flagged", true),
                SearchKey::Unflagged => self.by_flag("\\Flagged", false),
                SearchKey::Recent => self
                    .all_uids()
                    .into_iter()
                    .filter(|u| self.session.is_recent(*u))
                    .collect(),
                SearchKey::Old => self
                    .all_uids()
                    .into_iter()
                    .filter(|u| !self.session.is_recent(*u))
                    .collect(),
                SearchKey::New => self
                    .all_uids()
                    .into_iter()
                    .filter(|u| {
                        self.session.is_recent(*u) && !self.session.flags(*u).contains(&"\\Seen".to_string())
                    })
                    .collect(),
                SearchKey::Larger(n) => {
                    let mut out = Vec::new();
                    for u in self.all_uids() {
                        if self.message_size(u).await.unwrap_or(0) as u32 > *n {
                            out.push(u);
                        }
                    }
                    out
                }
                SearchKey::Smaller(n) => {
                    let mut out = Vec::new();
                    for u in self.all_uids() {
                        if (self.message_size(u).await.unwrap_or(0) as u32) < *n {
                            out.push(u);
                        }
                    }
                    out
                }
                SearchKey::And(keys) => {
                    let mut iter = keys.as_ref().iter();
                    let Some(first) = iter.next() else { return Vec::new() };
                    let mut acc: std::collections::HashSet<ImapUid> =
                        self.eval_search(first).await.into_iter().collect();
                    for k in iter {
                        let next: std::collections::HashSet<ImapUid> =
                            self.eval_search(k).await.into_iter().collect();
                        acc = acc.intersection(&next).copied().collect();
                    }
                    acc.into_iter().collect()
                }
                SearchKey::Or(a, b) => {
                    let mut out = self.eval_search(a).await;
                    out.extend(self.eval_search(b).await);
                    out
                }
                SearchKey::Not(inner) => {
                    let excluded: std::collections::HashSet<ImapUid> =
                        self.eval_search(inner).await.into_iter().collect();
                    self.all_uids()
                        .into_iter()
                        .filter(|u| !excluded.contains(u))
                        .collect()
                }
                // Text/header/date-based keys need an index this mailbox
                // doesn't maintain; they match nothing.
                _ => Vec::new(),
            }
        })
    }

    fn all_uids(&self) -> Vec<ImapUid> {
        (1..=self.session.exists() as u32)
            .filter_map(|msn| self.session.uid(msn as usize))
            .collect()
    }

    fn by_flag(&self, flag: &str, present: bool) -> Vec<ImapUid> {
        self.all_uids()
            .into_iter()
            .filter(|u| self.session.flags(*u).iter().any(|f| f == flag) == present)
            .collect()
    }

    /// COPY (RFC 3501 §6.4.7 / RFC 4315 COPYUID): returns the destination's
    /// uidvalidity and the list of (source_uid, dest_uid) pairs in the order
    /// the sequence set resolved to.
    pub async fn copy(
        &mut self,
        sequence_set: &SequenceSet,
        dest_mailbox_id: i64,
        is_uid: bool,
    ) -> Result<(u32, Vec<(ImapUid, ImapUid)>)> {
        let uids = self.resolve_sequence_set(sequence_set, is_uid);
        let (uidvalidity, pairs) = self.session.copy_to(&uids, dest_mailbox_id).await?;
        Ok((uidvalidity.get(), pairs))
    }

    /// MOVE (RFC 6851): copies the named messages then removes exactly
    /// those uids from this mailbox, returning EXPUNGE responses for them
    /// via the usual `update()` diff.
    pub async fn r#move(
        &mut self,
        sequence_set: &SequenceSet,
        dest_mailbox_id: i64,
        is_uid: bool,
    ) -> Result<(u32, Vec<(ImapUid, ImapUid)>, Vec<Body<'static>>)> {
        let uids = self.resolve_sequence_set(sequence_set, is_uid);
        let (uidvalidity, pairs) = self.session.copy_to(&uids, dest_mailbox_id).await?;
        self.session.remove_uids(&uids).await?;
        let data = self.update().await?;
        Ok((uidvalidity.get(), pairs, data))
    }

    async fn message_size(&self, uid: ImapUid) -> Option<i64> {
        let id = self.session.message_id(uid)?;
        let row: Option<(i64,)> = sqlx::query_as("select rfc822size from messages where id = $1")
            .bind(id.0)
            .fetch_optional(self.session.pool())
            .await
            .ok()?;
        row.map(|(s,)| s)
    }

    async fn message_body(&self, uid: ImapUid) -> Option<Vec<u8>> {
        let id = self.session.message_id(uid)?;
        let rows: Vec<(Vec<u8>,)> = sqlx::query_as(
            "select b.text from part_numbers p join bodyparts b on b.id = p.bodypart \
             where p.message = $1 and b.text is not null order by p.part",
        )
        .bind(id.0)
        .fetch_all(self.session.pool())
        .await
        .ok()?;
        Some(rows.into_iter().flat_map(|(t,)| t).collect())
    }

    /// Expands a sequence set (MSN- or UID-addressed) to the uids currently
    /// known to this session, in ascending order, skipping any position that
    /// doesn't resolve to a live message (RFC 3501 §7 "non-existent
    /// messages... are ignored").
    fn resolve_sequence_set(&self, sequence_set: &SequenceSet, is_uid: bool) -> Vec<ImapUid> {
        let largest = if is_uid {
            NonZeroU32::new(self.session.uidnext.get().saturating_sub(1)).unwrap_or(NonZeroU32::MIN)
        } else {
            match NonZeroU32::new(self.session.exists() as u32) {
                Some(n) => n,
                None => return Vec::new(),
            }
        };

        sequence_set
            .0
            .as_ref()
            .iter()
            .flat_map(|seq| seq.iter(largest))
            .filter_map(|v| {
                if is_uid {
                    ImapUid::new(v.get()).filter(|u| self.session.message_id(*u).is_some())
                } else {
                    self.session.uid(v.get() as usize)
                }
            })
            .collect()
    }
}
