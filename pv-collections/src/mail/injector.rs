//! The Injector (SPEC §4.G) — the core of the repository: atomically
//! publishes one parsed [`Message`] into one or more target mailboxes,
//! deduplicating every referenced name and bodypart along the way.
//!
//! The spec's nine-state machine (`Inactive -> ... -> Done`) becomes a
//! straight-line sequence of `await`s inside one `sqlx::Transaction`, per
//! SPEC_FULL §4.G: there is no literal suspend/resume state machine (§9
//! design notes prefer an async runtime over call-stack-free machines).
//! `InjectStage` survives only as a tracing marker for error context.

use sqlx::PgPool;
use thiserror::Error;
use tracing::instrument;

use pv_db::{AddressId, FieldNameId, FlagId, ImapUid, MailboxId, MessageId, ModSeq};

use crate::mail::message::{AddressRole, Annotation, Bodypart, BodypartPayload, Message};
use crate::mail::names::{
    lookup_field_names, lookup_flags, resolve_addresses, AddressCache, AddressKey,
    FieldNameCache, FlagCache,
};
use crate::mail::registry::MailboxRegistry;

/// Mirrors spec §4.G's named states; used only for tracing spans and error
/// context, never for control flow (SPEC_FULL §4.G / §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectStage {
    Inactive,
    InsertingBodyparts,
    InsertingAddresses,
    SelectingUids,
    InsertingMessages,
    LinkingFields,
    LinkingFlags,
    LinkingAnnotations,
    LinkingAddresses,
    InsertingDeliveries,
    AwaitingCompletion,
    Done,
}

#[derive(Debug, Error)]
pub enum InjectError {
    #[error("target mailbox list must not be empty")]
    NoTargets,
    #[error("mailbox {0:?} is missing or deleted")]
    MissingMailbox(MailboxId),
    #[error("injection failed at stage {stage:?}: {source}")]
    Sql {
        stage: InjectStage,
        #[source]
        source: sqlx::Error,
    },
}

impl InjectError {
    fn at(stage: InjectStage) -> impl Fn(sqlx::Error) -> InjectError {
        move |source| InjectError::Sql { stage, source }
    }
}

/// One target mailbox plus the UID/modseq the Injector allocated for it.
#[derive(Debug, Clone, Copy)]
pub struct TargetResult {
    pub mailbox: MailboxId,
    pub uid: ImapUid,
    pub modseq: ModSeq,
}

/// Delivery envelope: `(sender, recipients)`, carried only when the
/// injection represents an SMTP/LMTP delivery rather than an IMAP APPEND.
pub struct Envelope {
    pub sender: String,
    pub recipients: Vec<AddressKey>,
}

pub struct InjectReport {
    pub message_id: MessageId,
    targets: Vec<TargetResult>,
}

impl InjectReport {
    /// The UID this injection reserved in mailbox `m`, per spec guarantee:
    /// "every target mailbox's UID returned by `uid(m)` is persisted and
    /// unique within the mailbox".
    pub fn uid(&self, mailbox: MailboxId) -> Option<ImapUid> {
        self.targets
            .iter()
            .find(|t| t.mailbox == mailbox)
            .map(|t| t.uid)
    }

    pub fn targets(&self) -> &[TargetResult] {
        &self.targets
    }
}

pub struct Caches<'a> {
    pub field_names: &'a FieldNameCache,
    pub flags: &'a FlagCache,
    pub addresses: &'a AddressCache,
}

/// Runs the full injection pipeline described by SPEC §4.G / SPEC_FULL
/// §4.G. On any failure the whole transaction is rolled back (by `Drop`,
/// since we never reach `commit`): per spec, "if `failed()`, no row
/// inserted by this Injector is visible in any mailbox".
#[instrument(skip_all, fields(targets = targets.len()))]
pub async fn inject(
    pool: &PgPool,
    caches: Caches<'_>,
    registry: &MailboxRegistry,
    message: &Message,
    targets: &[MailboxId],
    extra_flags: &[String],
    annotations: &[Annotation],
    delivery: Option<&Envelope>,
) -> Result<InjectReport, InjectError> {
    if targets.is_empty() {
        return Err(InjectError::NoTargets);
    }

    let mut txn = pool.begin().await.map_err(InjectError::at(InjectStage::Inactive))?;

    // --- 1. Bodyparts: insert-if-absent by content hash, recover ids ---
    let mut bodypart_ids = Vec::new();
    for leaf in message.body.leaves() {
        let (bytes, text) = match leaf {
            Bodypart::Leaf { payload, .. } => match payload {
                BodypartPayload::Text(s) => (s.len() as i64, Some(s.as_bytes().to_vec())),
                BodypartPayload::Binary(b) => (b.len() as i64, None),
            },
            Bodypart::Multipart { .. } => continue,
        };
        let hash = bodypart_hash(leaf);
        sqlx::query(
            "insert into bodyparts (hash, bytes, text) select $1, $2, $3 \
             where not exists (select 1 from bodyparts where hash = $1)",
        )
        .bind(&hash)
        .bind(bytes)
        .bind(&text)
        .execute(&mut *txn)
        .await
        .map_err(InjectError::at(InjectStage::InsertingBodyparts))?;
        let id: i64 = sqlx::query_scalar("select id from bodyparts where hash = $1")
            .bind(&hash)
            .fetch_one(&mut *txn)
            .await
            .map_err(InjectError::at(InjectStage::InsertingBodyparts))?;
        bodypart_ids.push((leaf.part_number().to_string(), id));
    }

    // --- 2. Addresses: resolve header + delivery-recipient addresses ---
    let mut address_keys: Vec<AddressKey> = message
        .addresses
        .iter()
        .map(|a| a.address.clone())
        .collect();
    if let Some(env) = delivery {
        address_keys.extend(env.recipients.iter().cloned());
    }
    let resolved_addresses = resolve_addresses(caches.addresses, &mut txn, &address_keys)
        .await
        .map_err(InjectError::at(InjectStage::InsertingAddresses))?;

    // field names referenced by the header list
    let names = message.header_names();
    lookup_field_names(caches.field_names, &mut txn, &names)
        .await
        .map_err(InjectError::at(InjectStage::InsertingAddresses))?;

    // flags: only those actually requested for this injection are resolved;
    // system flags are recognized (not force-created) via `is_system_flag`.
    let flag_names: Vec<String> = extra_flags.to_vec();
    lookup_flags(caches.flags, &mut txn, &flag_names)
        .await
        .map_err(InjectError::at(InjectStage::InsertingAddresses))?;

    // --- 3. Select UIDs: atomically read-and-increment per target mailbox ---
    let mut results = Vec::with_capacity(targets.len());
    for mailbox in targets {
        let row: Option<(i64, i64)> = sqlx::query_as(
            "update mailboxes set uidnext = uidnext + 1, nextmodseq = nextmodseq + 1 \
             where id = $1 and not deleted returning uidnext - 1, nextmodseq - 1",
        )
        .bind(mailbox.0)
        .fetch_optional(&mut *txn)
        .await
        .map_err(InjectError::at(InjectStage::SelectingUids))?;

        let (uid, modseq) = row.ok_or(InjectError::MissingMailbox(*mailbox))?;
        results.push(TargetResult {
            mailbox: *mailbox,
            uid: ImapUid::new(uid as u32).ok_or(InjectError::MissingMailbox(*mailbox))?,
            modseq: ModSeq::new(modseq as u64).ok_or(InjectError::MissingMailbox(*mailbox))?,
        });
    }

    // --- 4. Insert the message row ---
    let message_id = MessageId::generate();
    sqlx::query("insert into messages (id, internaldate, wrapped, rfc822size) values ($1, $2, $3, $4)")
        .bind(Into::<uuid::Uuid>::into(message_id))
        .bind(message.internal_date)
        .bind(message.wrapped)
        .bind(message.rfc822_size)
        .execute(&mut *txn)
        .await
        .map_err(InjectError::at(InjectStage::InsertingMessages))?;

    for (part_number, bodypart_id) in &bodypart_ids {
        sqlx::query("insert into part_numbers (message, part, bodypart) values ($1, $2, $3)")
            .bind(Into::<uuid::Uuid>::into(message_id))
            .bind(part_number)
            .bind(bodypart_id)
            .execute(&mut *txn)
            .await
            .map_err(InjectError::at(InjectStage::InsertingMessages))?;
    }

    // --- 5. Link fields / addresses ---
    // SPEC_FULL §4.A's `try_join!` applies to independent *statements*
    // against genuinely separate connections; a single `sqlx::Transaction`
    // holds one connection, so these junction-table inserts run
    // sequentially against `&mut txn` — still one atomic transaction.
    for (position, header) in message.headers.iter().enumerate() {
        let field_id = caches
            .field_names
            .translate(&header.name)
            .await
            .unwrap_or(FieldNameId(0));
        sqlx::query(
            "insert into header_fields (message, part, position, field, value) values ($1, '', $2, $3, $4)",
        )
        .bind(Into::<uuid::Uuid>::into(message_id))
        .bind(position as i32)
        .bind(field_id.0)
        .bind(&header.value)
        .execute(&mut *txn)
        .await
        .map_err(InjectError::at(InjectStage::LinkingFields))?;
    }

    for (position, addr_ref) in message.addresses.iter().enumerate() {
        let field_id = caches
            .field_names
            .translate(addr_ref.role.header_name())
            .await
            .unwrap_or(FieldNameId(0));
        let address_id = resolved_addresses
            .get(
                address_keys
                    .iter()
                    .position(|k| {
                        k.localpart.eq_ignore_ascii_case(&addr_ref.address.localpart)
                            && k.domain.eq_ignore_ascii_case(&addr_ref.address.domain)
                            && k.name == addr_ref.address.name
                    })
                    .unwrap_or(0),
            )
            .copied()
            .unwrap_or(AddressId(0));
        sqlx::query(
            "insert into address_fields (message, part, position, field, address, number) values ($1, '', $2, $3, $4, $5)",
        )
        .bind(Into::<uuid::Uuid>::into(message_id))
        .bind(0i32)
        .bind(field_id.0)
        .bind(address_id.0)
        .bind(position as i32)
        .execute(&mut *txn)
        .await
        .map_err(InjectError::at(InjectStage::LinkingAddresses))?;
    }

    // --- 6. Insert mailbox_messages rows + flag links, per target ---
    for target in &results {
        sqlx::query(
            "insert into mailbox_messages (mailbox, uid, message, modseq, seen, flags) \
             values ($1, $2, $3, $4, $5, $6)",
        )
        .bind(target.mailbox.0)
        .bind(target.uid.get() as i64)
        .bind(Into::<uuid::Uuid>::into(message_id))
        .bind(target.modseq.get() as i64)
        .bind(flag_names.iter().any(|f| f == "\\Seen"))
        .bind(&flag_names)
        .execute(&mut *txn)
        .await
        .map_err(InjectError::at(InjectStage::LinkingFlags))?;

        for flag in &flag_names {
            let flag_id = caches.flags.translate(flag).await.unwrap_or(FlagId(0));
            sqlx::query("insert into flag_links (mailbox, uid, flag) values ($1, $2, $3)")
                .bind(target.mailbox.0)
                .bind(target.uid.get() as i64)
                .bind(flag_id.0)
                .execute(&mut *txn)
                .await
                .map_err(InjectError::at(InjectStage::LinkingFlags))?;
        }
    }

    // --- 7. Annotations: one row per (mailbox, uid, owner, name), per target ---
    for target in &results {
        for annotation in annotations {
            // `owner` is part of the primary key, so it can't carry NULL for
            // shared entries (Postgres forces NOT NULL on PK columns); the
            // empty string is the "no specific owner" sentinel instead.
            let owner = annotation.owner.as_deref().unwrap_or("");
            sqlx::query(
                "insert into annotations (mailbox, uid, owner, name, value) values ($1, $2, $3, $4, $5) \
                 on conflict (mailbox, uid, owner, name) do update set value = excluded.value",
            )
            .bind(target.mailbox.0)
            .bind(target.uid.get() as i64)
            .bind(owner)
            .bind(format!("{}/{}", annotation.entry, annotation.attribute))
            .bind(&annotation.value)
            .execute(&mut *txn)
            .await
            .map_err(InjectError::at(InjectStage::LinkingAnnotations))?;
        }
    }

    // --- 8. Deliveries, if this injection represents inbound mail ---
    if let Some(env) = delivery {
        let delivery_id: (i64,) = sqlx::query_as(
            "insert into deliveries (sender, message, expires_at) values ($1, $2, now() + interval '5 days') returning id",
        )
        .bind(&env.sender)
        .bind(Into::<uuid::Uuid>::into(message_id))
        .fetch_one(&mut *txn)
        .await
        .map_err(InjectError::at(InjectStage::InsertingDeliveries))?;

        for recipient in resolved_addresses.iter().skip(message.addresses.len()) {
            sqlx::query(
                "insert into delivery_recipients (delivery, recipient, action, status) values ($1, $2, 'pending', null)",
            )
            .bind(delivery_id.0)
            .bind(recipient.0)
            .execute(&mut *txn)
            .await
            .map_err(InjectError::at(InjectStage::InsertingDeliveries))?;
        }
    }

    // --- 9. AwaitingCompletion: seal the transaction ---
    txn.commit().await.map_err(InjectError::at(InjectStage::AwaitingCompletion))?;

    // --- 10. announce(): advance each target's in-memory counters, wake sessions ---
    for target in &results {
        if let Some(handle) = registry.find_by_id(target.mailbox).await {
            let new_uidnext = ImapUid::new(target.uid.get() + 1).unwrap_or(target.uid);
            let new_modseq = ModSeq::new(target.modseq.get() + 1).unwrap_or(target.modseq);
            handle.advance(new_uidnext, new_modseq);
            handle.announce().await;
        }
    }

    Ok(InjectReport {
        message_id,
        targets: results,
    })
}

/// Computes a stable content hash for a leaf bodypart, used as the
/// dedup key for `bodyparts.hash`.
fn bodypart_hash(leaf: &Bodypart) -> Vec<u8> {
    use sha2::{Digest, Sha256};
    match leaf {
        Bodypart::Leaf { payload, .. } => match payload {
            BodypartPayload::Text(s) => Sha256::digest(s.as_bytes()).to_vec(),
            BodypartPayload::Binary(b) => Sha256::digest(b).to_vec(),
        },
        Bodypart::Multipart { .. } => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_leaf(body: &str) -> Bodypart {
        Bodypart::Leaf {
            part_number: "1".into(),
            content_type: "text/plain".into(),
            payload: BodypartPayload::Text(body.to_string()),
        }
    }

    fn binary_leaf(body: &[u8]) -> Bodypart {
        Bodypart::Leaf {
            part_number: "1".into(),
            content_type: "application/octet-stream".into(),
            payload: BodypartPayload::Binary(body.to_vec()),
        }
    }

    /// Invariant: two leaves with identical content hash the same way, so
    /// the `bodyparts` insert-if-absent in step 1 actually deduplicates
    /// (spec §4.G step 1).
    #[test]
    fn bodypart_hash_is_stable_for_identical_content() {
        assert_eq!(bodypart_hash(&text_leaf("hi")), bodypart_hash(&text_leaf("hi")));
        assert_eq!(
            bodypart_hash(&binary_leaf(b"\x00\x01")),
            bodypart_hash(&binary_leaf(b"\x00\x01"))
        );
    }

    #[test]
    fn bodypart_hash_differs_for_different_content() {
        assert_ne!(bodypart_hash(&text_leaf("hi")), bodypart_hash(&text_leaf("bye")));
        assert_ne!(bodypart_hash(&text_leaf("hi")), bodypart_hash(&binary_leaf(b"hi")));
    }

    #[test]
    fn multipart_nodes_hash_to_an_empty_key() {
        let mp = Bodypart::Multipart {
            part_number: String::new(),
            children: vec![text_leaf("hi")],
        };
        assert!(bodypart_hash(&mp).is_empty());
    }

    /// Invariant 4 (spec §8): `InjectReport::uid(m)` returns exactly the UID
    /// allocated for that target, and `None` for any mailbox not targeted.
    #[test]
    fn report_uid_looks_up_by_target_mailbox() {
        let report = InjectReport {
            message_id: MessageId::generate(),
            targets: vec![
                TargetResult {
                    mailbox: MailboxId::from(1),
                    uid: ImapUid::new(5).unwrap(),
                    modseq: ModSeq::new(10).unwrap(),
                },
                TargetResult {
                    mailbox: MailboxId::from(2),
                    uid: ImapUid::new(1).unwrap(),
                    modseq: ModSeq::new(1).unwrap(),
                },
            ],
        };
        assert_eq!(report.uid(MailboxId::from(1)), ImapUid::new(5));
        assert_eq!(report.uid(MailboxId::from(2)), ImapUid::new(1));
        assert_eq!(report.uid(MailboxId::from(3)), None);
    }
}
