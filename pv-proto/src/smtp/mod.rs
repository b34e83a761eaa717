//! SMTP submission and LMTP delivery front-ends (SPEC §6), both built on
//! the `smtp-server`/`smtp-message` crates the teacher's old root
//! `src/lmtp.rs` used. That file predates the crate split and wrote
//! straight into an encrypted K2V object store; the `Config` impls here
//! keep its `tls_accept`/`filter_from`/`filter_to`/`handle_mail` shape but
//! persist through the same `injector::inject` pipeline IMAP APPEND uses.

pub mod lmtp;
pub mod submission;

pub use lmtp::LmtpServer;
pub use submission::SmtpServer;

use pv_collections::mail::namespace::INBOX;
use pv_collections::mail::registry::MailboxRegistry;
use pv_collections::user::User;

/// Resolves a recipient address to `(owner, mailbox_path)`, preferring an
/// explicit `aliases` row and falling back to "account named after the
/// localpart, delivered to INBOX" when no alias exists. Shared by LMTP
/// delivery and authenticated SMTP submission, since both ultimately land
/// mail through the same injection path (SPEC §1's "no mail transport
/// routing decisions beyond submission/redirect" non-goal: redirect IS the
/// alias table).
pub(crate) async fn resolve_recipient(
    pool: &sqlx::PgPool,
    registry: &MailboxRegistry,
    address: &str,
) -> sqlx::Result<Option<(String, String)>> {
    let row: Option<(String, String)> =
        sqlx::query_as("select owner, mailbox from aliases where address = $1")
            .bind(address)
            .fetch_optional(pool)
            .await?;
    if row.is_some() {
        return Ok(row);
    }
    let localpart = address.split('@').next().unwrap_or(address);
    let user = User::new(localpart, pool.clone(), registry.clone());
    if user.has_mailbox(INBOX).await? {
        return Ok(Some((localpart.to_string(), INBOX.to_string())));
    }
    Ok(None)
}
