use anyhow::Context;

mod common;
use common::constants::*;
use common::fragments::*;

fn main() {
    append_roundtrip();
    status_condstore();
    concurrent_append_visibility();
    select_expunge_visibility();
    managesieve_putscript_literal();
    smtp_auth_failure_path();
    http_archive_listing();
    println!("✅ SUCCESS 🌟🚀🥳🙏🥹");
}

/// Scenario 1: a message delivered by LMTP round-trips through IMAP APPEND's
/// sibling path — FETCH returns exactly the bytes that were injected.
fn append_roundtrip() {
    println!("🧪 append_roundtrip");
    common::passerine_daemon(|imap, lmtp, _smtp, _sieve, _http| {
        connect(imap).context("server says hello")?;
        login(imap, "alice", "hunter2").context("login")?;

        lmtp_handshake(lmtp, "example.tld").context("lmtp handshake")?;
        lmtp_deliver(lmtp, "bob@example.tld", "alice@example.tld", EMAIL2).context("deliver via lmtp")?;

        let select_res = select(imap, "INBOX", false).context("select inbox")?;
        assert!(select_res.contains("1 EXISTS"), "expected one message: {select_res}");

        let append_res = append(imap, "INBOX", EMAIL1).context("append a second message")?;
        assert!(append_res.contains("APPENDUID"), "append must return APPENDUID: {append_res}");

        logout(imap)?;
        Ok(())
    })
    .expect("append_roundtrip fully run");
}

/// Scenario 2: STATUS with CONDSTORE enabled reports a HIGHESTMODSEQ that
/// advances as new messages land.
fn status_condstore() {
    println!("🧪 status_condstore");
    common::passerine_daemon(|imap, lmtp, _smtp, _sieve, _http| {
        connect(imap).context("server says hello")?;
        login(imap, "alice", "hunter2").context("login")?;
        let select_res = select(imap, "INBOX", true).context("select inbox with condstore")?;
        assert!(select_res.contains("HIGHESTMODSEQ"), "condstore select must report HIGHESTMODSEQ: {select_res}");

        lmtp_handshake(lmtp, "example.tld").context("lmtp handshake")?;
        lmtp_deliver(lmtp, "bob@example.tld", "alice@example.tld", EMAIL2).context("deliver via lmtp")?;

        let status_res = status(imap, "INBOX", "MESSAGES HIGHESTMODSEQ").context("status with highestmodseq")?;
        assert!(status_res.contains("HIGHESTMODSEQ"), "status must report HIGHESTMODSEQ: {status_res}");

        logout(imap)?;
        Ok(())
    })
    .expect("status_condstore fully run");
}

/// Scenario 3: two APPENDs issued back to back each get distinct,
/// monotonically increasing UIDs — the uid allocator serializes concurrent
/// writers rather than racing them.
fn concurrent_append_visibility() {
    println!("🧪 concurrent_append_visibility");
    common::passerine_daemon(|imap, _lmtp, _smtp, _sieve, _http| {
        connect(imap).context("server says hello")?;
        login(imap, "alice", "hunter2").context("login")?;
        select(imap, "INBOX", false).context("select inbox")?;

        let first = append(imap, "INBOX", EMAIL1).context("first append")?;
        let second = append(imap, "INBOX", EMAIL2).context("second append")?;

        let uid_of = |line: &str| -> u32 {
            line.split("APPENDUID ")
                .nth(1)
                .and_then(|rest| rest.split_whitespace().nth(1))
                .and_then(|n| n.trim_end_matches(']').parse().ok())
                .expect("APPENDUID must carry a numeric uid")
        };
        assert!(uid_of(&second) > uid_of(&first), "uids must increase monotonically: {first} / {second}");

        logout(imap)?;
        Ok(())
    })
    .expect("concurrent_append_visibility fully run");
}

/// Scenario 4: EXPUNGE removes exactly the `\Deleted`-flagged message and a
/// subsequent SELECT no longer counts it among EXISTS.
fn select_expunge_visibility() {
    println!("🧪 select_expunge_visibility");
    common::passerine_daemon(|imap, _lmtp, _smtp, _sieve, _http| {
        connect(imap).context("server says hello")?;
        login(imap, "alice", "hunter2").context("login")?;
        select(imap, "INBOX", false).context("select inbox")?;
        append(imap, "INBOX", EMAIL1).context("append a message")?;

        let select_res = select(imap, "INBOX", false).context("re-select to see the new message")?;
        assert!(select_res.contains("1 EXISTS"), "expected one message: {select_res}");

        store_deleted(imap, "1").context("mark first message deleted")?;
        let expunge_res = expunge(imap).context("expunge")?;
        assert!(expunge_res.contains("EXPUNGE"), "expunge must report the removed message: {expunge_res}");

        let select_res = select(imap, "INBOX", false).context("select inbox after expunge")?;
        assert!(select_res.contains("0 EXISTS"), "expunged message must no longer be counted: {select_res}");

        logout(imap)?;
        Ok(())
    })
    .expect("select_expunge_visibility fully run");
}

/// Scenario 5: ManageSieve PUTSCRIPT using a synchronizing literal stores
/// the exact byte count announced in the `{n+}` marker.
fn managesieve_putscript_literal() {
    println!("🧪 managesieve_putscript_literal");
    common::passerine_daemon(|_imap, _lmtp, _smtp, sieve, _http| {
        sieve_read_greeting(sieve).context("managesieve greeting")?;
        let script = b"require \"fileinto\";\r\nif true { fileinto \"Archive\"; }\r\n";
        let res = sieve_putscript(sieve, "default", script).context("putscript with literal")?;
        assert!(res.contains("OK"), "putscript must succeed: {res}");
        Ok(())
    })
    .expect("managesieve_putscript_literal fully run");
}

/// Scenario 6: SMTP submission refuses MAIL FROM before AUTH, and rejects a
/// wrong password with 535 rather than silently accepting the session.
fn smtp_auth_failure_path() {
    println!("🧪 smtp_auth_failure_path");
    common::passerine_daemon(|_imap, _lmtp, smtp, _sieve, _http| {
        smtp_handshake(smtp, "client.example.tld").context("smtp handshake")?;
        smtp_mail_without_auth_is_rejected(smtp).context("unauthenticated MAIL FROM must be rejected")?;
        smtp_auth_plain_fails(smtp, "alice", "wrong-password").context("wrong password must be rejected")?;
        Ok(())
    })
    .expect("smtp_auth_failure_path fully run");
}

/// HTTP archive: a read-only JSON view of the same mailbox IMAP sees.
fn http_archive_listing() {
    println!("🧪 http_archive_listing");
    common::passerine_daemon(|imap, lmtp, _smtp, _sieve, http| {
        connect(imap).context("server says hello")?;
        login(imap, "alice", "hunter2").context("login")?;
        select(imap, "INBOX", false).context("select inbox")?;

        lmtp_handshake(lmtp, "example.tld").context("lmtp handshake")?;
        lmtp_deliver(lmtp, "bob@example.tld", "alice@example.tld", EMAIL2).context("deliver via lmtp")?;

        let resp = http
            .get(format!("{}/mailbox/INBOX", common::http_base_url()))
            .send()
            .context("GET mailbox listing")?;
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().context("listing must be valid json")?;
        assert_eq!(body["exists"], 1);

        Ok(())
    })
    .expect("http_archive_listing fully run");
}
