//! Thin, test-specific wrappers around raw socket traffic. These are not
//! generic protocol clients — each fragment hardcodes exactly the command
//! its scenario needs, the way the teacher's own `fragments.rs` did.

use anyhow::{bail, Result};
use std::io::Write;
use std::net::TcpStream;

use super::*;

pub fn connect(imap: &mut TcpStream) -> Result<()> {
    let mut buffer: [u8; 1500] = [0; 1500];
    let read = read_lines(imap, &mut buffer, None)?;
    assert_eq!(&read[..4], &b"* OK"[..]);
    Ok(())
}

pub fn login(imap: &mut TcpStream, user: &str, password: &str) -> Result<()> {
    let mut buffer: [u8; 1500] = [0; 1500];
    write_line(imap, format!("10 login {} {}\r\n", user, password).as_bytes())?;
    let read = read_lines(imap, &mut buffer, None)?;
    assert_eq!(&read[..5], &b"10 OK"[..]);
    Ok(())
}

pub fn select(imap: &mut TcpStream, mailbox: &str, condstore: bool) -> Result<String> {
    let mut buffer: [u8; 2000] = [0; 2000];
    let cmd = if condstore {
        format!("20 select {} (condstore)\r\n", mailbox)
    } else {
        format!("20 select {}\r\n", mailbox)
    };
    write_line(imap, cmd.as_bytes())?;
    let read = read_lines(imap, &mut buffer, Some(b"20 OK"))?;
    Ok(String::from_utf8_lossy(read).into_owned())
}

pub fn status(imap: &mut TcpStream, mailbox: &str, items: &str) -> Result<String> {
    let mut buffer: [u8; 1500] = [0; 1500];
    write_line(imap, format!("30 status {} ({})\r\n", mailbox, items).as_bytes())?;
    let read = read_lines(imap, &mut buffer, Some(b"30 OK"))?;
    Ok(String::from_utf8_lossy(read).into_owned())
}

pub fn append(imap: &mut TcpStream, mailbox: &str, body: &[u8]) -> Result<String> {
    let mut buffer: [u8; 2000] = [0; 2000];
    write_line(imap, format!("40 append {} {{{}}}\r\n", mailbox, body.len()).as_bytes())?;
    let read = read_lines(imap, &mut buffer, Some(b"+"))?;
    assert_eq!(&read[..1], &b"+"[..]);
    write_line(imap, body)?;
    write_line(imap, b"\r\n")?;
    let read = read_lines(imap, &mut buffer, Some(b"40 OK"))?;
    Ok(String::from_utf8_lossy(read).into_owned())
}

pub fn store_deleted(imap: &mut TcpStream, seq: &str) -> Result<String> {
    let mut buffer: [u8; 1500] = [0; 1500];
    write_line(imap, format!("50 store {} +flags (\\Deleted)\r\n", seq).as_bytes())?;
    let read = read_lines(imap, &mut buffer, Some(b"50 OK"))?;
    Ok(String::from_utf8_lossy(read).into_owned())
}

pub fn expunge(imap: &mut TcpStream) -> Result<String> {
    let mut buffer: [u8; 1500] = [0; 1500];
    write_line(imap, b"60 expunge\r\n")?;
    let read = read_lines(imap, &mut buffer, Some(b"60 OK"))?;
    Ok(String::from_utf8_lossy(read).into_owned())
}

pub fn logout(imap: &mut TcpStream) -> Result<()> {
    let mut buffer: [u8; 1500] = [0; 1500];
    write_line(imap, b"99 logout\r\n")?;
    let _ = read_lines(imap, &mut buffer, Some(b"99 OK"))?;
    Ok(())
}

pub fn lmtp_handshake(lmtp: &mut TcpStream, hostname: &str) -> Result<()> {
    let mut buffer: [u8; 1500] = [0; 1500];
    let read = read_lines(lmtp, &mut buffer, None)?;
    assert_eq!(&read[..3], &b"220"[..]);
    write_line(lmtp, format!("LHLO {}\r\n", hostname).as_bytes())?;
    let _ = read_lines(lmtp, &mut buffer, None)?;
    Ok(())
}

pub fn lmtp_deliver(lmtp: &mut TcpStream, from: &str, to: &str, body: &[u8]) -> Result<()> {
    let mut buffer: [u8; 1500] = [0; 1500];
    write_line(lmtp, format!("MAIL FROM:<{}>\r\n", from).as_bytes())?;
    let read = read_lines(lmtp, &mut buffer, None)?;
    assert_eq!(&read[..3], &b"250"[..]);

    write_line(lmtp, format!("RCPT TO:<{}>\r\n", to).as_bytes())?;
    let read = read_lines(lmtp, &mut buffer, None)?;
    assert_eq!(&read[..3], &b"250"[..]);

    write_line(lmtp, b"DATA\r\n")?;
    let read = read_lines(lmtp, &mut buffer, None)?;
    assert_eq!(&read[..3], &b"354"[..]);

    lmtp.write_all(body)?;
    lmtp.write_all(b"\r\n.\r\n")?;
    let read = read_lines(lmtp, &mut buffer, None)?;
    assert_eq!(&read[..3], &b"250"[..]);
    Ok(())
}

pub fn smtp_handshake(smtp: &mut TcpStream, hostname: &str) -> Result<()> {
    let mut buffer: [u8; 1500] = [0; 1500];
    let read = read_lines(smtp, &mut buffer, None)?;
    assert_eq!(&read[..3], &b"220"[..]);
    write_line(smtp, format!("EHLO {}\r\n", hostname).as_bytes())?;
    let _ = read_lines(smtp, &mut buffer, None)?;
    Ok(())
}

/// Submission must reject `MAIL FROM` before AUTH succeeds (RFC 4954 §4).
pub fn smtp_mail_without_auth_is_rejected(smtp: &mut TcpStream) -> Result<()> {
    let mut buffer: [u8; 1500] = [0; 1500];
    write_line(smtp, b"MAIL FROM:<nobody@example.tld>\r\n")?;
    let read = read_lines(smtp, &mut buffer, None)?;
    if &read[..3] != b"530" {
        bail!("expected 530 for unauthenticated MAIL, got {}", String::from_utf8_lossy(read));
    }
    Ok(())
}

pub fn smtp_auth_plain_fails(smtp: &mut TcpStream, user: &str, wrong_password: &str) -> Result<()> {
    use base64::Engine;
    let mut buffer: [u8; 1500] = [0; 1500];
    let resp = format!("\0{}\0{}", user, wrong_password);
    let b64 = base64::engine::general_purpose::STANDARD.encode(resp);
    write_line(smtp, format!("AUTH PLAIN {}\r\n", b64).as_bytes())?;
    let read = read_lines(smtp, &mut buffer, None)?;
    if &read[..3] != b"535" {
        bail!("expected 535 for wrong credentials, got {}", String::from_utf8_lossy(read));
    }
    Ok(())
}

pub fn sieve_read_greeting(sieve: &mut TcpStream) -> Result<String> {
    let mut buffer: [u8; 2000] = [0; 2000];
    let read = read_lines(sieve, &mut buffer, Some(b"OK"))?;
    Ok(String::from_utf8_lossy(read).into_owned())
}

pub fn sieve_putscript(sieve: &mut TcpStream, name: &str, script: &[u8]) -> Result<String> {
    let mut buffer: [u8; 2000] = [0; 2000];
    write_line(
        sieve,
        format!("PUTSCRIPT \"{}\" {{{}+}}\r\n", name, script.len()).as_bytes(),
    )?;
    sieve.write_all(script)?;
    sieve.write_all(b"\r\n")?;
    let read = read_lines(sieve, &mut buffer, Some(b"OK"))?;
    Ok(String::from_utf8_lossy(read).into_owned())
}
