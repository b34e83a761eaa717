//! ManageSieve front-end (RFC 5804, with draft-martin-managesieve-06
//! terminology for the legacy capability names some clients still expect).
//!
//! The Sieve *language* evaluator is explicitly out of scope (§1's excluded
//! external collaborators) — this module only implements script storage
//! and activation management (PUTSCRIPT/GETSCRIPT/LISTSCRIPTS/SETACTIVE/
//! DELETESCRIPT/RENAMESCRIPT/CHECKSCRIPT), backed by the `sieve_scripts`
//! table. Framed the same way POP3 is: [`crate::buffer::Buffer`] plus
//! [`crate::tls::MaybeTlsStream`] for mid-dialogue `STARTTLS`, with the
//! `{n+}` literal-reading extension SPEC §4's "Literal handling" calls out
//! for both IMAP and ManageSieve.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use base64::Engine;
use futures::stream::{FuturesUnordered, StreamExt};
use sqlx::PgPool;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use pv_user::config::ManagesieveConfig;
use pv_user::login::ArcLoginProvider;

use crate::buffer::Buffer;
use crate::tls::MaybeTlsStream;

const MAX_LINE: usize = 2048;
const MAX_LITERAL: usize = 1024 * 1024;
const IMPLEMENTATION: &str = "passerine-managesieve v1.0";

pub struct Server {
    bind_addr: SocketAddr,
    login_provider: ArcLoginProvider,
    pool: PgPool,
    tls: Option<TlsAcceptor>,
}

pub fn new(config: ManagesieveConfig, login_provider: ArcLoginProvider, pool: PgPool) -> Result<Server> {
    let tls = match (config.certs, config.key) {
        (Some(certs), Some(key)) => Some(crate::tls::load_acceptor(&certs, &key)?),
        _ => None,
    };
    Ok(Server {
        bind_addr: config.bind_addr,
        login_provider,
        pool,
        tls,
    })
}

impl Server {
    pub async fn run(self, mut must_exit: watch::Receiver<bool>) -> Result<()> {
        let tcp = TcpListener::bind(self.bind_addr).await?;
        tracing::info!("ManageSieve server listening on {:#}", self.bind_addr);

        let this = Arc::new(self);
        let mut connections = FuturesUnordered::new();

        while !*must_exit.borrow() {
            let wait_conn_finished = async {
                if connections.is_empty() {
                    futures::future::pending().await
                } else {
                    connections.next().await
                }
            };
            let (socket, remote_addr) = tokio::select! {
                a = tcp.accept() => a?,
                _ = wait_conn_finished => continue,
                _ = must_exit.changed() => continue,
            };
            tracing::info!("ManageSieve: accepted connection from {}", remote_addr);
            let this = this.clone();
            connections.push(tokio::spawn(async move {
                if let Err(e) = this.handle(socket, remote_addr).await {
                    tracing::error!(addr=?remote_addr, err=?e, "ManageSieve connection ended with error");
                }
            }));
        }
        drop(tcp);

        tracing::info!("ManageSieve server shutting down, draining remaining connections...");
        while connections.next().await.is_some() {}

        Ok(())
    }

    async fn handle(&self, socket: tokio::net::TcpStream, addr: SocketAddr) -> Result<()> {
        let mut stream = MaybeTlsStream::Plain(socket);
        let mut conn = Connection::new(addr, self.login_provider.clone(), self.pool.clone());
        stream.write_all(&conn.capability_banner(self.tls.is_some())).await?;

        let mut buf = Buffer::new();
        let mut rbuf = [0u8; 4096];

        loop {
            let Some(line) = read_line(&mut stream, &mut buf, &mut rbuf).await? else {
                return Ok(());
            };

            let command = match parse_literal_marker(&line) {
                Some((prefix, n)) => {
                    if n > MAX_LITERAL {
                        stream.write_all(b"NO \"literal too large\"\r\n").await?;
                        return Ok(());
                    }
                    while buf.size() < n {
                        let read = stream.read(&mut rbuf).await?;
                        if read == 0 {
                            return Ok(());
                        }
                        buf.append(&rbuf[..read]);
                    }
                    let literal = buf.string(n);
                    buf.remove(n);
                    // discard the CRLF (or bare LF) that follows the literal
                    let _ = read_line(&mut stream, &mut buf, &mut rbuf).await?;
                    RawCommand { prefix, literal: Some(literal) }
                }
                None => RawCommand { prefix: line, literal: None },
            };

            let outcome = conn.dispatch(command, self.tls.is_some()).await;
            stream.write_all(&outcome.response).await?;
            match outcome.action {
                Action::Continue => {}
                Action::StartTls => {
                    let Some(tls) = self.tls.clone() else { continue };
                    let MaybeTlsStream::Plain(plain) = stream else { continue };
                    let tls_stream = tls.accept(plain).await?;
                    stream = MaybeTlsStream::Tls(Box::new(tls_stream));
                    buf = Buffer::new();
                }
                Action::Close => return Ok(()),
            }
        }
    }
}

async fn read_line(
    stream: &mut MaybeTlsStream,
    buf: &mut Buffer,
    rbuf: &mut [u8],
) -> Result<Option<Vec<u8>>> {
    loop {
        match buf.remove_line(MAX_LINE) {
            Ok(Some(line)) => return Ok(Some(line)),
            Ok(None) => {}
            Err(_) => {
                let _ = stream.write_all(b"BYE \"line too long\"\r\n").await;
                return Ok(None);
            }
        }
        let n = stream.read(rbuf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.append(&rbuf[..n]);
    }
}

/// Detects a trailing `{n+}` (or `{n}`, synchronizing form — treated the
/// same since this module always reads eagerly) literal marker, returning
/// the line with the marker stripped plus the byte count.
fn parse_literal_marker(line: &[u8]) -> Option<(Vec<u8>, usize)> {
    let text = std::str::from_utf8(line).ok()?;
    let trimmed = text.trim_end();
    if !trimmed.ends_with('}') {
        return None;
    }
    let open = trimmed.rfind('{')?;
    let inner = &trimmed[open + 1..trimmed.len() - 1];
    let digits = inner.strip_suffix('+').unwrap_or(inner);
    let n: usize = digits.parse().ok()?;
    let prefix = trimmed[..open].trim_end().as_bytes().to_vec();
    Some((prefix, n))
}

struct RawCommand {
    prefix: Vec<u8>,
    literal: Option<Vec<u8>>,
}

enum Action {
    Continue,
    StartTls,
    Close,
}

struct Outcome {
    response: Vec<u8>,
    action: Action,
}

fn ok(msg: impl AsRef<str>) -> Outcome {
    Outcome {
        response: format!("OK \"{}\"\r\n", msg.as_ref()).into_bytes(),
        action: Action::Continue,
    }
}

fn no(msg: impl AsRef<str>) -> Outcome {
    Outcome {
        response: format!("NO \"{}\"\r\n", msg.as_ref()).into_bytes(),
        action: Action::Continue,
    }
}

struct Connection {
    addr: SocketAddr,
    login_provider: ArcLoginProvider,
    pool: PgPool,
    authenticated: Option<String>,
}

impl Connection {
    fn new(addr: SocketAddr, login_provider: ArcLoginProvider, pool: PgPool) -> Self {
        Self {
            addr,
            login_provider,
            pool,
            authenticated: None,
        }
    }

    fn capability_banner(&self, tls_available: bool) -> Vec<u8> {
        let mut lines = vec![
            "\"SIEVE\" \"Fileinto Refuse Reject\"".to_string(),
            format!("\"IMPLEMENTATION\" \"{IMPLEMENTATION}\""),
            "\"SASL\" \"PLAIN\"".to_string(),
        ];
        if tls_available {
            lines.push("\"STARTTLS\"".to_string());
        }
        lines.push("OK".to_string());
        (lines.join("\r\n") + "\r\n").into_bytes()
    }

    async fn dispatch(&mut self, command: RawCommand, tls_available: bool) -> Outcome {
        let prefix = String::from_utf8_lossy(&command.prefix).to_string();
        let mut parts = prefix.trim().splitn(2, ' ');
        let verb = parts.next().unwrap_or("").to_ascii_uppercase();
        let rest = parts.next().unwrap_or("").trim();
        let args = parse_args(rest);

        match verb.as_str() {
            "CAPABILITY" => Outcome {
                response: self.capability_banner(tls_available),
                action: Action::Continue,
            },
            "LOGOUT" => Outcome {
                response: b"OK \"goodbye\"\r\n".to_vec(),
                action: Action::Close,
            },
            "NOOP" => ok("done"),
            "STARTTLS" => self.starttls(),
            "UNAUTHENTICATE" => {
                self.authenticated = None;
                ok("back to unauthenticated")
            }
            "AUTHENTICATE" => self.authenticate(&args).await,
            "HAVESPACE" => ok("space available"),
            "LISTSCRIPTS" => self.list_scripts().await,
            "PUTSCRIPT" => self.put_script(&args, command.literal).await,
            "GETSCRIPT" => self.get_script(&args).await,
            "SETACTIVE" => self.set_active(&args).await,
            "DELETESCRIPT" => self.delete_script(&args).await,
            "RENAMESCRIPT" => self.rename_script(&args).await,
            "CHECKSCRIPT" => ok("syntax check skipped, no Sieve evaluator configured"),
            _ => no("unknown command"),
        }
    }

    fn starttls(&mut self) -> Outcome {
        Outcome {
            response: b"OK \"begin TLS negotiation\"\r\n".to_vec(),
            action: Action::StartTls,
        }
    }

    async fn authenticate(&mut self, args: &[String]) -> Outcome {
        let Some(mechanism) = args.first() else {
            return no("missing mechanism");
        };
        if mechanism.to_ascii_uppercase() != "PLAIN" {
            return no("unsupported SASL mechanism");
        }
        let Some(b64) = args.get(1) else {
            return no("missing initial response");
        };
        let Ok(blob) = base64::engine::general_purpose::STANDARD.decode(b64) else {
            return no("invalid base64");
        };
        let Ok((_, (_impersonated, user, pass))) = pv_sasl::decode::auth_plain(&blob) else {
            return no("malformed PLAIN response");
        };
        let username = String::from_utf8_lossy(user).to_string();
        let password = String::from_utf8_lossy(pass).to_string();
        match self.login_provider.login(&username, &password).await {
            Ok(creds) => {
                tracing::info!(addr=?self.addr, user=%creds.username, "ManageSieve AUTHENTICATE succeeded");
                self.authenticated = Some(creds.username);
                ok("authenticated")
            }
            Err(_) => no("authentication failed"),
        }
    }

    fn require_auth(&self) -> Option<&str> {
        self.authenticated.as_deref()
    }

    async fn list_scripts(&self) -> Outcome {
        let Some(owner) = self.require_auth() else {
            return no("authentication required");
        };
        let rows: Vec<(String, bool)> = match sqlx::query_as(
            "select name, active from sieve_scripts where owner = $1 order by name",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await
        {
            Ok(rows) => rows,
            Err(e) => return no(format!("could not list scripts: {e}")),
        };
        let mut lines: Vec<String> = rows
            .into_iter()
            .map(|(name, active)| {
                if active {
                    format!("\"{name}\" ACTIVE")
                } else {
                    format!("\"{name}\"")
                }
            })
            .collect();
        lines.push("OK".to_string());
        Outcome {
            response: (lines.join("\r\n") + "\r\n").into_bytes(),
            action: Action::Continue,
        }
    }

    async fn put_script(&self, args: &[String], literal: Option<Vec<u8>>) -> Outcome {
        let Some(owner) = self.require_auth() else {
            return no("authentication required");
        };
        let Some(name) = args.first() else {
            return no("missing script name");
        };
        let Some(content) = literal else {
            return no("missing script literal");
        };
        let content = String::from_utf8_lossy(&content).to_string();
        let result = sqlx::query(
            "insert into sieve_scripts (owner, name, content) values ($1, $2, $3) \
             on conflict (owner, name) do update set content = excluded.content",
        )
        .bind(owner)
        .bind(name)
        .bind(&content)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => ok("script stored"),
            Err(e) => no(format!("could not store script: {e}")),
        }
    }

    async fn get_script(&self, args: &[String]) -> Outcome {
        let Some(owner) = self.require_auth() else {
            return no("authentication required");
        };
        let Some(name) = args.first() else {
            return no("missing script name");
        };
        let row: Option<(String,)> =
            match sqlx::query_as("select content from sieve_scripts where owner = $1 and name = $2")
                .bind(owner)
                .bind(name)
                .fetch_optional(&self.pool)
                .await
            {
                Ok(row) => row,
                Err(e) => return no(format!("could not fetch script: {e}")),
            };
        let Some((content,)) = row else {
            return no("script not found");
        };
        let mut response = format!("{{{}}}\r\n", content.len()).into_bytes();
        response.extend_from_slice(content.as_bytes());
        response.extend_from_slice(b"\r\nOK\r\n");
        Outcome {
            response,
            action: Action::Continue,
        }
    }

    async fn set_active(&self, args: &[String]) -> Outcome {
        let Some(owner) = self.require_auth() else {
            return no("authentication required");
        };
        let name = args.first().map(|s| s.as_str()).unwrap_or("");
        let mut txn = match self.pool.begin().await {
            Ok(t) => t,
            Err(e) => return no(format!("could not start transaction: {e}")),
        };
        if sqlx::query("update sieve_scripts set active = false where owner = $1")
            .bind(owner)
            .execute(&mut *txn)
            .await
            .is_err()
        {
            return no("could not clear active script");
        }
        if !name.is_empty() {
            let updated = sqlx::query("update sieve_scripts set active = true where owner = $1 and name = $2")
                .bind(owner)
                .bind(name)
                .execute(&mut *txn)
                .await;
            match updated {
                Ok(r) if r.rows_affected() == 0 => return no("script not found"),
                Ok(_) => {}
                Err(e) => return no(format!("could not activate script: {e}")),
            }
        }
        if let Err(e) = txn.commit().await {
            return no(format!("could not commit: {e}"));
        }
        ok("active script updated")
    }

    async fn delete_script(&self, args: &[String]) -> Outcome {
        let Some(owner) = self.require_auth() else {
            return no("authentication required");
        };
        let Some(name) = args.first() else {
            return no("missing script name");
        };
        let row: Option<(bool,)> =
            match sqlx::query_as("select active from sieve_scripts where owner = $1 and name = $2")
                .bind(owner)
                .bind(name)
                .fetch_optional(&self.pool)
                .await
            {
                Ok(row) => row,
                Err(e) => return no(format!("could not look up script: {e}")),
            };
        match row {
            None => no("script not found"),
            Some((true,)) => no("cannot delete the active script"),
            Some((false,)) => {
                match sqlx::query("delete from sieve_scripts where owner = $1 and name = $2")
                    .bind(owner)
                    .bind(name)
                    .execute(&self.pool)
                    .await
                {
                    Ok(_) => ok("script deleted"),
                    Err(e) => no(format!("could not delete script: {e}")),
                }
            }
        }
    }

    async fn rename_script(&self, args: &[String]) -> Outcome {
        let Some(owner) = self.require_auth() else {
            return no("authentication required");
        };
        let (Some(old_name), Some(new_name)) = (args.first(), args.get(1)) else {
            return no("usage: RENAMESCRIPT oldname newname");
        };
        match sqlx::query("update sieve_scripts set name = $3 where owner = $1 and name = $2")
            .bind(owner)
            .bind(old_name)
            .bind(new_name)
            .execute(&self.pool)
            .await
        {
            Ok(r) if r.rows_affected() == 0 => no("script not found"),
            Ok(_) => ok("script renamed"),
            Err(e) => no(format!("could not rename script: {e}")),
        }
    }
}

/// Splits a ManageSieve argument list into bare and quoted-string tokens.
/// No escape handling beyond `\"` — scripts themselves arrive as literals,
/// never as quoted strings, so this only ever sees short identifiers.
fn parse_args(rest: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut chars = rest.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' {
            chars.next();
            let mut token = String::new();
            while let Some(c) = chars.next() {
                if c == '\\' {
                    if let Some(next) = chars.next() {
                        token.push(next);
                    }
                } else if c == '"' {
                    break;
                } else {
                    token.push(c);
                }
            }
            args.push(token);
        } else {
            let mut token = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
            args.push(token);
        }
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_args_splits_quoted_and_bare_tokens() {
        assert_eq!(parse_args(r#""myscript" ACTIVE"#), vec!["myscript", "ACTIVE"]);
    }

    #[test]
    fn literal_marker_extracts_prefix_and_size() {
        let (prefix, n) = parse_literal_marker(br#"PUTSCRIPT "foo" {31+}"#).unwrap();
        assert_eq!(prefix, br#"PUTSCRIPT "foo""#.to_vec());
        assert_eq!(n, 31);
    }

    #[test]
    fn literal_marker_absent_returns_none() {
        assert!(parse_literal_marker(b"LOGOUT").is_none());
    }
}
