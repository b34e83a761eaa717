//! POP3 command dispatch (RFC 1939 + RFC 2449 CAPA + RFC 2595 STLS + SASL
//! PLAIN per RFC 5034), grounded on the login flow `pv-proto`'s IMAP
//! `command::anonymous::authenticate` already establishes: verify via the
//! configured [`pv_user::login::LoginProvider`], then build a
//! `pv_collections::user::User` and call `ensure_defaults` before opening
//! a mailbox view.

use std::collections::HashSet;
use std::net::SocketAddr;

use base64::Engine;
use sqlx::PgPool;

use pv_collections::mail::registry::MailboxRegistry;
use pv_collections::user::User;
use pv_user::login::ArcLoginProvider;

use super::Mailbox;

pub enum Action {
    Continue,
    StartTls,
    Close,
}

pub struct Outcome {
    pub response: Vec<u8>,
    pub action: Action,
}

fn ok(msg: impl AsRef<str>) -> Outcome {
    Outcome {
        response: format!("+OK {}\r\n", msg.as_ref()).into_bytes(),
        action: Action::Continue,
    }
}

fn err(msg: impl AsRef<str>) -> Outcome {
    Outcome {
        response: format!("-ERR {}\r\n", msg.as_ref()).into_bytes(),
        action: Action::Continue,
    }
}

enum State {
    Authorization { pending_user: Option<String> },
    Transaction(Box<Mailbox>),
    Update,
}

pub struct Connection {
    addr: SocketAddr,
    login_provider: ArcLoginProvider,
    pool: PgPool,
    registry: MailboxRegistry,
    state: State,
    tls_active: bool,
}

impl Connection {
    pub fn new(addr: SocketAddr, login_provider: ArcLoginProvider, pool: PgPool, registry: MailboxRegistry) -> Self {
        Self {
            addr,
            login_provider,
            pool,
            registry,
            state: State::Authorization { pending_user: None },
            tls_active: false,
        }
    }

    pub async fn dispatch(&mut self, line: &[u8]) -> Outcome {
        let line = String::from_utf8_lossy(line);
        let mut parts = line.trim().splitn(2, ' ');
        let verb = parts.next().unwrap_or("").to_ascii_uppercase();
        let rest = parts.next().unwrap_or("").trim();

        match verb.as_str() {
            "CAPA" => self.capa(),
            "QUIT" => self.quit().await,
            "NOOP" => match &self.state {
                State::Transaction(_) => ok("nothing happened"),
                _ => ok("ready"),
            },
            "STLS" => self.stls(),
            "AUTH" => self.auth(rest).await,
            "USER" => self.user(rest),
            "PASS" => self.pass(rest).await,
            "STAT" => self.stat().await,
            "LIST" => self.list(rest).await,
            "UIDL" => self.uidl(rest),
            "RETR" => self.retr(rest).await,
            "TOP" => self.top(rest).await,
            "DELE" => self.dele(rest).await,
            "RSET" => self.rset().await,
            _ => err("unknown command"),
        }
    }

    fn capa(&self) -> Outcome {
        let mut lines = vec!["+OK Capability list follows".to_string()];
        lines.push("USER".to_string());
        lines.push("UIDL".to_string());
        lines.push("SASL PLAIN".to_string());
        if !self.tls_active {
            lines.push("STLS".to_string());
        }
        lines.push(".".to_string());
        Outcome {
            response: (lines.join("\r\n") + "\r\n").into_bytes(),
            action: Action::Continue,
        }
    }

    async fn quit(&mut self) -> Outcome {
        if let State::Transaction(mailbox) = &self.state {
            if !mailbox.deleted.is_empty() {
                if let Err(e) = mailbox.session.expunge().await {
                    self.state = State::Update;
                    return err(format!("could not expunge: {e}"));
                }
            }
        }
        self.state = State::Update;
        Outcome {
            response: b"+OK passerine POP3 server signing off\r\n".to_vec(),
            action: Action::Close,
        }
    }

    fn stls(&mut self) -> Outcome {
        if self.tls_active {
            return err("command not permitted when TLS active");
        }
        if !matches!(self.state, State::Authorization { .. }) {
            return err("STLS only valid before authentication");
        }
        self.tls_active = true;
        Outcome {
            response: b"+OK begin TLS negotiation\r\n".to_vec(),
            action: Action::StartTls,
        }
    }

    fn user(&mut self, rest: &str) -> Outcome {
        if !matches!(self.state, State::Authorization { .. }) {
            return err("already authenticated");
        }
        if rest.is_empty() {
            return err("missing username");
        }
        self.state = State::Authorization {
            pending_user: Some(rest.to_string()),
        };
        ok("send PASS")
    }

    async fn pass(&mut self, rest: &str) -> Outcome {
        let State::Authorization { pending_user } = &self.state else {
            return err("already authenticated");
        };
        let Some(username) = pending_user.clone() else {
            return err("USER required first");
        };
        self.authenticate(&username, rest).await
    }

    async fn auth(&mut self, rest: &str) -> Outcome {
        if !matches!(self.state, State::Authorization { .. }) {
            return err("already authenticated");
        }
        let mut parts = rest.splitn(2, ' ');
        let mechanism = parts.next().unwrap_or("").to_ascii_uppercase();
        if mechanism != "PLAIN" {
            return err("unsupported SASL mechanism");
        }
        let Some(b64) = parts.next() else {
            return err("initial response required");
        };
        let Ok(blob) = base64::engine::general_purpose::STANDARD.decode(b64.trim()) else {
            return err("invalid base64");
        };
        match pv_sasl::decode::auth_plain(&blob) {
            Ok((_, (_impersonated, user, pass))) => {
                let user = String::from_utf8_lossy(user).to_string();
                let pass = String::from_utf8_lossy(pass).to_string();
                self.authenticate(&user, &pass).await
            }
            Err(_) => err("malformed PLAIN response"),
        }
    }

    async fn authenticate(&mut self, username: &str, password: &str) -> Outcome {
        let creds = match self.login_provider.login(username, password).await {
            Ok(c) => c,
            Err(_) => {
                self.state = State::Authorization { pending_user: None };
                return err("authentication failed");
            }
        };
        let user = User::new(creds.username, self.pool.clone(), self.registry.clone());
        if let Err(e) = user.ensure_defaults().await {
            return err(format!("could not initialize mailboxes: {e}"));
        }
        match Mailbox::open(&user).await {
            Ok(Some(mailbox)) => {
                tracing::info!(addr=?self.addr, user=%user.username, "POP3 login succeeded");
                self.state = State::Transaction(Box::new(mailbox));
                ok("maildrop locked and ready")
            }
            Ok(None) => err("maildrop unavailable"),
            Err(e) => err(format!("could not open maildrop: {e}")),
        }
    }

    fn mailbox(&self) -> Option<&Mailbox> {
        match &self.state {
            State::Transaction(m) => Some(m),
            _ => None,
        }
    }

    async fn stat(&self) -> Outcome {
        let Some(mailbox) = self.mailbox() else {
            return err("not authenticated");
        };
        let mut total = 0i64;
        let mut count = 0usize;
        for idx in mailbox.live_indices() {
            let uid = mailbox.order[idx];
            match mailbox.session.message_size(uid).await {
                Ok(Some(size)) => {
                    count += 1;
                    total += size;
                }
                Ok(None) => {}
                Err(e) => return err(format!("could not size maildrop: {e}")),
            }
        }
        ok(format!("{count} {total}"))
    }

    async fn list(&self, rest: &str) -> Outcome {
        let Some(mailbox) = self.mailbox() else {
            return err("not authenticated");
        };
        if rest.is_empty() {
            let indices: Vec<usize> = mailbox.live_indices().collect();
            let mut lines = vec![format!("+OK {} messages", indices.len())];
            for idx in indices {
                let uid = mailbox.order[idx];
                let size = mailbox.session.message_size(uid).await.ok().flatten().unwrap_or(0);
                lines.push(format!("{} {}", idx + 1, size));
            }
            lines.push(".".to_string());
            return Outcome {
                response: (lines.join("\r\n") + "\r\n").into_bytes(),
                action: Action::Continue,
            };
        }
        let Ok(n) = rest.trim().parse::<usize>() else {
            return err("invalid message number");
        };
        match mailbox.uid_for(n) {
            Some((_, uid)) => {
                let size = mailbox.session.message_size(uid).await.ok().flatten().unwrap_or(0);
                ok(format!("{n} {size}"))
            }
            None => err("no such message"),
        }
    }

    fn uidl(&self, rest: &str) -> Outcome {
        let Some(mailbox) = self.mailbox() else {
            return err("not authenticated");
        };
        if rest.is_empty() {
            let mut lines = vec!["+OK unique-id listing follows".to_string()];
            for idx in mailbox.live_indices() {
                lines.push(format!("{} {}", idx + 1, mailbox.order[idx]));
            }
            lines.push(".".to_string());
            return Outcome {
                response: (lines.join("\r\n") + "\r\n").into_bytes(),
                action: Action::Continue,
            };
        }
        let Ok(n) = rest.trim().parse::<usize>() else {
            return err("invalid message number");
        };
        match mailbox.uid_for(n) {
            Some((_, uid)) => ok(format!("{n} {uid}")),
            None => err("no such message"),
        }
    }

    async fn retr(&self, rest: &str) -> Outcome {
        let Some(mailbox) = self.mailbox() else {
            return err("not authenticated");
        };
        let Ok(n) = rest.trim().parse::<usize>() else {
            return err("invalid message number");
        };
        let Some((_, uid)) = mailbox.uid_for(n) else {
            return err("no such message");
        };
        match mailbox.session.message_body(uid).await {
            Ok(Some(body)) => render_message(&body, None),
            Ok(None) => err("message vanished"),
            Err(e) => err(format!("could not fetch message: {e}")),
        }
    }

    async fn top(&self, rest: &str) -> Outcome {
        let Some(mailbox) = self.mailbox() else {
            return err("not authenticated");
        };
        let mut args = rest.split_whitespace();
        let (Some(n_str), Some(lines_str)) = (args.next(), args.next()) else {
            return err("usage: TOP msg n");
        };
        let (Ok(n), Ok(lines)) = (n_str.parse::<usize>(), lines_str.parse::<usize>()) else {
            return err("invalid arguments");
        };
        let Some((_, uid)) = mailbox.uid_for(n) else {
            return err("no such message");
        };
        match mailbox.session.message_body(uid).await {
            Ok(Some(body)) => render_message(&body, Some(lines)),
            Ok(None) => err("message vanished"),
            Err(e) => err(format!("could not fetch message: {e}")),
        }
    }

    async fn dele(&mut self, rest: &str) -> Outcome {
        let Ok(n) = rest.trim().parse::<usize>() else {
            return err("invalid message number");
        };
        let State::Transaction(mailbox) = &mut self.state else {
            return err("not authenticated");
        };
        let Some((idx, uid)) = mailbox.uid_for(n) else {
            return err("no such message");
        };
        let mut flags: HashSet<String> = mailbox.session.flags(uid).into_iter().collect();
        flags.insert("\\Deleted".to_string());
        if let Err(e) = mailbox.session.set_flags(uid, flags.into_iter().collect()).await {
            return err(format!("could not mark deleted: {e}"));
        }
        mailbox.deleted.insert(idx);
        ok(format!("message {n} deleted"))
    }

    async fn rset(&mut self) -> Outcome {
        let State::Transaction(mailbox) = &mut self.state else {
            return err("not authenticated");
        };
        let indices: Vec<usize> = mailbox.deleted.drain().collect();
        for idx in indices {
            let uid = mailbox.order[idx];
            let mut flags: HashSet<String> = mailbox.session.flags(uid).into_iter().collect();
            flags.remove("\\Deleted");
            if let Err(e) = mailbox.session.set_flags(uid, flags.into_iter().collect()).await {
                return err(format!("could not reset: {e}"));
            }
        }
        ok("maildrop has been reset")
    }
}

/// Emits `+OK <n> octets\r\n<dot-stuffed body>.\r\n`. `top_lines` truncates
/// to headers plus that many lines of body (RFC 1939 TOP); `None` returns
/// the whole message (RETR).
fn render_message(body: &[u8], top_lines: Option<usize>) -> Outcome {
    let text = String::from_utf8_lossy(body);
    let rendered = match top_lines {
        None => text.to_string(),
        Some(n) => {
            let mut out_lines = Vec::new();
            let mut in_body = false;
            let mut body_lines_emitted = 0usize;
            for line in text.split('\n') {
                if !in_body {
                    out_lines.push(line.to_string());
                    if line.trim_end_matches('\r').is_empty() {
                        in_body = true;
                    }
                } else if body_lines_emitted < n {
                    out_lines.push(line.to_string());
                    body_lines_emitted += 1;
                } else {
                    break;
                }
            }
            out_lines.join("\n")
        }
    };
    let mut dot_stuffed = String::new();
    for line in rendered.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.starts_with('.') {
            dot_stuffed.push('.');
        }
        dot_stuffed.push_str(line);
        dot_stuffed.push_str("\r\n");
    }
    let mut response = format!("+OK {} octets\r\n", dot_stuffed.len()).into_bytes();
    response.extend_from_slice(dot_stuffed.as_bytes());
    response.extend_from_slice(b".\r\n");
    Outcome {
        response,
        action: Action::Continue,
    }
}
