//! POP3 front-end (RFC 1939 + STLS + AUTH PLAIN, SPEC §6).
//!
//! Built directly on [`crate::buffer::Buffer`] rather than a dedicated wire
//! crate (unlike IMAP's `imap-flow`, there's no POP3 equivalent in the
//! retrieval pack), in the manner SPEC_FULL §4.C calls for: "protocols
//! built on top of [Buffer] ... POP/SMTP/ManageSieve line commands".
//! Message retrieval is backed by the same `pv_collections::mail::session`
//! the IMAP front-end uses — POP3 is just a narrower view over one mailbox
//! (the teacher has no POP3 front-end at all; this module is grounded on
//! the shared `Session`/`User` API the IMAP `command` modules already use,
//! generalized to POP3's command set).

mod command;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use futures::stream::{FuturesUnordered, StreamExt};
use sqlx::PgPool;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use pv_collections::mail::namespace::INBOX;
use pv_collections::mail::registry::MailboxRegistry;
use pv_collections::mail::session::Session;
use pv_collections::user::User;
use pv_user::config::Pop3Config;
use pv_user::login::ArcLoginProvider;

use crate::buffer::Buffer;
use crate::tls::MaybeTlsStream;

const MAX_LINE: usize = 2048;
const GREETING: &str = "+OK passerine POP3 server ready\r\n";

pub struct Server {
    bind_addr: SocketAddr,
    login_provider: ArcLoginProvider,
    pool: PgPool,
    registry: MailboxRegistry,
    tls: Option<TlsAcceptor>,
}

pub fn new(
    config: Pop3Config,
    login: ArcLoginProvider,
    pool: PgPool,
    registry: MailboxRegistry,
) -> Result<Server> {
    let tls = match (config.certs, config.key) {
        (Some(certs), Some(key)) => Some(crate::tls::load_acceptor(&certs, &key)?),
        _ => None,
    };
    Ok(Server {
        bind_addr: config.bind_addr,
        login_provider: login,
        pool,
        registry,
        tls,
    })
}

impl Server {
    pub async fn run(self, mut must_exit: watch::Receiver<bool>) -> Result<()> {
        let tcp = TcpListener::bind(self.bind_addr).await?;
        tracing::info!("POP3 server listening on {:#}", self.bind_addr);

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
            tracing::info!("POP3: accepted connection from {}", remote_addr);
            let this = this.clone();
            connections.push(tokio::spawn(async move {
                if let Err(e) = this.handle(socket, remote_addr).await {
                    tracing::error!(addr=?remote_addr, err=?e, "POP3 connection ended with error");
                }
            }));
        }
        drop(tcp);

        tracing::info!("POP3 server shutting down, draining remaining connections...");
        while connections.next().await.is_some() {}

        Ok(())
    }

    async fn handle(&self, socket: tokio::net::TcpStream, addr: SocketAddr) -> Result<()> {
        let mut stream = MaybeTlsStream::Plain(socket);
        stream.write_all(GREETING.as_bytes()).await?;

        let mut buf = Buffer::new();
        let mut rbuf = [0u8; 4096];
        let mut conn = command::Connection::new(addr, self.login_provider.clone(), self.pool.clone(), self.registry.clone());

        loop {
            let line = loop {
                match buf.remove_line(MAX_LINE) {
                    Ok(Some(line)) => break Some(line),
                    Ok(None) => {}
                    Err(_) => {
                        let _ = stream.write_all(b"-ERR line too long\r\n").await;
                        return Ok(());
                    }
                }
                let n = stream.read(&mut rbuf).await?;
                if n == 0 {
                    return Ok(());
                }
                buf.append(&rbuf[..n]);
            };
            let Some(line) = line else { continue };

            let outcome = conn.dispatch(&line).await;
            stream.write_all(&outcome.response).await?;
            match outcome.action {
                command::Action::Continue => {}
                command::Action::StartTls => {
                    let Some(tls) = self.tls.clone() else {
                        continue;
                    };
                    let MaybeTlsStream::Plain(plain) = stream else {
                        continue;
                    };
                    let tls_stream = tls.accept(plain).await?;
                    stream = MaybeTlsStream::Tls(Box::new(tls_stream));
                    buf = Buffer::new();
                }
                command::Action::Close => return Ok(()),
            }
        }
    }
}

/// Lazily opened mailbox view plus the POP3-local "message number" mapping
/// and deletion marks (RFC 1939 §5: numbers stay stable for the session
/// even once a message is `DELE`d, only vanishing after `QUIT`).
pub(crate) struct Mailbox {
    pub session: Session,
    pub order: Vec<pv_db::ImapUid>,
    pub deleted: std::collections::HashSet<usize>,
}

impl Mailbox {
    pub async fn open(user: &User) -> sqlx::Result<Option<Self>> {
        let Some(session) = user.open_session(INBOX, false).await? else {
            return Ok(None);
        };
        let order = (1..=session.exists())
            .filter_map(|msn| session.uid(msn))
            .collect();
        Ok(Some(Self {
            session,
            order,
            deleted: std::collections::HashSet::new(),
        }))
    }

    pub fn live_indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.order.len()).filter(|i| !self.deleted.contains(i))
    }

    pub fn uid_for(&self, msg_number: usize) -> Option<(usize, pv_db::ImapUid)> {
        if msg_number == 0 {
            return None;
        }
        let idx = msg_number - 1;
        if self.deleted.contains(&idx) {
            return None;
        }
        self.order.get(idx).map(|u| (idx, *u))
    }
}
