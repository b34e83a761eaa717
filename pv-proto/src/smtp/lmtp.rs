//! LMTP delivery (RFC 2033): the only inbound door for mail handed off by
//! an upstream MTA. Trusts the transport the way the teacher's old
//! `src/lmtp.rs` did (no SASL handshake — the peer is assumed to be an
//! internal relay), but resolves recipients against the `aliases` table
//! instead of a per-user crypto-root lookup, and persists through
//! [`pv_collections::mail::injector::inject`] instead of an S3 PUT.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use duplexify::Duplex;
use futures::{io, stream, stream::FuturesUnordered, AsyncRead, AsyncReadExt, AsyncWrite, StreamExt};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::watch;
use tokio_util::compat::*;

use smtp_message::{Email, EscapedDataReader, Reply, ReplyCode};
use smtp_server::{reply, Config, ConnectionMetadata, Decision, MailMetadata};

use pv_collections::mail::injector::{self, Envelope};
use pv_collections::mail::message::Message;
use pv_collections::mail::names::AddressKey;
use pv_collections::mail::registry::MailboxRegistry;
use pv_collections::mail::IMF;
use pv_collections::user::User;
use pv_db::MailboxId;
use pv_user::config::LmtpConfig;

pub struct LmtpServer {
    bind_addr: SocketAddr,
    hostname: String,
    pool: PgPool,
    registry: MailboxRegistry,
}

impl LmtpServer {
    pub fn new(config: LmtpConfig, pool: PgPool, registry: MailboxRegistry) -> Arc<Self> {
        Arc::new(Self {
            bind_addr: config.bind_addr,
            hostname: config.hostname,
            pool,
            registry,
        })
    }

    pub async fn run(self: &Arc<Self>, mut must_exit: watch::Receiver<bool>) -> Result<()> {
        let tcp = TcpListener::bind(self.bind_addr).await?;
        tracing::info!("LMTP server listening on {:#}", self.bind_addr);

        let mut connections = FuturesUnordered::new();

        while !*must_exit.borrow() {
            let wait_conn_finished = async {
                if connections.is_empty() {
                    futures::future::pending().await
                } else {
                    connections.next().await
                }
            };
            let (socket, remote_addr) = select! {
                a = tcp.accept() => a?,
                _ = wait_conn_finished => continue,
                _ = must_exit.changed() => continue,
            };
            tracing::info!("LMTP: accepted connection from {}", remote_addr);

            let conn = tokio::spawn(smtp_server::interact(
                socket.compat(),
                smtp_server::IsAlreadyTls::No,
                Conn { remote_addr },
                self.clone(),
            ));

            connections.push(conn);
        }
        drop(tcp);

        tracing::info!("LMTP server shutting down, draining remaining connections...");
        while connections.next().await.is_some() {}

        Ok(())
    }

}

pub struct Conn {
    remote_addr: SocketAddr,
}

#[derive(Default)]
pub struct Message2 {
    sender: Option<String>,
    targets: Vec<MailboxId>,
    recipients: Vec<AddressKey>,
}

#[async_trait]
impl Config for LmtpServer {
    type Protocol = smtp_server::protocol::Lmtp;

    type ConnectionUserMeta = Conn;
    type MailUserMeta = Message2;

    fn hostname(&self, _conn_meta: &ConnectionMetadata<Conn>) -> &str {
        &self.hostname
    }

    async fn new_mail(&self, _conn_meta: &mut ConnectionMetadata<Conn>) -> Message2 {
        Message2::default()
    }

    async fn tls_accept<IO>(
        &self,
        _io: IO,
        _conn_meta: &mut ConnectionMetadata<Conn>,
    ) -> io::Result<Duplex<Pin<Box<dyn Send + AsyncRead>>, Pin<Box<dyn Send + AsyncWrite>>>>
    where
        IO: Send + AsyncRead + AsyncWrite,
    {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "TLS not implemented for LMTP server",
        ))
    }

    async fn filter_from(
        &self,
        from: Option<Email>,
        meta: &mut MailMetadata<Message2>,
        _conn_meta: &mut ConnectionMetadata<Conn>,
    ) -> Decision<Option<Email>> {
        meta.user.sender = from.as_ref().map(|e| match e.hostname.as_ref() {
            Some(h) => format!("{}@{}", e.localpart, h),
            None => e.localpart.to_string(),
        });
        Decision::Accept {
            reply: reply::okay_from().convert(),
            res: from,
        }
    }

    async fn filter_to(
        &self,
        to: Email,
        meta: &mut MailMetadata<Message2>,
        _conn_meta: &mut ConnectionMetadata<Conn>,
    ) -> Decision<Email> {
        let to_str = match to.hostname.as_ref() {
            Some(h) => format!("{}@{}", to.localpart, h),
            None => to.localpart.to_string(),
        };
        match super::resolve_recipient(&self.pool, &self.registry, &to_str).await {
            Ok(Some((owner, mailbox_path))) => {
                let user = User::new(owner.clone(), self.pool.clone(), self.registry.clone());
                match user.open_mailbox(&mailbox_path).await {
                    Ok(Some(handle)) => {
                        meta.user.targets.push(handle.id);
                        let (localpart, domain) = split_address(&to_str);
                        meta.user.recipients.push(AddressKey {
                            localpart,
                            domain,
                            name: String::new(),
                        });
                        Decision::Accept {
                            reply: reply::okay_to().convert(),
                            res: to,
                        }
                    }
                    _ => reject(&format!("no such mailbox for {to_str}")),
                }
            }
            Ok(None) => reject(&format!("unknown recipient {to_str}")),
            Err(e) => reject(&format!("lookup failed: {e}")),
        }
    }

    async fn handle_mail<'resp, R>(
        &'resp self,
        reader: &mut EscapedDataReader<'_, R>,
        meta: MailMetadata<Message2>,
        _conn_meta: &'resp mut ConnectionMetadata<Conn>,
    ) -> Pin<Box<dyn futures::Stream<Item = Decision<()>> + Send + 'resp>>
    where
        R: Send + Unpin + AsyncRead,
    {
        let num_recipients = meta.user.targets.len();
        let reject_all = |msg: String| {
            Box::pin(stream::iter(0..num_recipients).map(move |_| Decision::Reject {
                reply: Reply {
                    code: ReplyCode::POLICY_REASON,
                    ecode: None,
                    text: vec![smtp_message::MaybeUtf8::Utf8(msg.clone())],
                },
            })) as Pin<Box<dyn futures::Stream<Item = Decision<()>> + Send>>
        };

        let mut bytes = Vec::new();
        if reader.read_to_end(&mut bytes).await.is_err() {
            return reject_all("io error".into());
        }
        reader.complete();

        let imf = match IMF::try_from(bytes.as_slice()) {
            Ok(imf) => imf,
            Err(_) => return reject_all("could not parse message".into()),
        };
        let parsed = Message::from_imf(&imf, bytes.len() as i64);

        let caches = injector::Caches {
            field_names: self.registry.field_names(),
            flags: self.registry.flags(),
            addresses: self.registry.addresses(),
        };
        let envelope = Envelope {
            sender: meta.user.sender.clone().unwrap_or_default(),
            recipients: meta.user.recipients.clone(),
        };

        match injector::inject(
            &self.pool,
            caches,
            &self.registry,
            &parsed,
            &meta.user.targets,
            &[],
            &[],
            Some(&envelope),
        )
        .await
        {
            Ok(_report) => Box::pin(stream::iter(0..num_recipients).map(|_| Decision::Accept {
                reply: reply::okay_mail().convert(),
                res: (),
            })),
            Err(e) => reject_all(format!("delivery failed: {e}")),
        }
    }
}

fn split_address(address: &str) -> (String, String) {
    match address.split_once('@') {
        Some((l, d)) => (l.to_string(), d.to_string()),
        None => (address.to_string(), String::new()),
    }
}

fn reject(msg: &str) -> Decision<Email> {
    Decision::Reject {
        reply: Reply {
            code: ReplyCode::POLICY_REASON,
            ecode: None,
            text: vec![smtp_message::MaybeUtf8::Utf8(msg.to_string())],
        },
    }
}
