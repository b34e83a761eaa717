//! Read-only HTTP archive (SPEC §6): `GET /mailbox/{path}` lists a
//! mailbox's messages, `GET /mailbox/{path}/{uid}` returns one. Rendering
//! (to HTML, to a MIME viewer, ...) is explicitly out of scope — this
//! module hands back the raw session-level view as JSON and lets a
//! front-end client do the rendering.
//!
//! Grounded on the teacher's `aero-proto/src/dav` hyper server: the same
//! `http1::Builder` + `service_fn` accept loop, the same Basic-auth
//! middleware shape (`aero-proto/src/dav/middleware.rs`), generalized from
//! CalDAV's WebDAV method dispatch to two plain `GET` routes. Unlike DAV,
//! this listener never terminates TLS itself — it is meant to sit behind
//! the same reverse proxy a production deployment already needs for
//! browser-facing traffic.

mod middleware;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use futures::stream::{FuturesUnordered, StreamExt};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::sync::watch;

use pv_collections::mail::registry::MailboxRegistry;
use pv_db::ImapUid;
use pv_user::config::HttpConfig;
use pv_user::login::ArcLoginProvider;

use middleware::{json_body, text_status, ArcUser, ResponseBody};

pub struct Server {
    bind_addr: SocketAddr,
    login_provider: ArcLoginProvider,
    pool: PgPool,
    registry: MailboxRegistry,
}

pub fn new(config: HttpConfig, login_provider: ArcLoginProvider, pool: PgPool, registry: MailboxRegistry) -> Server {
    Server {
        bind_addr: config.bind_addr,
        login_provider,
        pool,
        registry,
    }
}

impl Server {
    pub async fn run(self, mut must_exit: watch::Receiver<bool>) -> Result<()> {
        let tcp = TcpListener::bind(self.bind_addr).await?;
        tracing::info!("HTTP archive server listening on {:#}", self.bind_addr);

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
            tracing::info!("HTTP: accepted connection from {}", remote_addr);

            let login = this.login_provider.clone();
            let pool = this.pool.clone();
            let registry = this.registry.clone();
            let conn = tokio::spawn(async move {
                let stream = TokioIo::new(socket);
                let result = http1::Builder::new()
                    .serve_connection(
                        stream,
                        service_fn(move |req: Request<Incoming>| {
                            let login = login.clone();
                            let pool = pool.clone();
                            let registry = registry.clone();
                            async move {
                                let route_pool = pool.clone();
                                let route_registry = registry.clone();
                                middleware::authenticate(login, pool, registry, req, move |user, req| {
                                    Box::pin(route(user, route_pool.clone(), route_registry.clone(), req))
                                })
                                .await
                            }
                        }),
                    )
                    .await;
                if let Err(e) = result {
                    tracing::warn!(err=?e, "HTTP connection failed");
                }
            });
            connections.push(conn);
        }
        drop(tcp);

        tracing::info!("HTTP archive server shutting down, draining remaining connections...");
        while connections.next().await.is_some() {}

        Ok(())
    }
}

#[derive(Serialize)]
struct MessageSummary {
    msn: usize,
    uid: u32,
    flags: Vec<String>,
    size: Option<i64>,
}

#[derive(Serialize)]
struct MailboxListing {
    path: String,
    exists: usize,
    messages: Vec<MessageSummary>,
}

#[derive(Serialize)]
struct MailView {
    uid: u32,
    flags: Vec<String>,
    size: Option<i64>,
    body: String,
}

async fn route(user: ArcUser, pool: PgPool, registry: MailboxRegistry, req: Request<Incoming>) -> Result<ResponseBody> {
    let _ = (pool, registry); // session is opened through `user`, which already owns both handles
    if req.method() != hyper::Method::GET {
        return Ok(text_status(405, "method not allowed"));
    }
    let path = req.uri().path().to_string();
    let Some(tail) = path.strip_prefix("/mailbox/") else {
        return Ok(text_status(404, "not found"));
    };

    let (mailbox_path, uid) = split_tail(tail);
    let Ok(Some(mut session)) = user.open_session(&mailbox_path, true).await else {
        return Ok(text_status(404, "no such mailbox"));
    };

    match uid {
        None => {
            let mut messages = Vec::new();
            for msn in 1..=session.exists() {
                let Some(uid) = session.uid(msn) else { continue };
                let size = session.message_size(uid).await.ok().flatten();
                messages.push(MessageSummary {
                    msn,
                    uid: uid.get(),
                    flags: session.flags(uid),
                    size,
                });
            }
            let listing = MailboxListing {
                path: mailbox_path,
                exists: session.exists(),
                messages,
            };
            Ok(json_body(200, &listing))
        }
        Some(uid_num) => {
            let Some(uid) = ImapUid::new(uid_num) else {
                return Ok(text_status(400, "invalid uid"));
            };
            let Some(body) = session.message_body(uid).await.ok().flatten() else {
                return Ok(text_status(404, "no such message"));
            };
            let size = session.message_size(uid).await.ok().flatten();
            let view = MailView {
                uid: uid.get(),
                flags: session.flags(uid),
                size,
                body: String::from_utf8_lossy(&body).into_owned(),
            };
            Ok(json_body(200, &view))
        }
    }
}

/// `/mailbox/Work/Projects/42` is ambiguous between a three-level mailbox
/// path and a two-level one with a trailing uid — the last segment decides:
/// if it parses as a uid number, it's a single-message request.
fn split_tail(tail: &str) -> (String, Option<u32>) {
    let trimmed = tail.trim_end_matches('/');
    if let Some((head, last)) = trimmed.rsplit_once('/') {
        if let Ok(n) = last.parse::<u32>() {
            return (head.to_string(), Some(n));
        }
    } else if let Ok(n) = trimmed.parse::<u32>() {
        return (String::new(), Some(n));
    }
    (trimmed.to_string(), None)
}
