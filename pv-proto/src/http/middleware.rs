//! HTTP Basic auth, grounded on `aero-proto/src/dav/middleware.rs` — same
//! header parsing, same `login_provider.login` call, generalized from a
//! `User::new(username, creds).await?` that loaded an encrypted storage
//! profile to the SQL-backed `pv_collections::user::User` constructor
//! (synchronous, no per-user crypto root to open).

use std::sync::Arc;

use anyhow::{anyhow, Result};
use base64::Engine;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use serde::Serialize;
use sqlx::PgPool;

use pv_collections::mail::registry::MailboxRegistry;
use pv_collections::user::User;
use pv_user::login::ArcLoginProvider;

pub(super) type ArcUser = Arc<User>;
pub(super) type ResponseBody = Response<BoxBody<Bytes, std::io::Error>>;
type RouteFuture<'a> = futures::future::BoxFuture<'a, Result<ResponseBody>>;

pub(super) fn text_status(status: u16, msg: &str) -> ResponseBody {
    Response::builder()
        .status(status)
        .body(BoxBody::new(Full::new(Bytes::from(msg.to_string())).map_err(|e| match e {})))
        .expect("static response is always well-formed")
}

pub(super) fn json_body<T: Serialize>(status: u16, value: &T) -> ResponseBody {
    match serde_json::to_vec(value) {
        Ok(bytes) => Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(BoxBody::new(Full::new(Bytes::from(bytes)).map_err(|e| match e {})))
            .expect("static response is always well-formed"),
        Err(e) => text_status(500, &format!("could not serialize response: {e}")),
    }
}

pub(super) async fn authenticate<'a>(
    login: ArcLoginProvider,
    pool: PgPool,
    registry: MailboxRegistry,
    req: Request<Incoming>,
    next: impl Fn(ArcUser, Request<Incoming>) -> RouteFuture<'a>,
) -> Result<ResponseBody> {
    let auth_val = match req.headers().get(hyper::header::AUTHORIZATION) {
        Some(hv) => hv.to_str()?.to_string(),
        None => {
            return Ok(Response::builder()
                .status(401)
                .header("WWW-Authenticate", "Basic realm=\"passerine\"")
                .body(BoxBody::new(Full::new(Bytes::from("Missing Authorization field")).map_err(|e| match e {})))?);
        }
    };

    let b64 = match auth_val.split_once(' ') {
        Some(("Basic", b64)) => b64,
        _ => return Ok(text_status(400, "Unsupported Authorization field")),
    };
    let decoded = base64::engine::general_purpose::STANDARD_NO_PAD.decode(b64.trim_end_matches('='))?;
    let creds_str = std::str::from_utf8(&decoded)?;
    let (username, password) = creds_str
        .split_once(':')
        .ok_or_else(|| anyhow!("Authorization value has no colon separator"))?;

    let creds = match login.login(username, password).await {
        Ok(c) => c,
        Err(_) => {
            tracing::info!(user = username, "HTTP archive: wrong credentials");
            return Ok(Response::builder()
                .status(401)
                .header("WWW-Authenticate", "Basic realm=\"passerine\"")
                .body(BoxBody::new(Full::new(Bytes::from("Wrong credentials")).map_err(|e| match e {})))?);
        }
    };

    next(User::new(creds.username, pool, registry), req).await
}
