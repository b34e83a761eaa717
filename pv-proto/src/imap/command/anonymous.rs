//! Commands legal before authentication (RFC 3501 §6.1): CAPABILITY,
//! LOGOUT, LOGIN and AUTHENTICATE PLAIN (RFC 4959's AUTH= advertised
//! capability maps straight to this).

use anyhow::Result;
use imap_codec::imap_types::auth::AuthMechanism;
use imap_codec::imap_types::command::CommandBody;
use imap_codec::imap_types::core::AString;
use sqlx::PgPool;

use pv_collections::mail::registry::MailboxRegistry;
use pv_collections::user::User;
use pv_user::login::ArcLoginProvider;

use super::anystate;
use crate::imap::capability::ServerCapability;
use crate::imap::flow;
use crate::imap::response::Response;

pub struct AnonymousContext<'a> {
    pub req: &'a imap_codec::imap_types::command::Command<'static>,
    pub login_provider: &'a ArcLoginProvider,
    pub server_capabilities: &'a ServerCapability,
    pub pool: &'a PgPool,
    pub registry: &'a MailboxRegistry,
}

pub async fn dispatch<'a>(
    ctx: AnonymousContext<'a>,
) -> Result<(Response<'static>, flow::Transition)> {
    match &ctx.req.body {
        CommandBody::Capability => {
            anystate::capability(ctx.req.tag.clone(), ctx.server_capabilities)
        }
        CommandBody::Logout => anystate::logout(),
        CommandBody::Login { username, password } => {
            login(&ctx, username.clone(), password.clone()).await
        }
        // PLAIN is the only SASL mechanism this server advertises; the
        // initial response carries `\0authzid\0authcid\0password`.
        CommandBody::Authenticate {
            mechanism: AuthMechanism::Plain,
            initial_response,
        } => authenticate_plain(&ctx, initial_response.as_ref().map(|s| s.declassify().to_vec())).await,
        CommandBody::Authenticate { .. } => Ok((
            Response::build()
                .tag(ctx.req.tag.clone())
                .message("Unsupported SASL mechanism")
                .no()?,
            flow::Transition::None,
        )),
        _ => anystate::wrong_state(ctx.req.tag.clone()),
    }
}

async fn login<'a>(
    ctx: &AnonymousContext<'a>,
    username: AString<'static>,
    password: AString<'static>,
) -> Result<(Response<'static>, flow::Transition)> {
    let u = String::from_utf8(username.as_ref().to_vec())?;
    let p = String::from_utf8(password.as_ref().to_vec())?;
    authenticate(ctx, &u, &p).await
}

async fn authenticate_plain<'a>(
    ctx: &AnonymousContext<'a>,
    initial_response: Option<Vec<u8>>,
) -> Result<(Response<'static>, flow::Transition)> {
    let Some(blob) = initial_response else {
        return Ok((
            Response::build()
                .tag(ctx.req.tag.clone())
                .message("AUTHENTICATE with a continuation response is not supported, send the initial response")
                .bad()?,
            flow::Transition::None,
        ));
    };
    let mut parts = blob.split(|b| *b == 0);
    let _authzid = parts.next();
    let authcid = parts.next().unwrap_or(&[]);
    let passwd = parts.next().unwrap_or(&[]);
    let u = String::from_utf8_lossy(authcid).into_owned();
    let p = String::from_utf8_lossy(passwd).into_owned();
    authenticate(ctx, &u, &p).await
}

async fn authenticate<'a>(
    ctx: &AnonymousContext<'a>,
    username: &str,
    password: &str,
) -> Result<(Response<'static>, flow::Transition)> {
    tracing::info!(user = %username, "command.login");

    let creds = match ctx.login_provider.login(username, password).await {
        Err(e) => {
            tracing::debug!(error = %e, "authentication failed");
            return Ok((
                Response::build()
                    .tag(ctx.req.tag.clone())
                    .message("Authentication failed")
                    .no()?,
                flow::Transition::None,
            ));
        }
        Ok(c) => c,
    };

    let user = User::new(creds.username.clone(), ctx.pool.clone(), ctx.registry.clone());
    user.ensure_defaults().await?;

    tracing::info!(username = %username, "connected");
    Ok((
        Response::build()
            .tag(ctx.req.tag.clone())
            .message("completed")
            .ok()?,
        flow::Transition::Authenticate(user),
    ))
}
