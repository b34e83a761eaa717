//! Assembles the shared storage handles and spawns every configured
//! protocol listener, mirroring the teacher's `src/server.rs` /
//! `Server::from_provider_config` role but with one `Store`/`MailboxRegistry`
//! pair shared across listeners instead of a per-protocol mailstore.

use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::sync::watch;

use pv_collections::mail::registry::MailboxRegistry;
use pv_user::config::{ProviderConfig, UserManagement};
use pv_user::login::{ldap_provider::LdapLoginProvider, static_provider::StaticLoginProvider, ArcLoginProvider};

pub struct Server {
    config: ProviderConfig,
    store: pv_db::Store,
    registry: MailboxRegistry,
    login_provider: ArcLoginProvider,
}

impl Server {
    pub async fn from_provider_config(config: ProviderConfig) -> Result<Self> {
        let store = pv_db::Store::connect(&config.database.url, config.database.max_connections).await?;
        store.migrate().await?;
        let registry = MailboxRegistry::new();

        let login_provider: ArcLoginProvider = match &config.users {
            UserManagement::Static(static_config) => {
                Arc::new(StaticLoginProvider::new(static_config.clone()).await?)
            }
            UserManagement::Ldap(ldap_config) => Arc::new(LdapLoginProvider::new(ldap_config.clone())),
        };

        Ok(Self {
            config,
            store,
            registry,
            login_provider,
        })
    }

    pub async fn run(self) -> Result<()> {
        let (tx, rx) = watch::channel(false);
        let pool = self.store.pool().clone();
        let mut tasks = Vec::new();

        if let Some(imap) = self.config.imap.clone() {
            let server = pv_proto::imap::new(imap, self.login_provider.clone(), pool.clone(), self.registry.clone())?;
            tasks.push(tokio::spawn(server.run(rx.clone())));
        }
        if let Some(imap_unsecure) = self.config.imap_unsecure.clone() {
            let server =
                pv_proto::imap::new_unsecure(imap_unsecure, self.login_provider.clone(), pool.clone(), self.registry.clone());
            tasks.push(tokio::spawn(server.run(rx.clone())));
        }
        if let Some(pop3) = self.config.pop3.clone() {
            let server = pv_proto::pop3::new(pop3, self.login_provider.clone(), pool.clone(), self.registry.clone())?;
            tasks.push(tokio::spawn(server.run(rx.clone())));
        }
        if let Some(lmtp) = self.config.lmtp.clone() {
            let server = pv_proto::smtp::lmtp::LmtpServer::new(lmtp, pool.clone(), self.registry.clone());
            let rx = rx.clone();
            tasks.push(tokio::spawn(async move { server.run(rx).await }));
        }
        if let Some(smtp) = self.config.smtp.clone() {
            let server = pv_proto::smtp::submission::new(smtp, self.login_provider.clone(), pool.clone(), self.registry.clone())?;
            tasks.push(tokio::spawn(server.run(rx.clone())));
        }
        if let Some(managesieve) = self.config.managesieve.clone() {
            let server = pv_proto::managesieve::new(managesieve, self.login_provider.clone(), pool.clone())?;
            tasks.push(tokio::spawn(server.run(rx.clone())));
        }
        if let Some(http) = self.config.http.clone() {
            let server = pv_proto::http::new(http, self.login_provider.clone(), pool.clone(), self.registry.clone());
            tasks.push(tokio::spawn(server.run(rx.clone())));
        }

        if tasks.is_empty() {
            bail!("no protocol listener is configured, nothing to run");
        }

        if let Some(pid_path) = &self.config.pid {
            std::fs::write(pid_path, format!("{}", std::process::id()))?;
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received shutdown signal, stopping listeners");
            }
            _ = wait_sigterm() => {
                tracing::info!("received SIGTERM, stopping listeners");
            }
        }
        let _ = tx.send(true);

        for task in tasks {
            if let Err(e) = task.await? {
                tracing::error!(err=?e, "a protocol listener exited with an error");
            }
        }
        Ok(())
    }
}

async fn wait_sigterm() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sig) => {
            sig.recv().await;
        }
        Err(_) => futures::future::pending().await,
    }
}
