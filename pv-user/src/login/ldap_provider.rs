//! Authenticates against an external directory by binding as the user,
//! per the teacher's `LoginLdapConfig` schema (search then bind).

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use ldap3::{LdapConnAsync, Scope, SearchEntry};

use crate::config::LoginLdapConfig;
use crate::login::{Credentials, LoginProvider};

pub struct LdapLoginProvider {
    config: LoginLdapConfig,
}

impl LdapLoginProvider {
    pub fn new(config: LoginLdapConfig) -> Self {
        Self { config }
    }

    async fn find_dn(&self, username: &str) -> Result<String> {
        let (conn, mut ldap) = LdapConnAsync::new(&self.config.ldap_server).await?;
        ldap3::drive!(conn);

        if let (Some(dn), Some(pw)) = (&self.config.bind_dn, &self.config.bind_password) {
            ldap.simple_bind(dn, pw).await?.success()?;
        }

        let (entries, _) = ldap
            .search(
                &self.config.search_base,
                Scope::Subtree,
                &format!("({}={})", self.config.username_attr, ldap3::ldap_escape(username)),
                vec![self.config.username_attr.as_str()],
            )
            .await?
            .success()?;

        let entry = entries
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("user {} not found in directory", username))?;
        Ok(SearchEntry::construct(entry).dn)
    }
}

#[async_trait]
impl LoginProvider for LdapLoginProvider {
    async fn login(&self, username: &str, password: &str) -> Result<Credentials> {
        let dn = self.find_dn(username).await.context("ldap search")?;

        let (conn, mut ldap) = LdapConnAsync::new(&self.config.ldap_server).await?;
        ldap3::drive!(conn);
        let bind = ldap.simple_bind(&dn, password).await?;
        if bind.rc != 0 {
            bail!("invalid credentials for {}", username);
        }
        let _ = ldap.unbind().await;

        Ok(Credentials {
            username: username.to_string(),
        })
    }
}
