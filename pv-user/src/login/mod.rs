//! Identity verification: turns `(username, password)` into a
//! [`Credentials`] the caller can trust, without knowing anything about
//! mailboxes or storage (that's `pv_collections::user::User`'s job).

pub mod ldap_provider;
pub mod static_provider;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

pub type ArcLoginProvider = Arc<dyn LoginProvider + Send + Sync>;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
}

#[async_trait]
pub trait LoginProvider {
    async fn login(&self, username: &str, password: &str) -> Result<Credentials>;
}
