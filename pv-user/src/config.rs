//! On-disk configuration for account identity and the protocol listeners.
//!
//! Grounded on the teacher's root `config.rs` (`ImapConfig`, `LoginStaticUser`,
//! `LoginLdapConfig`, `UserEntry`), trimmed of the `storage_driver` /
//! K2V-garage fields that had no SPEC_FULL counterpart (message storage is
//! SQL-backed now, not a per-user encrypted object store).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub type UserList = HashMap<String, UserEntry>;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UserEntry {
    #[serde(default)]
    pub email_addresses: Vec<String>,
    pub password: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoginStaticConfig {
    pub user_list: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoginLdapConfig {
    pub ldap_server: String,
    #[serde(default)]
    pub pre_bind_on_login: bool,
    pub bind_dn: Option<String>,
    pub bind_password: Option<String>,
    pub search_base: String,
    pub username_attr: String,
    #[serde(default = "default_mail_attr")]
    pub mail_attr: String,
    pub user_secret_attr: String,
}

fn default_mail_attr() -> String {
    "mail".into()
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ImapConfig {
    pub bind_addr: SocketAddr,
    pub certs: PathBuf,
    pub key: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ImapUnsecureConfig {
    pub bind_addr: SocketAddr,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Pop3Config {
    pub bind_addr: SocketAddr,
    pub certs: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LmtpConfig {
    pub bind_addr: SocketAddr,
    pub hostname: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SmtpConfig {
    pub bind_addr: SocketAddr,
    pub hostname: String,
    pub certs: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ManagesieveConfig {
    pub bind_addr: SocketAddr,
    pub certs: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HttpConfig {
    pub bind_addr: SocketAddr,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

/// Top-level daemon configuration: one section per protocol listener plus
/// the identity backend, mirroring the teacher's `ProviderConfig` but with
/// `storage`/K2V/crypto-root sections replaced by a single `database`
/// section (message bodies now live in SQL, not a per-user encrypted blob
/// store).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProviderConfig {
    pub pid: Option<String>,
    pub database: DbConfig,
    pub imap: Option<ImapConfig>,
    pub imap_unsecure: Option<ImapUnsecureConfig>,
    pub pop3: Option<Pop3Config>,
    pub lmtp: Option<LmtpConfig>,
    pub smtp: Option<SmtpConfig>,
    pub managesieve: Option<ManagesieveConfig>,
    pub http: Option<HttpConfig>,
    pub users: UserManagement,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "user_driver")]
pub enum UserManagement {
    Static(LoginStaticConfig),
    Ldap(LoginLdapConfig),
}

pub fn read_config<T: serde::de::DeserializeOwned>(path: PathBuf) -> Result<T> {
    let raw = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&raw)?)
}
