use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::watch;

use crate::config::*;
use crate::login::{Credentials, LoginProvider};

struct ContextualUserEntry {
    username: String,
    config: UserEntry,
}

#[derive(Default)]
struct UserDatabase {
    users: HashMap<String, Arc<ContextualUserEntry>>,
}

/// Loads `user_list` once at startup. Re-reading on SIGUSR1 is left to the
/// teacher's operational playbook; the static file is considered the source
/// of truth for each process lifetime.
pub struct StaticLoginProvider {
    user_db: watch::Receiver<UserDatabase>,
}

impl StaticLoginProvider {
    pub async fn new(config: LoginStaticConfig) -> Result<Self> {
        let users = Self::load(&config.user_list)?;
        let (_tx, rx) = watch::channel(users);
        Ok(Self { user_db: rx })
    }

    fn load(path: &PathBuf) -> Result<UserDatabase> {
        let ulist: UserList = read_config(path.clone()).context("loading user list")?;
        let users = ulist
            .into_iter()
            .map(|(username, config)| {
                (
                    username.clone(),
                    Arc::new(ContextualUserEntry { username, config }),
                )
            })
            .collect();
        tracing::info!(count = %users.len(), "user list loaded");
        Ok(UserDatabase { users })
    }
}

#[async_trait]
impl LoginProvider for StaticLoginProvider {
    async fn login(&self, username: &str, password: &str) -> Result<Credentials> {
        tracing::debug!(user = %username, "login");
        let user = {
            let user_db = self.user_db.borrow();
            match user_db.users.get(username) {
                None => bail!("User {} does not exist", username),
                Some(u) => u.clone(),
            }
        };

        if !verify_password(password, &user.config.password)? {
            bail!("Wrong password");
        }

        Ok(Credentials {
            username: user.username.clone(),
        })
    }
}

pub fn hash_password(password: &str) -> Result<String> {
    use argon2::{
        password_hash::{rand_core::OsRng, PasswordHasher, SaltString},
        Argon2,
    };
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    Ok(argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Argon2 error: {}", e))?
        .to_string())
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    use argon2::{
        password_hash::{PasswordHash, PasswordVerifier},
        Argon2,
    };
    let parsed_hash =
        PasswordHash::new(hash).map_err(|e| anyhow::anyhow!("Invalid hashed password: {}", e))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_roundtrip() {
        let hash = hash_password("hunter2").unwrap();
        assert!(verify_password("hunter2", &hash).unwrap());
        assert!(!verify_password("wrong", &hash).unwrap());
    }
}
