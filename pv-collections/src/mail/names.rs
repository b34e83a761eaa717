//! Name caches (SPEC §4.D): field names, flags and addresses each
//! deduplicate a string key to a small integer id, with insert-if-absent
//! semantics that converge two racing writers on the same id (invariant 3).
//!
//! Grounded on `original_source/message/fieldcache.cpp`'s two-statement
//! pattern (insert-missing, then select), translated into `sqlx` queries run
//! inside the caller's transaction so the insert and the select that
//! recovers the id are part of the same atomic unit of work.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::Postgres;
use tokio::sync::RwLock;

use pv_db::{AddressId, FieldNameId, FlagId};

/// Generic in-memory front for a `(name) -> id` SQL dedup table. Bounded
/// only by the lifetime of the process — entries are never evicted, which
/// is fine since field names, flag names and addresses are a small,
/// slow-growing universe compared to message volume.
#[derive(Clone)]
pub struct DedupCache<Id> {
    inner: Arc<RwLock<HashMap<String, Id>>>,
}

impl<Id: Copy> DedupCache<Id> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Seeds the cache from an externally-known id, e.g. a row loaded by
    /// some other query. Last writer wins; races are harmless because a
    /// name always maps to a unique id once committed in SQL.
    pub async fn insert(&self, key: impl Into<String>, id: Id) {
        self.inner.write().await.insert(key.into(), id);
    }

    pub async fn translate(&self, key: &str) -> Option<Id> {
        self.inner.read().await.get(key).copied()
    }
}

impl<Id: Copy> Default for DedupCache<Id> {
    fn default() -> Self {
        Self::new()
    }
}

pub type FieldNameCache = DedupCache<FieldNameId>;
pub type FlagCache = DedupCache<FlagId>;
pub type AddressCache = DedupCache<AddressId>;

/// `lookup`: for every name in `names` not already cached, runs
/// insert-if-absent then select inside `txn`, and populates the cache.
/// After this returns, every name in `names` has a non-zero id (invariant
/// 3): two concurrent lookups of the same new name converge on one id
/// because the insert is conditioned on "no row with that name exists" and
/// both racers then select the same (now-committed-or-committing) row.
pub async fn lookup_field_names(
    cache: &FieldNameCache,
    txn: &mut sqlx::Transaction<'_, Postgres>,
    names: &[String],
) -> sqlx::Result<()> {
    for name in names {
        if cache.translate(name).await.is_some() {
            continue;
        }
        sqlx::query("insert into field_names (name) select $1 where not exists (select 1 from field_names where lower(name) = lower($1))")
            .bind(name)
            .execute(&mut **txn)
            .await?;
        let id: i64 = sqlx::query_scalar("select id from field_names where lower(name) = lower($1)")
            .bind(name)
            .fetch_one(&mut **txn)
            .await?;
        cache.insert(name.clone(), FieldNameId(id)).await;
    }
    Ok(())
}

pub async fn lookup_flags(
    cache: &FlagCache,
    txn: &mut sqlx::Transaction<'_, Postgres>,
    names: &[String],
) -> sqlx::Result<()> {
    for name in names {
        if cache.translate(name).await.is_some() {
            continue;
        }
        let system = is_system_flag(name);
        sqlx::query(
            "insert into flags (name, \"system\") select $1, $2 where not exists (select 1 from flags where name = $1)",
        )
        .bind(name)
        .bind(system)
        .execute(&mut **txn)
        .await?;
        let id: i64 = sqlx::query_scalar("select id from flags where name = $1")
            .bind(name)
            .fetch_one(&mut **txn)
            .await?;
        cache.insert(name.clone(), FlagId(id)).await;
    }
    Ok(())
}

pub fn is_system_flag(name: &str) -> bool {
    matches!(
        name,
        "\\Seen" | "\\Deleted" | "\\Answered" | "\\Flagged" | "\\Draft" | "\\Recent"
    )
}

/// One resolved address, as understood by the address cache.
#[derive(Debug, Clone)]
pub struct AddressKey {
    pub localpart: String,
    pub domain: String,
    pub name: String,
}

impl AddressKey {
    fn cache_key(&self) -> String {
        format!(
            "{}@{}\u{0}{}",
            self.localpart.to_lowercase(),
            self.domain.to_lowercase(),
            self.name
        )
    }
}

/// Batches a whole message's worth of addresses into one
/// select+insert-missing+select round trip, matching spec §4.D's "one
/// combined select + insert-missing + select" contract for `resolve_many`.
pub async fn resolve_addresses(
    cache: &AddressCache,
    txn: &mut sqlx::Transaction<'_, Postgres>,
    addresses: &[AddressKey],
) -> sqlx::Result<Vec<AddressId>> {
    let mut ids = Vec::with_capacity(addresses.len());
    for addr in addresses {
        let key = addr.cache_key();
        if let Some(id) = cache.translate(&key).await {
            ids.push(id);
            continue;
        }
        sqlx::query(
            "insert into addresses (name, localpart, domain) \
             select $1, $2, $3 where not exists ( \
               select 1 from addresses \
               where lower(localpart) = lower($2) and lower(domain) = lower($3) and name = $1)",
        )
        .bind(&addr.name)
        .bind(&addr.localpart)
        .bind(&addr.domain)
        .execute(&mut **txn)
        .await?;
        let id: i64 = sqlx::query_scalar(
            "select id from addresses \
             where lower(localpart) = lower($1) and lower(domain) = lower($2) and name = $3",
        )
        .bind(&addr.localpart)
        .bind(&addr.domain)
        .bind(&addr.name)
        .fetch_one(&mut **txn)
        .await?;
        let address_id = AddressId(id);
        cache.insert(key, address_id).await;
        ids.push(address_id);
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_then_translate_is_idempotent() {
        let cache: FieldNameCache = DedupCache::new();
        cache.insert("Subject", FieldNameId(1)).await;
        cache.insert("Subject", FieldNameId(1)).await;
        assert_eq!(cache.translate("Subject").await, Some(FieldNameId(1)));
        assert_eq!(cache.translate("subject").await, None); // case-sensitive key, as documented
    }

    #[test]
    fn address_key_is_case_folded_on_localpart_and_domain_only() {
        let a = AddressKey {
            localpart: "Alice".into(),
            domain: "Example.COM".into(),
            name: "Alice A.".into(),
        };
        let b = AddressKey {
            localpart: "alice".into(),
            domain: "example.com".into(),
            name: "Alice A.".into(),
        };
        assert_eq!(a.cache_key(), b.cache_key());
    }
}
