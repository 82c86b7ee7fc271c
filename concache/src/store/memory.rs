//! In-process fast store backed by `DashMap`.
//!
//! Each key maps to a slot holding a string, hash or list plus an optional
//! expiry instant. Expired slots are removed lazily when touched. Mutations
//! go through the `DashMap` entry API, which holds the shard lock for the
//! duration of the operation and makes each call atomic per key.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;

use super::{KeyStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Process-local [`KeyStore`] implementation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: DashMap<String, Slot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn purge_expired(&self, key: &str) {
        let now = Instant::now();
        self.data.remove_if(key, |_, slot| slot.is_expired(now));
    }

    fn wrong_type(key: &str) -> StoreError {
        StoreError::WrongType {
            key: key.to_string(),
        }
    }

    fn get_sync(&self, key: &str) -> StoreResult<Option<String>> {
        self.purge_expired(key);
        match self.data.get(key) {
            None => Ok(None),
            Some(slot) => match &slot.value {
                Value::Str(s) => Ok(Some(s.clone())),
                _ => Err(Self::wrong_type(key)),
            },
        }
    }

    fn set_sync(&self, key: &str, value: String, ttl: Option<Duration>) {
        let mut slot = Slot::new(Value::Str(value));
        slot.expires_at = ttl.map(|d| Instant::now() + d);
        self.data.insert(key.to_string(), slot);
    }

    fn setnx_sync(&self, key: &str, value: String) -> bool {
        self.purge_expired(key);
        match self.data.entry(key.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(Slot::new(Value::Str(value)));
                true
            }
        }
    }

    fn incr_sync(&self, key: &str, by: i64) -> StoreResult<i64> {
        self.purge_expired(key);
        let mut slot = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(Value::Str("0".to_string())));
        match &mut slot.value {
            Value::Str(s) => {
                let current: i64 = s
                    .parse()
                    .map_err(|_| StoreError::NotAnInteger(key.to_string()))?;
                let next = current
                    .checked_add(by)
                    .ok_or_else(|| StoreError::Overflow(key.to_string()))?;
                *s = next.to_string();
                Ok(next)
            }
            _ => Err(Self::wrong_type(key)),
        }
    }

    fn expire_sync(&self, key: &str, ttl: Duration) -> bool {
        self.purge_expired(key);
        match self.data.get_mut(key) {
            Some(mut slot) => {
                slot.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        }
    }

    fn ttl_sync(&self, key: &str) -> Option<Duration> {
        self.purge_expired(key);
        let now = Instant::now();
        self.data
            .get(key)
            .and_then(|slot| slot.expires_at.map(|at| at.saturating_duration_since(now)))
    }

    fn del_sync(&self, key: &str) -> bool {
        self.purge_expired(key);
        self.data.remove(key).is_some()
    }

    fn exists_sync(&self, key: &str) -> bool {
        self.purge_expired(key);
        self.data.contains_key(key)
    }

    fn rename_sync(&self, from: &str, to: &str) -> StoreResult<()> {
        self.purge_expired(from);
        let (_, slot) = self
            .data
            .remove(from)
            .ok_or_else(|| StoreError::NoSuchKey(from.to_string()))?;
        self.data.insert(to.to_string(), slot);
        Ok(())
    }

    fn hget_sync(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.purge_expired(key);
        match self.data.get(key) {
            None => Ok(None),
            Some(slot) => match &slot.value {
                Value::Hash(h) => Ok(h.get(field).cloned()),
                _ => Err(Self::wrong_type(key)),
            },
        }
    }

    fn hset_sync(&self, key: &str, field: &str, value: String, only_new: bool) -> StoreResult<bool> {
        self.purge_expired(key);
        let mut slot = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(Value::Hash(HashMap::new())));
        match &mut slot.value {
            Value::Hash(h) => {
                if only_new && h.contains_key(field) {
                    return Ok(false);
                }
                Ok(h.insert(field.to_string(), value).is_none())
            }
            _ => Err(Self::wrong_type(key)),
        }
    }

    /// Replaces an existing field if `accept` approves its current value.
    fn hreplace_sync(
        &self,
        key: &str,
        field: &str,
        value: String,
        accept: impl FnOnce(&str) -> bool,
    ) -> StoreResult<bool> {
        self.purge_expired(key);
        match self.data.get_mut(key) {
            None => Ok(false),
            Some(mut slot) => match &mut slot.value {
                Value::Hash(h) => match h.get_mut(field) {
                    Some(current) => {
                        if !accept(current.as_str()) {
                            return Ok(false);
                        }
                        *current = value;
                        Ok(true)
                    }
                    None => Ok(false),
                },
                _ => Err(Self::wrong_type(key)),
            },
        }
    }

    fn hgetall_sync(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.purge_expired(key);
        match self.data.get(key) {
            None => Ok(HashMap::new()),
            Some(slot) => match &slot.value {
                Value::Hash(h) => Ok(h.clone()),
                _ => Err(Self::wrong_type(key)),
            },
        }
    }

    fn hdel_sync(&self, key: &str, field: &str) -> StoreResult<bool> {
        self.purge_expired(key);
        let removed = match self.data.get_mut(key) {
            None => return Ok(false),
            Some(mut slot) => match &mut slot.value {
                Value::Hash(h) => h.remove(field).is_some(),
                _ => return Err(Self::wrong_type(key)),
            },
        };
        // empty hashes disappear like in a networked store
        self.data
            .remove_if(key, |_, slot| matches!(&slot.value, Value::Hash(h) if h.is_empty()));
        Ok(removed)
    }

    fn rpush_sync(&self, key: &str, value: String) -> StoreResult<usize> {
        self.purge_expired(key);
        let mut slot = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(Value::List(VecDeque::new())));
        match &mut slot.value {
            Value::List(l) => {
                l.push_back(value);
                Ok(l.len())
            }
            _ => Err(Self::wrong_type(key)),
        }
    }

    fn lrange_sync(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        self.purge_expired(key);
        let slot = match self.data.get(key) {
            None => return Ok(Vec::new()),
            Some(slot) => slot,
        };
        let list = match &slot.value {
            Value::List(l) => l,
            _ => return Err(Self::wrong_type(key)),
        };
        let len = list.len() as isize;
        let norm = |i: isize| if i < 0 { (len + i).max(0) } else { i };
        let (start, stop) = (norm(start), norm(stop).min(len - 1));
        if len == 0 || start > stop {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    fn llen_sync(&self, key: &str) -> StoreResult<usize> {
        self.purge_expired(key);
        match self.data.get(key) {
            None => Ok(0),
            Some(slot) => match &slot.value {
                Value::List(l) => Ok(l.len()),
                _ => Err(Self::wrong_type(key)),
            },
        }
    }
}

impl KeyStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Option<String>>> {
        Box::pin(async move { self.get_sync(key) })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.set_sync(key, value, ttl);
            Ok(())
        })
    }

    fn setnx<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, StoreResult<bool>> {
        Box::pin(async move { Ok(self.setnx_sync(key, value)) })
    }

    fn incr<'a>(&'a self, key: &'a str, by: i64) -> BoxFuture<'a, StoreResult<i64>> {
        Box::pin(async move { self.incr_sync(key, by) })
    }

    fn expire<'a>(&'a self, key: &'a str, ttl: Duration) -> BoxFuture<'a, StoreResult<bool>> {
        Box::pin(async move { Ok(self.expire_sync(key, ttl)) })
    }

    fn ttl<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Option<Duration>>> {
        Box::pin(async move { Ok(self.ttl_sync(key)) })
    }

    fn del<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<bool>> {
        Box::pin(async move { Ok(self.del_sync(key)) })
    }

    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<bool>> {
        Box::pin(async move { Ok(self.exists_sync(key)) })
    }

    fn rename<'a>(&'a self, from: &'a str, to: &'a str) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move { self.rename_sync(from, to) })
    }

    fn hget<'a>(
        &'a self,
        key: &'a str,
        field: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<String>>> {
        Box::pin(async move { self.hget_sync(key, field) })
    }

    fn hset<'a>(
        &'a self,
        key: &'a str,
        field: &'a str,
        value: String,
    ) -> BoxFuture<'a, StoreResult<bool>> {
        Box::pin(async move { self.hset_sync(key, field, value, false) })
    }

    fn hsetnx<'a>(
        &'a self,
        key: &'a str,
        field: &'a str,
        value: String,
    ) -> BoxFuture<'a, StoreResult<bool>> {
        Box::pin(async move { self.hset_sync(key, field, value, true) })
    }

    fn hset_existing<'a>(
        &'a self,
        key: &'a str,
        field: &'a str,
        value: String,
    ) -> BoxFuture<'a, StoreResult<bool>> {
        Box::pin(async move { self.hreplace_sync(key, field, value, |_| true) })
    }

    fn hcompare_and_set<'a>(
        &'a self,
        key: &'a str,
        field: &'a str,
        expected: &'a str,
        value: String,
    ) -> BoxFuture<'a, StoreResult<bool>> {
        Box::pin(async move { self.hreplace_sync(key, field, value, |current| current == expected) })
    }

    fn hgetall<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<HashMap<String, String>>> {
        Box::pin(async move { self.hgetall_sync(key) })
    }

    fn hdel<'a>(&'a self, key: &'a str, field: &'a str) -> BoxFuture<'a, StoreResult<bool>> {
        Box::pin(async move { self.hdel_sync(key, field) })
    }

    fn rpush<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, StoreResult<usize>> {
        Box::pin(async move { self.rpush_sync(key, value) })
    }

    fn lrange<'a>(
        &'a self,
        key: &'a str,
        start: isize,
        stop: isize,
    ) -> BoxFuture<'a, StoreResult<Vec<String>>> {
        Box::pin(async move { self.lrange_sync(key, start, stop) })
    }

    fn llen<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<usize>> {
        Box::pin(async move { self.llen_sync(key) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_set_get_del() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);
        store.set("k", "v".into(), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        assert!(store.del("k").await.unwrap());
        assert!(!store.del("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_setnx_only_first_wins() {
        let store = MemoryStore::new();
        assert!(store.setnx("lock", "a".into()).await.unwrap());
        assert!(!store.setnx("lock", "b".into()).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap(), Some("a".to_string()));
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .set("k", "v".into(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(store.ttl("k").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        // expired key can be claimed again
        assert!(store.setnx("k", "w".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_incr() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("n", 1).await.unwrap(), 1);
        assert_eq!(store.incr("n", 5).await.unwrap(), 6);
        store.set("s", "abc".into(), None).await.unwrap();
        assert!(matches!(
            store.incr("s", 1).await,
            Err(StoreError::NotAnInteger(_))
        ));
    }

    #[tokio::test]
    async fn test_incr_overflow_is_an_error() {
        let store = MemoryStore::new();
        store.set("n", i64::MAX.to_string(), None).await.unwrap();
        assert!(matches!(store.incr("n", 1).await, Err(StoreError::Overflow(_))));
        assert_eq!(store.get("n").await.unwrap(), Some(i64::MAX.to_string()));
    }

    #[tokio::test]
    async fn test_conditional_field_writes() {
        let store = MemoryStore::new();
        assert!(!store.hset_existing("h", "a", "1".into()).await.unwrap());
        assert!(!store.hcompare_and_set("h", "a", "0", "1".into()).await.unwrap());
        assert!(!store.exists("h").await.unwrap());

        store.hset("h", "a", "1".into()).await.unwrap();
        assert!(store.hset_existing("h", "a", "2".into()).await.unwrap());
        assert!(!store.hset_existing("h", "b", "9".into()).await.unwrap());
        assert_eq!(store.hget("h", "b").await.unwrap(), None);

        assert!(!store.hcompare_and_set("h", "a", "1", "3".into()).await.unwrap());
        assert!(store.hcompare_and_set("h", "a", "2", "3".into()).await.unwrap());
        assert_eq!(store.hget("h", "a").await.unwrap(), Some("3".to_string()));

        // a deleted field stays deleted
        store.hdel("h", "a").await.unwrap();
        assert!(!store.hcompare_and_set("h", "a", "3", "4".into()).await.unwrap());
        assert!(!store.exists("h").await.unwrap());
    }

    #[tokio::test]
    async fn test_hash_ops() {
        let store = MemoryStore::new();
        assert!(store.hset("h", "a", "1".into()).await.unwrap());
        assert!(!store.hset("h", "a", "2".into()).await.unwrap());
        assert!(!store.hsetnx("h", "a", "3".into()).await.unwrap());
        assert!(store.hsetnx("h", "b", "4".into()).await.unwrap());
        assert_eq!(store.hget("h", "a").await.unwrap(), Some("2".to_string()));

        let all = store.hgetall("h").await.unwrap();
        assert_eq!(all.len(), 2);

        assert!(store.hdel("h", "a").await.unwrap());
        assert!(store.hdel("h", "b").await.unwrap());
        assert!(!store.exists("h").await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let store = MemoryStore::new();
        store.set("k", "v".into(), None).await.unwrap();
        assert!(matches!(
            store.hget("k", "f").await,
            Err(StoreError::WrongType { .. })
        ));
    }

    #[tokio::test]
    async fn test_lists() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.rpush("l", i.to_string()).await.unwrap();
        }
        assert_eq!(store.llen("l").await.unwrap(), 5);
        assert_eq!(store.lrange("l", 0, 1).await.unwrap(), vec!["0", "1"]);
        assert_eq!(store.lrange("l", -2, -1).await.unwrap(), vec!["3", "4"]);
        assert_eq!(store.lrange("l", 0, -1).await.unwrap().len(), 5);
        assert!(store.lrange("l", 3, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rename() {
        let store = MemoryStore::new();
        store.set("a", "1".into(), None).await.unwrap();
        store.rename("a", "b").await.unwrap();
        assert_eq!(store.get("b").await.unwrap(), Some("1".to_string()));
        assert!(matches!(
            store.rename("a", "c").await,
            Err(StoreError::NoSuchKey(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_hsetnx_single_winner() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.hsetnx("map", "fp", i.to_string()).await.unwrap()
            }));
        }
        let results = futures::future::join_all(handles).await;
        let winners = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(winners, 1);
    }
}
