//! Fast shared key-value store.
//!
//! Status records live in a fast store shared by request handlers and
//! workers. The [`KeyStore`] trait captures the operations the coordinator
//! needs: plain values with TTL, atomic increments, conditional set, hashes
//! (with conditional field writes), lists and key rename. Every operation is atomic per key.
//!
//! [`MemoryStore`] is the in-process implementation; a networked store only
//! needs to implement the same trait.

mod lock;
mod memory;

pub use lock::StoreLock;
pub use memory::MemoryStore;

use std::collections::HashMap;
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;

/// Fast store errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The key holds a value of another kind.
    #[error("WRONGTYPE operation against key '{key}' holding the wrong kind of value")]
    WrongType { key: String },

    /// The key does not exist (rename source).
    #[error("No such key: {0}")]
    NoSuchKey(String),

    /// The stored value is not an integer (incr).
    #[error("Value at '{0}' is not an integer")]
    NotAnInteger(String),

    /// An increment would leave the 64-bit range.
    #[error("Increment of '{0}' overflows")]
    Overflow(String),

    /// Backend failure (connection, protocol).
    #[error("Store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Key-value store contract used for status records and locks.
///
/// Futures borrow the store and the key for their lifetime, which keeps the
/// trait object-safe so it can be shared as `Arc<dyn KeyStore>`.
pub trait KeyStore: Send + Sync + 'static {
    // ---- plain values ----

    /// Gets a value.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Option<String>>>;

    /// Sets a value, replacing any previous value and TTL.
    fn set<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, StoreResult<()>>;

    /// Sets a value only if the key does not exist. Returns true if set.
    fn setnx<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, StoreResult<bool>>;

    /// Atomically adds `by` to an integer value (missing keys count as 0).
    fn incr<'a>(&'a self, key: &'a str, by: i64) -> BoxFuture<'a, StoreResult<i64>>;

    // ---- key management ----

    /// Sets a TTL on an existing key. Returns false if the key is missing.
    fn expire<'a>(&'a self, key: &'a str, ttl: Duration) -> BoxFuture<'a, StoreResult<bool>>;

    /// Remaining TTL; `None` when the key is missing or has no expiry.
    fn ttl<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Option<Duration>>>;

    /// Deletes a key of any kind. Returns true if it existed.
    fn del<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<bool>>;

    /// Returns true if the key exists.
    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<bool>>;

    /// Renames a key, overwriting the destination.
    fn rename<'a>(&'a self, from: &'a str, to: &'a str) -> BoxFuture<'a, StoreResult<()>>;

    // ---- hashes ----

    /// Gets a hash field.
    fn hget<'a>(&'a self, key: &'a str, field: &'a str)
        -> BoxFuture<'a, StoreResult<Option<String>>>;

    /// Sets a hash field. Returns true if the field is new.
    fn hset<'a>(
        &'a self,
        key: &'a str,
        field: &'a str,
        value: String,
    ) -> BoxFuture<'a, StoreResult<bool>>;

    /// Sets a hash field only if it does not exist. Returns true if set.
    fn hsetnx<'a>(
        &'a self,
        key: &'a str,
        field: &'a str,
        value: String,
    ) -> BoxFuture<'a, StoreResult<bool>>;

    /// Sets a hash field only if it already exists. Returns true if set.
    fn hset_existing<'a>(
        &'a self,
        key: &'a str,
        field: &'a str,
        value: String,
    ) -> BoxFuture<'a, StoreResult<bool>>;

    /// Replaces a hash field only if it still holds `expected`.
    ///
    /// Returns false if the field is missing or was changed meanwhile.
    fn hcompare_and_set<'a>(
        &'a self,
        key: &'a str,
        field: &'a str,
        expected: &'a str,
        value: String,
    ) -> BoxFuture<'a, StoreResult<bool>>;

    /// Returns every field of a hash (empty for a missing key).
    fn hgetall<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<HashMap<String, String>>>;

    /// Deletes a hash field. Returns true if it existed.
    fn hdel<'a>(&'a self, key: &'a str, field: &'a str) -> BoxFuture<'a, StoreResult<bool>>;

    // ---- lists ----

    /// Appends to a list. Returns the new length.
    fn rpush<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, StoreResult<usize>>;

    /// Returns list items between `start` and `stop` inclusive; negative
    /// indices count from the end.
    fn lrange<'a>(
        &'a self,
        key: &'a str,
        start: isize,
        stop: isize,
    ) -> BoxFuture<'a, StoreResult<Vec<String>>>;

    /// Returns the length of a list (0 for a missing key).
    fn llen<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<usize>>;
}
