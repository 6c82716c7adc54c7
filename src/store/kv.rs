// src/store/kv.rs

//! Shared key-value coordination: per-field leases and reschedule flags.
//!
//! Both capabilities expire on their own so a crashed run can never block
//! a field forever.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::errors::StoreError;
use crate::store::lock;
use crate::types::{BoxFuture, FieldId};

pub fn lease_key(field: FieldId) -> String {
    format!("fieldgen:lease:{field}")
}

pub fn flag_key(field: FieldId) -> String {
    format!("fieldgen:reschedule:{field}")
}

/// Proof of ownership handed out by [`LeaseStore::acquire`].
///
/// Only the holder of the current token can renew or release a lease, so a
/// run whose lease expired cannot drop the lease of the run that took over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseToken(u64);

impl LeaseToken {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// Time-bounded exclusive claim on a key.
pub trait LeaseStore: Send + Sync {
    /// Atomically claim `key` unless someone else holds an unexpired lease.
    fn acquire<'a>(
        &'a self,
        key: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<Option<LeaseToken>, StoreError>>;

    /// Extend the lease held with `token`; `false` if it expired or was taken over.
    fn renew<'a>(
        &'a self,
        key: &'a str,
        token: LeaseToken,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, StoreError>>;

    /// Drop the lease held with `token`; `false` if it is no longer ours.
    fn release<'a>(
        &'a self,
        key: &'a str,
        token: LeaseToken,
    ) -> BoxFuture<'a, Result<bool, StoreError>>;

    fn is_held<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, StoreError>>;
}

/// Boolean side channel with expiry.
pub trait FlagStore: Send + Sync {
    fn set<'a>(&'a self, key: &'a str, ttl: Duration) -> BoxFuture<'a, Result<(), StoreError>>;

    fn is_set<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, StoreError>>;

    /// Clear the flag and return whether it was set.
    fn test_and_clear<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, StoreError>>;
}

/// In-process [`LeaseStore`] and [`FlagStore`].
///
/// Expiry is measured on the Tokio clock, so tests with a paused clock can
/// advance past it.
#[derive(Debug, Default)]
pub struct MemoryKv {
    leases: Mutex<HashMap<String, (LeaseToken, Instant)>>,
    flags: Mutex<HashMap<String, Instant>>,
    next_token: AtomicU64,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

fn live(entries: &mut HashMap<String, Instant>, key: &str, now: Instant) -> bool {
    match entries.get(key) {
        Some(expires_at) if *expires_at > now => true,
        Some(_) => {
            entries.remove(key);
            false
        }
        None => false,
    }
}

/// Token of the unexpired lease on `key`, dropping an expired entry.
fn live_lease(
    leases: &mut HashMap<String, (LeaseToken, Instant)>,
    key: &str,
    now: Instant,
) -> Option<LeaseToken> {
    match leases.get(key) {
        Some((token, expires_at)) if *expires_at > now => Some(*token),
        Some(_) => {
            leases.remove(key);
            None
        }
        None => None,
    }
}

impl LeaseStore for MemoryKv {
    fn acquire<'a>(
        &'a self,
        key: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<Option<LeaseToken>, StoreError>> {
        let now = Instant::now();
        let mut leases = lock(&self.leases);
        let acquired = if live_lease(&mut leases, key, now).is_some() {
            None
        } else {
            let token = LeaseToken(self.next_token.fetch_add(1, Ordering::Relaxed));
            leases.insert(key.to_string(), (token, now + ttl));
            Some(token)
        };
        trace!(key, acquired = acquired.is_some(), "lease acquire");
        Box::pin(std::future::ready(Ok(acquired)))
    }

    fn renew<'a>(
        &'a self,
        key: &'a str,
        token: LeaseToken,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        let now = Instant::now();
        let mut leases = lock(&self.leases);
        let renewed = live_lease(&mut leases, key, now) == Some(token);
        if renewed {
            leases.insert(key.to_string(), (token, now + ttl));
        }
        trace!(key, renewed, "lease renew");
        Box::pin(std::future::ready(Ok(renewed)))
    }

    fn release<'a>(
        &'a self,
        key: &'a str,
        token: LeaseToken,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        let mut leases = lock(&self.leases);
        let released = live_lease(&mut leases, key, Instant::now()) == Some(token);
        if released {
            leases.remove(key);
        }
        trace!(key, released, "lease release");
        Box::pin(std::future::ready(Ok(released)))
    }

    fn is_held<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, StoreError>> {
        let held = live_lease(&mut lock(&self.leases), key, Instant::now()).is_some();
        Box::pin(std::future::ready(Ok(held)))
    }
}

impl FlagStore for MemoryKv {
    fn set<'a>(&'a self, key: &'a str, ttl: Duration) -> BoxFuture<'a, Result<(), StoreError>> {
        lock(&self.flags).insert(key.to_string(), Instant::now() + ttl);
        trace!(key, "flag set");
        Box::pin(std::future::ready(Ok(())))
    }

    fn is_set<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, StoreError>> {
        let set = live(&mut lock(&self.flags), key, Instant::now());
        Box::pin(std::future::ready(Ok(set)))
    }

    fn test_and_clear<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, StoreError>> {
        let now = Instant::now();
        let was_set = lock(&self.flags)
            .remove(key)
            .is_some_and(|expires_at| expires_at > now);
        Box::pin(std::future::ready(Ok(was_set)))
    }
}
