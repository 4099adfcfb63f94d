//! Instance keys and hostname canonicalization
//!
//! An instance is addressed by `(hostname, port)`. Hostnames are
//! canonicalized through a resolver so that aliases of the same server
//! compare equal; resolution results live in a process-wide TTL cache whose
//! flush is a single map swap.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::TopologyError;

/// Address of one database server
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub hostname: String,
    pub port: u16,
}

impl InstanceKey {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

impl FromStr for InstanceKey {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.rsplit_once(':').ok_or_else(|| {
            TopologyError::InvariantViolation(format!("malformed instance key: {s:?}"))
        })?;
        let port: u16 = port.parse().map_err(|_| {
            TopologyError::InvariantViolation(format!("malformed instance port: {s:?}"))
        })?;
        if host.is_empty() {
            return Err(TopologyError::InvariantViolation(format!(
                "empty hostname in instance key: {s:?}"
            )));
        }
        Ok(Self::new(host, port))
    }
}

/// Hostname resolution capability
///
/// Deployments back this with DNS or a CMDB lookup; tests replace it.
pub trait HostnameResolver: Send + Sync {
    /// Map a hostname to its canonical form.
    fn resolve(&self, hostname: &str) -> String;
}

/// Resolver that leaves hostnames untouched
pub struct IdentityResolver;

impl HostnameResolver for IdentityResolver {
    fn resolve(&self, hostname: &str) -> String {
        hostname.to_string()
    }
}

/// Process-wide caching wrapper around a resolver
///
/// Entries are immutable while live and expire after `ttl`. `flush`
/// replaces the whole map in one swap.
pub struct CachingResolver {
    inner: Box<dyn HostnameResolver>,
    ttl: Duration,
    cache: RwLock<HashMap<String, (String, Instant)>>,
}

impl CachingResolver {
    pub fn new(inner: Box<dyn HostnameResolver>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve one hostname, consulting the cache first.
    pub fn resolve(&self, hostname: &str) -> String {
        {
            let cache = self.cache.read().expect("resolver cache poisoned");
            if let Some((resolved, inserted)) = cache.get(hostname) {
                if inserted.elapsed() < self.ttl {
                    return resolved.clone();
                }
            }
        }

        let resolved = self.inner.resolve(hostname);
        let mut cache = self.cache.write().expect("resolver cache poisoned");
        cache.insert(hostname.to_string(), (resolved.clone(), Instant::now()));
        resolved
    }

    /// Canonicalize a key's hostname.
    pub fn resolve_key(&self, key: &InstanceKey) -> InstanceKey {
        InstanceKey::new(self.resolve(&key.hostname), key.port)
    }

    /// Drop every cached entry in a single swap.
    pub fn flush(&self) {
        let mut cache = self.cache.write().expect("resolver cache poisoned");
        *cache = HashMap::new();
    }

    /// Number of live cache entries.
    pub fn len(&self) -> usize {
        self.cache.read().expect("resolver cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
