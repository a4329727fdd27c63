//! Keyed store of live sessions for adapters that address conversations by an external key
//! (a chat thread, a phone number). Entries are evicted when idle past the TTL and, when the
//! store is full, least-recently-used first. Both limits are optional.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use colloquy_core::config::SessionsConfig;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionPolicy {
    pub idle_ttl: Option<Duration>,
    pub max_entries: Option<usize>,
}

impl From<&SessionsConfig> for SessionPolicy {
    fn from(config: &SessionsConfig) -> Self {
        Self {
            idle_ttl: config.idle_ttl_secs.map(Duration::from_secs),
            max_entries: config.max_entries,
        }
    }
}

struct Entry<V> {
    value: Arc<Mutex<V>>,
    last_used: Instant,
}

pub struct SessionStore<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
    policy: SessionPolicy,
}

impl<K, V> SessionStore<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(policy: SessionPolicy) -> Self {
        Self { entries: Mutex::new(HashMap::new()), policy }
    }

    pub fn policy(&self) -> SessionPolicy {
        self.policy
    }

    /// Returns the live session for `key`, building one with `create` when absent.
    pub async fn get_or_create<F, E>(&self, key: K, create: F) -> Result<Arc<Mutex<V>>, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        self.evict_idle(&mut entries, now);

        if let Some(entry) = entries.get_mut(&key) {
            entry.last_used = now;
            return Ok(entry.value.clone());
        }

        let value = Arc::new(Mutex::new(create()?));
        if let Some(max_entries) = self.policy.max_entries {
            while entries.len() >= max_entries {
                let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_used)
                    .map(|(key, _)| key.clone())
                else {
                    break;
                };
                entries.remove(&oldest);
                debug!(event_name = "sessions.evicted_capacity", max_entries, "session evicted");
            }
        }
        entries.insert(key, Entry { value: value.clone(), last_used: now });
        Ok(value)
    }

    pub async fn get(&self, key: &K) -> Option<Arc<Mutex<V>>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        self.evict_idle(&mut entries, now);
        entries.get_mut(key).map(|entry| {
            entry.last_used = now;
            entry.value.clone()
        })
    }

    pub async fn remove(&self, key: &K) -> Option<Arc<Mutex<V>>> {
        self.entries.lock().await.remove(key).map(|entry| entry.value)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Drops idle entries; returns how many were removed.
    pub async fn evict_expired(&self) -> usize {
        let mut entries = self.entries.lock().await;
        self.evict_idle(&mut entries, Instant::now())
    }

    fn evict_idle(&self, entries: &mut HashMap<K, Entry<V>>, now: Instant) -> usize {
        let Some(ttl) = self.policy.idle_ttl else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|_, entry| now.duration_since(entry.last_used) < ttl);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(event_name = "sessions.evicted_idle", evicted, "idle sessions evicted");
        }
        evicted
    }
}
