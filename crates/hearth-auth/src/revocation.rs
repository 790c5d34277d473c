use base64::prelude::*;
use chrono::{DateTime, TimeZone, Utc};
use hearth_config::ConfigStore;
use hearth_domain::{ObserverList, Subscription};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::error::AuthError;

/// Storage key for the persisted revocation list.
const REVOCATION_KEY: &str = "revocation_list";

/// Default bound on stored entries.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Unix seconds of 2000-01-01T00:00:00Z, the epoch used by revocation
/// timestamps on the wire.
const J2000_EPOCH: i64 = 946_684_800;

pub fn from_j2000(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(J2000_EPOCH + seconds, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub fn to_j2000(time: DateTime<Utc>) -> i64 {
    time.timestamp().saturating_sub(J2000_EPOCH)
}

/// One revocation rule. Empty ids are wildcards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationEntry {
    pub user_id: Vec<u8>,
    pub app_id: Vec<u8>,
    /// Delegations issued at or before this instant are blocked.
    pub revocation: DateTime<Utc>,
    /// The rule itself stops applying after this instant.
    pub expiration: DateTime<Utc>,
}

type EntryKey = (Vec<u8>, Vec<u8>);

/// Bounded store of `(user, app)` revocation rules, persisted through the
/// config store. When full, the oldest rules collapse into a single
/// wildcard entry so old delegations stay blocked.
pub struct AccessRevocationManager {
    store: Option<Arc<dyn ConfigStore>>,
    entries: Mutex<BTreeMap<EntryKey, RevocationEntry>>,
    capacity: usize,
    on_changed: ObserverList<()>,
}

impl AccessRevocationManager {
    pub fn new(store: Option<Arc<dyn ConfigStore>>) -> Self {
        Self::with_capacity(store, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(store: Option<Arc<dyn ConfigStore>>, capacity: usize) -> Self {
        let manager = AccessRevocationManager {
            store,
            entries: Mutex::new(BTreeMap::new()),
            capacity: capacity.max(2),
            on_changed: ObserverList::new(),
        };
        manager.load();
        manager
    }

    fn load(&self) {
        let Some(store) = &self.store else { return };
        let Some(blob) = store.load_settings(REVOCATION_KEY) else {
            return;
        };
        match parse_entries(&blob) {
            Ok(loaded) => {
                let now = Utc::now();
                let total = loaded.len();
                let mut entries = self.lock();
                for entry in loaded {
                    if entry.expiration > now {
                        entries.insert(key_of(&entry), entry);
                    }
                }
                let kept = entries.len();
                drop(entries);
                if kept < total {
                    // Reclaim storage occupied by expired entries.
                    self.save();
                }
            }
            Err(e) => warn!(error = %e, "dropping unreadable revocation list"),
        }
    }

    /// Add a rule. An entry for the same `(user, app)` merges by taking the
    /// maximum of both timestamps.
    pub fn block(&self, entry: RevocationEntry) -> Result<(), AuthError> {
        let now = Utc::now();
        if entry.expiration <= now {
            return Err(AuthError::EntryExpired);
        }

        {
            let mut entries = self.lock();
            shrink(&mut entries, self.capacity, now);
            let key = key_of(&entry);
            match entries.get_mut(&key) {
                Some(existing) => {
                    existing.revocation = existing.revocation.max(entry.revocation);
                    existing.expiration = existing.expiration.max(entry.expiration);
                }
                None => {
                    entries.insert(key, entry);
                }
            }
        }

        self.on_changed.notify(&());
        self.save();
        Ok(())
    }

    /// Is a delegation for `(user, app)` issued at `delegation_ts` blocked?
    /// Wildcard rules are consulted alongside the exact pair.
    pub fn is_blocked(&self, user_id: &[u8], app_id: &[u8], delegation_ts: DateTime<Utc>) -> bool {
        let now = Utc::now();
        let entries = self.lock();
        let no_id: &[u8] = &[];
        for user in [no_id, user_id] {
            for app in [no_id, app_id] {
                if let Some(entry) = entries.get(&(user.to_vec(), app.to_vec())) {
                    if entry.expiration > now && entry.revocation >= delegation_ts {
                        return true;
                    }
                }
            }
        }
        false
    }

    pub fn entries(&self) -> Vec<RevocationEntry> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn on_changed(&self, callback: impl Fn(&()) + Send + Sync + 'static) -> Subscription {
        self.on_changed.add(callback)
    }

    fn save(&self) {
        let Some(store) = &self.store else { return };
        let list: Vec<serde_json::Value> = self
            .lock()
            .values()
            .map(|e| {
                json!({
                    "user": BASE64_STANDARD.encode(&e.user_id),
                    "app": BASE64_STANDARD.encode(&e.app_id),
                    "revocation": to_j2000(e.revocation),
                    "expiration": to_j2000(e.expiration),
                })
            })
            .collect();
        match serde_json::to_string(&list) {
            Ok(blob) => store.save_settings(REVOCATION_KEY, &blob),
            Err(e) => warn!(error = %e, "failed to serialize revocation list"),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<EntryKey, RevocationEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn key_of(entry: &RevocationEntry) -> EntryKey {
    (entry.user_id.clone(), entry.app_id.clone())
}

/// Drop expired rules; if the store is still full, fold everything with the
/// two smallest revocation timestamps into one wildcard rule that blocks
/// all delegations up to the second-smallest timestamp.
fn shrink(entries: &mut BTreeMap<EntryKey, RevocationEntry>, capacity: usize, now: DateTime<Utc>) {
    entries.retain(|_, e| e.expiration > now);
    if entries.len() < capacity {
        return;
    }

    let mut oldest = [DateTime::<Utc>::MAX_UTC; 2];
    for entry in entries.values() {
        // Non-strict comparison so equal timestamps count as two entries.
        if entry.revocation <= oldest[0] {
            oldest[1] = oldest[0];
            oldest[0] = entry.revocation;
        } else {
            oldest[1] = oldest[1].min(entry.revocation);
        }
    }
    let cutoff = oldest[1];

    entries.retain(|_, e| e.revocation > cutoff);
    let wildcard = RevocationEntry {
        user_id: Vec::new(),
        app_id: Vec::new(),
        revocation: cutoff,
        expiration: DateTime::<Utc>::MAX_UTC,
    };
    info!(cutoff = %cutoff, "revocation list full, collapsed oldest entries");
    entries.insert(key_of(&wildcard), wildcard);
}

fn parse_entries(blob: &str) -> Result<Vec<RevocationEntry>, AuthError> {
    let list: Vec<serde_json::Value> =
        serde_json::from_str(blob).map_err(|e| AuthError::BadRevocationList(e.to_string()))?;
    let mut out = Vec::with_capacity(list.len());
    for item in list {
        let get_str = |key: &str| -> Result<Vec<u8>, AuthError> {
            let text = item
                .get(key)
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| AuthError::BadRevocationList(format!("missing '{key}'")))?;
            BASE64_STANDARD
                .decode(text)
                .map_err(|_| AuthError::BadRevocationList(format!("bad base64 in '{key}'")))
        };
        let get_time = |key: &str| -> Result<DateTime<Utc>, AuthError> {
            item.get(key)
                .and_then(serde_json::Value::as_i64)
                .map(from_j2000)
                .ok_or_else(|| AuthError::BadRevocationList(format!("missing '{key}'")))
        };
        out.push(RevocationEntry {
            user_id: get_str("user")?,
            app_id: get_str("app")?,
            revocation: get_time("revocation")?,
            expiration: get_time("expiration")?,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(user: &[u8], app: &[u8], revocation: DateTime<Utc>) -> RevocationEntry {
        RevocationEntry {
            user_id: user.to_vec(),
            app_id: app.to_vec(),
            revocation,
            expiration: DateTime::<Utc>::MAX_UTC,
        }
    }

    #[test]
    fn blocks_by_id_pairs_and_wildcards() {
        let manager = AccessRevocationManager::new(None);
        let t = Utc::now();
        manager.block(entry(b"alice", b"app", t)).unwrap();

        assert!(manager.is_blocked(b"alice", b"app", t));
        assert!(manager.is_blocked(b"alice", b"app", t - Duration::seconds(10)));
        // Later delegations are fine.
        assert!(!manager.is_blocked(b"alice", b"app", t + Duration::seconds(1)));
        // Other principals are not affected.
        assert!(!manager.is_blocked(b"bob", b"app", t));

        // Wildcard user blocks everyone on that app.
        manager.block(entry(b"", b"app2", t)).unwrap();
        assert!(manager.is_blocked(b"anyone", b"app2", t));
    }

    #[test]
    fn expired_entries_are_rejected() {
        let manager = AccessRevocationManager::new(None);
        let mut e = entry(b"u", b"a", Utc::now());
        e.expiration = Utc::now() - Duration::seconds(1);
        assert!(matches!(manager.block(e), Err(AuthError::EntryExpired)));
    }

    #[test]
    fn same_pair_merges_to_max_timestamps() {
        let manager = AccessRevocationManager::new(None);
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(100);
        manager.block(entry(b"u", b"a", t1)).unwrap();
        manager.block(entry(b"u", b"a", t0)).unwrap();

        assert_eq!(manager.len(), 1);
        assert!(manager.is_blocked(b"u", b"a", t1));
    }

    #[test]
    fn overflow_collapses_oldest_into_wildcard() {
        let manager = AccessRevocationManager::with_capacity(None, 3);
        let base = Utc::now();
        let at = |s: i64| base + Duration::seconds(s);

        manager.block(entry(b"u1", b"a1", at(100))).unwrap();
        manager.block(entry(b"u2", b"a2", at(200))).unwrap();
        manager.block(entry(b"u3", b"a3", at(300))).unwrap();
        manager.block(entry(b"u4", b"a4", at(400))).unwrap();

        assert!(manager.len() <= 3);
        // Everything at or before the collapse timestamp stays blocked, for
        // any principal, through the wildcard rule.
        assert!(manager.is_blocked(b"anyone", b"anyapp", at(150)));
        assert!(manager.is_blocked(b"u1", b"a1", at(100)));
        // Delegations after the collapse timestamp only match surviving
        // per-id rules.
        assert!(!manager.is_blocked(b"anyone", b"anyapp", at(201)));
        assert!(manager.is_blocked(b"u3", b"a3", at(250)));
        assert!(manager.is_blocked(b"u4", b"a4", at(400)));
    }

    #[test]
    fn change_callbacks_fire_on_block() {
        let manager = AccessRevocationManager::new(None);
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let hits2 = hits.clone();
        let _sub = manager.on_changed(move |_| {
            hits2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        manager.block(entry(b"u", b"a", Utc::now())).unwrap();
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[derive(Default)]
    struct MemoryStore {
        blobs: Mutex<std::collections::HashMap<String, String>>,
    }

    impl ConfigStore for MemoryStore {
        fn load_settings(&self, key: &str) -> Option<String> {
            self.blobs.lock().unwrap().get(key).cloned()
        }

        fn save_settings(&self, key: &str, value: &str) {
            self.blobs
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
        }
    }

    #[test]
    fn entries_persist_across_instances() {
        let store = Arc::new(MemoryStore::default());
        let t = Utc::now();
        {
            let manager = AccessRevocationManager::new(Some(store.clone()));
            manager.block(entry(b"alice", b"app", t)).unwrap();
        }

        let reloaded = AccessRevocationManager::new(Some(store));
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.is_blocked(b"alice", b"app", t - Duration::seconds(1)));
    }

    #[test]
    fn j2000_conversion_round_trips() {
        let t = from_j2000(500_000_000);
        assert_eq!(to_j2000(t), 500_000_000);
        assert_eq!(from_j2000(0).timestamp(), 946_684_800);
    }
}
