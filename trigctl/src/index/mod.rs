//! In-memory webhook index: `(asset_did, service, metric) -> webhooks`.
//!
//! Reads are a single atomic pointer load; every rebuild constructs a fresh
//! [`Snapshot`] and swaps it in, so a reader holding a snapshot observes a
//! stable set of webhooks regardless of concurrent rebuilds. Compiled
//! condition programs are cached content-addressed, so an unchanged
//! condition survives rebuilds without recompiling.

pub mod refresh;

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::catalog::SignalCatalog;
use crate::db::models::webhooks::{IndexableWebhook, Webhook};
use crate::store::TriggerStore;
use crate::types::{Service, WebhookId, abbrev_uuid};
use crate::xl::{self, Program, ValueKind};

/// One indexed webhook plus its compiled condition.
#[derive(Debug)]
pub struct IndexEntry {
    pub webhook: Webhook,
    pub program: Arc<Program>,
}

type IndexKey = (String, Service, String);

/// Content-addressed program cache key. Events have no metric value type,
/// hence the `Option`.
type ProgramCacheKey = (WebhookId, u64, Service, Option<ValueKind>);

/// An immutable index state. Swapped wholesale on refresh.
#[derive(Debug, Default)]
pub struct Snapshot {
    by_key: HashMap<IndexKey, Vec<Arc<IndexEntry>>>,
    webhook_count: usize,
}

impl Snapshot {
    pub fn lookup(&self, asset_did: &str, service: Service, metric: &str) -> &[Arc<IndexEntry>] {
        self.by_key
            .get(&(asset_did.to_string(), service, metric.to_string()))
            .map_or(&[], Vec::as_slice)
    }

    /// Number of `(vehicle, webhook)` pairs in the index.
    pub fn len(&self) -> usize {
        self.by_key.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Number of distinct webhooks that compiled and were indexed.
    pub fn webhook_count(&self) -> usize {
        self.webhook_count
    }
}

/// The process-wide webhook index.
pub struct TriggerIndex {
    snapshot: ArcSwap<Snapshot>,
    store: Arc<dyn TriggerStore>,
    catalog: Arc<SignalCatalog>,
    program_cache: Mutex<HashMap<ProgramCacheKey, Arc<Program>>>,
}

impl TriggerIndex {
    pub fn new(store: Arc<dyn TriggerStore>, catalog: Arc<SignalCatalog>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Snapshot::default()),
            store,
            catalog,
            program_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Grab the current snapshot. The returned `Arc` stays valid across
    /// concurrent rebuilds.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    /// Webhooks matching a key in the current snapshot.
    pub fn lookup(&self, asset_did: &str, service: Service, metric: &str) -> Vec<Arc<IndexEntry>> {
        self.snapshot
            .load()
            .lookup(asset_did, service, metric)
            .to_vec()
    }

    /// Rebuild the index from the store and swap it in atomically. On
    /// failure the previous snapshot stays in place.
    pub async fn rebuild(&self) -> anyhow::Result<()> {
        let rows = self.store.list_indexable().await?;

        let mut cache = self.program_cache.lock().await;
        let (snapshot, new_cache) = build_snapshot(rows, &self.catalog, &cache);
        *cache = new_cache;
        drop(cache);

        debug!(
            webhooks = snapshot.webhook_count(),
            pairs = snapshot.len(),
            "Webhook index rebuilt"
        );
        self.snapshot.store(Arc::new(snapshot));
        Ok(())
    }
}

/// Hash a condition source for the program cache key. This is a cache key,
/// not a security boundary.
fn condition_hash(condition: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    condition.hash(&mut hasher);
    hasher.finish()
}

/// Compile (or re-use) programs and group rows into a fresh snapshot.
/// Returns the snapshot together with the surviving program cache.
fn build_snapshot(
    rows: Vec<IndexableWebhook>,
    catalog: &SignalCatalog,
    old_cache: &HashMap<ProgramCacheKey, Arc<Program>>,
) -> (Snapshot, HashMap<ProgramCacheKey, Arc<Program>>) {
    let mut new_cache: HashMap<ProgramCacheKey, Arc<Program>> = HashMap::new();
    let mut entries: HashMap<WebhookId, Arc<IndexEntry>> = HashMap::new();
    let mut by_key: HashMap<IndexKey, Vec<Arc<IndexEntry>>> = HashMap::new();
    let mut skipped: HashSet<WebhookId> = HashSet::new();

    for row in rows {
        let webhook_id = row.webhook.id;
        if skipped.contains(&webhook_id) {
            continue;
        }

        let entry = match entries.get(&webhook_id) {
            Some(entry) => Arc::clone(entry),
            None => {
                match compile_entry(&row.webhook, catalog, old_cache, &mut new_cache) {
                    Some(entry) => {
                        let entry = Arc::new(entry);
                        entries.insert(webhook_id, Arc::clone(&entry));
                        entry
                    }
                    None => {
                        skipped.insert(webhook_id);
                        continue;
                    }
                }
            }
        };

        let Ok(service) = entry.webhook.service.parse::<Service>() else {
            continue;
        };
        let key = (row.asset_did, service, entry.webhook.metric_name.clone());
        by_key.entry(key).or_default().push(entry);
    }

    let snapshot = Snapshot {
        by_key,
        webhook_count: entries.len(),
    };
    (snapshot, new_cache)
}

/// Compile one webhook's condition, reusing the cached program when the
/// `(id, condition hash, service, value type)` key is unchanged. Returns
/// `None` (and logs) for rows the index cannot serve.
fn compile_entry(
    webhook: &Webhook,
    catalog: &SignalCatalog,
    old_cache: &HashMap<ProgramCacheKey, Arc<Program>>,
    new_cache: &mut HashMap<ProgramCacheKey, Arc<Program>>,
) -> Option<IndexEntry> {
    let service = match webhook.service.parse::<Service>() {
        Ok(s) => s,
        Err(e) => {
            warn!(webhook_id = %abbrev_uuid(&webhook.id), error = %e, "Skipping webhook with unknown service");
            return None;
        }
    };

    let (schema, value_kind) = match service {
        Service::Signals => match catalog.lookup(&webhook.metric_name) {
            Some(def) => {
                let kind = def.value_type.kind();
                (xl::signal_schema(kind), Some(kind))
            }
            None => {
                warn!(
                    webhook_id = %abbrev_uuid(&webhook.id),
                    metric = %webhook.metric_name,
                    "Skipping webhook whose metric is not in the signal catalog"
                );
                return None;
            }
        },
        Service::Events => (xl::event_schema(), None),
    };

    let cache_key = (
        webhook.id,
        condition_hash(&webhook.condition),
        service,
        value_kind,
    );

    let program = if let Some(cached) = old_cache.get(&cache_key) {
        Arc::clone(cached)
    } else {
        match xl::compile(&webhook.condition, &schema) {
            Ok(program) => Arc::new(program),
            Err(e) => {
                warn!(
                    webhook_id = %abbrev_uuid(&webhook.id),
                    error = %e,
                    "Skipping webhook whose condition no longer compiles"
                );
                return None;
            }
        }
    };
    new_cache.insert(cache_key, Arc::clone(&program));

    Some(IndexEntry {
        webhook: webhook.clone(),
        program,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MemoryTriggerStore, webhook_fixture};

    const V1: &str = "did:erc721:137:0xbA5738a18d83D41847dfFbDC6101d37C69c9B0cF:1";
    const V2: &str = "did:erc721:137:0xbA5738a18d83D41847dfFbDC6101d37C69c9B0cF:2";

    fn catalog() -> Arc<SignalCatalog> {
        Arc::new(SignalCatalog::load_embedded().unwrap())
    }

    #[tokio::test]
    async fn rebuild_groups_by_vehicle_service_and_metric() {
        let store = Arc::new(MemoryTriggerStore::new());
        let speed = webhook_fixture("signals", "speed", "valueNumber > 55");
        let braking = webhook_fixture("events", "HarshBraking", "name != previousName");
        store.insert_webhook(speed.clone());
        store.insert_webhook(braking.clone());
        store.subscribe(V1, speed.id);
        store.subscribe(V2, speed.id);
        store.subscribe(V1, braking.id);

        let index = TriggerIndex::new(store, catalog());
        index.rebuild().await.unwrap();

        assert_eq!(index.lookup(V1, Service::Signals, "speed").len(), 1);
        assert_eq!(index.lookup(V2, Service::Signals, "speed").len(), 1);
        assert_eq!(index.lookup(V1, Service::Events, "HarshBraking").len(), 1);
        // Unknown keys yield zero dispatches.
        assert!(index.lookup(V2, Service::Events, "HarshBraking").is_empty());
        assert!(index.lookup(V1, Service::Signals, "exteriorAirTemperature").is_empty());
        assert_eq!(index.snapshot().webhook_count(), 2);
    }

    #[tokio::test]
    async fn unchanged_conditions_reuse_compiled_programs() {
        let store = Arc::new(MemoryTriggerStore::new());
        let speed = webhook_fixture("signals", "speed", "valueNumber > 55");
        store.insert_webhook(speed.clone());
        store.subscribe(V1, speed.id);

        let index = TriggerIndex::new(store.clone(), catalog());
        index.rebuild().await.unwrap();
        let first = index.lookup(V1, Service::Signals, "speed")[0].program.clone();

        index.rebuild().await.unwrap();
        let second = index.lookup(V1, Service::Signals, "speed")[0].program.clone();
        assert!(Arc::ptr_eq(&first, &second), "program should be cache-reused");

        // Changing the condition invalidates the cache entry.
        let mut changed = speed.clone();
        changed.condition = "valueNumber > 80".to_string();
        store.replace_webhook(changed);
        index.rebuild().await.unwrap();
        let third = index.lookup(V1, Service::Signals, "speed")[0].program.clone();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(third.source(), "valueNumber > 80");
    }

    #[tokio::test]
    async fn snapshot_is_stable_across_rebuilds() {
        let store = Arc::new(MemoryTriggerStore::new());
        let speed = webhook_fixture("signals", "speed", "valueNumber > 55");
        store.insert_webhook(speed.clone());
        store.subscribe(V1, speed.id);

        let index = TriggerIndex::new(store.clone(), catalog());
        index.rebuild().await.unwrap();
        let held = index.snapshot();
        assert_eq!(held.lookup(V1, Service::Signals, "speed").len(), 1);

        store.unsubscribe(V1, speed.id);
        index.rebuild().await.unwrap();

        // The held snapshot still sees the old state; fresh lookups do not.
        assert_eq!(held.lookup(V1, Service::Signals, "speed").len(), 1);
        assert!(index.lookup(V1, Service::Signals, "speed").is_empty());
    }

    #[tokio::test]
    async fn bad_rows_are_skipped_without_failing_the_rebuild() {
        let store = Arc::new(MemoryTriggerStore::new());
        let good = webhook_fixture("signals", "speed", "valueNumber > 55");
        // Metric absent from the catalog.
        let bad_metric = webhook_fixture("signals", "warpCoreTemp", "valueNumber > 0");
        // Condition references an unknown variable.
        let bad_condition = webhook_fixture("signals", "speed", "velocity > 1");
        store.insert_webhook(good.clone());
        store.insert_webhook(bad_metric.clone());
        store.insert_webhook(bad_condition.clone());
        store.subscribe(V1, good.id);
        store.subscribe(V1, bad_metric.id);
        store.subscribe(V1, bad_condition.id);

        let index = TriggerIndex::new(store, catalog());
        index.rebuild().await.unwrap();
        let hits = index.lookup(V1, Service::Signals, "speed");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].webhook.id, good.id);
        assert_eq!(index.snapshot().webhook_count(), 1);
    }

    #[tokio::test]
    async fn failed_store_keeps_previous_snapshot() {
        let store = Arc::new(MemoryTriggerStore::new());
        let speed = webhook_fixture("signals", "speed", "valueNumber > 55");
        store.insert_webhook(speed.clone());
        store.subscribe(V1, speed.id);

        let index = TriggerIndex::new(store.clone(), catalog());
        index.rebuild().await.unwrap();
        assert_eq!(index.lookup(V1, Service::Signals, "speed").len(), 1);

        store.fail_next_list();
        assert!(index.rebuild().await.is_err());
        // Old snapshot is still served.
        assert_eq!(index.lookup(V1, Service::Signals, "speed").len(), 1);
    }

    #[test]
    fn condition_hash_distinguishes_sources() {
        assert_eq!(condition_hash("a > 1"), condition_hash("a > 1"));
        assert_ne!(condition_hash("a > 1"), condition_hash("a > 2"));
    }
}
