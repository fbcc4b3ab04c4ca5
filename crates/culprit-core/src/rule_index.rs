//! Device -> rule reverse index, cached per location with a TTL.
//!
//! A location's index is rebuilt as a whole from the rule catalog; rules
//! interact, so there is no partial invalidation. At most one rebuild per
//! location is in flight. Concurrent callers wait for that rebuild and share
//! its outcome, including a failure, so a slow or failing catalog is asked
//! once per round instead of once per caller. Locations never wait on each
//! other.
//!
//! A rebuild writes its entry only after the catalog fetch has completed, so
//! a lookup that is cancelled mid-fetch leaves the cache untouched. Waiters
//! of a cancelled rebuild start their own.

use crate::extractor::extract_references;
use crate::providers::RuleCatalogProvider;
use culprit_shared::rule_match::sort_matches;
use culprit_shared::{AutomationRule, IndexFreshness, ProviderError, RuleMatch};
use lru::LruCache;
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Default time-to-live of a location's index
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Default number of locations kept
pub const DEFAULT_CAPACITY: usize = 256;

/// Cached index for one location
#[derive(Debug)]
struct CacheEntry {
    rules: Vec<AutomationRule>,
    index: HashMap<String, Vec<RuleMatch>>,
    created_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn build(rules: Vec<AutomationRule>, ttl: Duration) -> Self {
        let index = build_index(&rules);
        Self {
            rules,
            index,
            created_at: Instant::now(),
            ttl,
        }
    }

    fn is_valid(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) < self.ttl
    }

    fn matches_for(&self, device_id: &str) -> Vec<RuleMatch> {
        self.index.get(device_id).cloned().unwrap_or_default()
    }
}

/// Answer to one index query
#[derive(Debug, Clone)]
pub struct IndexLookup {
    pub matches: Vec<RuleMatch>,
    /// Rules in the catalog snapshot the answer came from
    pub rules_analyzed: usize,
    pub freshness: IndexFreshness,
    /// Catalog error behind a `Stale` or `Unavailable` answer
    pub error: Option<ProviderError>,
}

impl IndexLookup {
    fn from_entry(entry: &CacheEntry, device_id: &str, freshness: IndexFreshness) -> Self {
        Self {
            matches: entry.matches_for(device_id),
            rules_analyzed: entry.rules.len(),
            freshness,
            error: None,
        }
    }
}

struct CacheState {
    /// Entries served while valid
    live: LruCache<String, Arc<CacheEntry>>,
    /// Last successfully built entry per location, served only when the catalog fails
    last_good: LruCache<String, Arc<CacheEntry>>,
    /// Bumped by `invalidate`; a rebuild that started under an older generation does not store
    generations: HashMap<String, u64>,
}

/// Outcome of one rebuild, published to everyone waiting on it
type RebuildOutcome = Result<Arc<CacheEntry>, ProviderError>;

/// A rebuild in progress for one location
struct InFlight {
    id: u64,
    outcome: watch::Receiver<Option<RebuildOutcome>>,
}

/// Removes the in-flight record when the rebuilding caller finishes or is dropped
struct FlightGuard<'a> {
    in_flight: &'a StdMutex<HashMap<String, InFlight>>,
    location_id: &'a str,
    id: u64,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut flights = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if flights.get(self.location_id).map(|f| f.id) == Some(self.id) {
            flights.remove(self.location_id);
        }
    }
}

enum Role {
    Lead(watch::Sender<Option<RebuildOutcome>>, u64),
    Wait(watch::Receiver<Option<RebuildOutcome>>),
}

enum Waited {
    Finished(RebuildOutcome),
    /// The rebuilding caller went away without publishing
    Abandoned,
    TimedOut,
}

/// Per-location rule index cache
pub struct RuleIndex {
    catalog: Arc<dyn RuleCatalogProvider>,
    state: Mutex<CacheState>,
    /// Never held across an await
    in_flight: StdMutex<HashMap<String, InFlight>>,
    next_flight: AtomicU64,
    ttl: Duration,
}

impl RuleIndex {
    /// Create a new index
    ///
    /// * `capacity` - Maximum number of locations kept
    /// * `ttl` - Time-to-live of a location's index
    pub fn new(catalog: Arc<dyn RuleCatalogProvider>, capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            catalog,
            state: Mutex::new(CacheState {
                live: LruCache::new(capacity),
                last_good: LruCache::new(capacity),
                generations: HashMap::new(),
            }),
            in_flight: StdMutex::new(HashMap::new()),
            next_flight: AtomicU64::new(0),
            ttl,
        }
    }

    pub fn with_defaults(catalog: Arc<dyn RuleCatalogProvider>) -> Self {
        Self::new(catalog, DEFAULT_CAPACITY, DEFAULT_TTL)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Rules referencing `device_id` at `location_id`
    pub async fn get_matches(&self, device_id: &str, location_id: &str) -> Vec<RuleMatch> {
        self.lookup(device_id, location_id).await.matches
    }

    /// Rules referencing `device_id`, with where the answer came from
    pub async fn lookup(&self, device_id: &str, location_id: &str) -> IndexLookup {
        self.lookup_bounded(device_id, location_id, None).await
    }

    /// Like `lookup`, but the whole lookup, including waiting on another
    /// caller's rebuild, is bounded by `limit`. Running out of time counts as
    /// a `Timeout` failure and falls back the same way any other failure does.
    pub async fn lookup_within(
        &self,
        device_id: &str,
        location_id: &str,
        limit: Duration,
    ) -> IndexLookup {
        self.lookup_bounded(device_id, location_id, Some(limit)).await
    }

    async fn lookup_bounded(
        &self,
        device_id: &str,
        location_id: &str,
        limit: Option<Duration>,
    ) -> IndexLookup {
        let deadline = limit.map(|limit| tokio::time::Instant::now() + limit);

        loop {
            if let Some(entry) = self.fresh_entry(location_id).await {
                debug!("Rule index hit for {}", location_id);
                return IndexLookup::from_entry(&entry, device_id, IndexFreshness::Cached);
            }

            let mut outcome = match self.join_or_lead(location_id) {
                Role::Lead(publish, id) => {
                    return self
                        .rebuild(device_id, location_id, deadline, limit, publish, id)
                        .await;
                }
                Role::Wait(outcome) => outcome,
            };

            debug!("Waiting on in-flight rule index rebuild for {}", location_id);
            let waited = within(deadline, async {
                match outcome.wait_for(Option::is_some).await {
                    Ok(published) => (*published)
                        .clone()
                        .map_or(Waited::Abandoned, Waited::Finished),
                    Err(_) => Waited::Abandoned,
                }
            })
            .await
            .unwrap_or(Waited::TimedOut);

            match waited {
                Waited::Finished(Ok(entry)) => {
                    debug!("Rule index for {} rebuilt by a concurrent caller", location_id);
                    return IndexLookup::from_entry(&entry, device_id, IndexFreshness::Cached);
                }
                Waited::Finished(Err(err)) => {
                    return self.fallback(device_id, location_id, err).await;
                }
                Waited::TimedOut => {
                    return self
                        .fallback(device_id, location_id, timed_out(limit))
                        .await;
                }
                Waited::Abandoned => {
                    debug!("Rule index rebuild for {} abandoned; retrying", location_id);
                }
            }
        }
    }

    /// Register as the rebuilding caller, or subscribe to the one already running
    fn join_or_lead(&self, location_id: &str) -> Role {
        let mut flights = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(flight) = flights.get(location_id) {
            return Role::Wait(flight.outcome.clone());
        }

        let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
        let (publish, outcome) = watch::channel(None);
        flights.insert(location_id.to_string(), InFlight { id, outcome });
        Role::Lead(publish, id)
    }

    async fn rebuild(
        &self,
        device_id: &str,
        location_id: &str,
        deadline: Option<tokio::time::Instant>,
        limit: Option<Duration>,
        publish: watch::Sender<Option<RebuildOutcome>>,
        id: u64,
    ) -> IndexLookup {
        let _flight = FlightGuard {
            in_flight: &self.in_flight,
            location_id,
            id,
        };

        // A previous rebuild may have stored its entry just before we registered.
        if let Some(entry) = self.fresh_entry(location_id).await {
            publish.send_replace(Some(Ok(Arc::clone(&entry))));
            return IndexLookup::from_entry(&entry, device_id, IndexFreshness::Cached);
        }

        let generation = self.generation(location_id).await;
        info!("Rebuilding rule index for {}", location_id);

        let fetched = within(deadline, self.catalog.list_rules(location_id))
            .await
            .unwrap_or_else(|| Err(timed_out(limit)));

        let outcome: RebuildOutcome = match fetched {
            Ok(rules) => {
                let entry = Arc::new(CacheEntry::build(rules, self.ttl));
                info!(
                    "Indexed {} rules covering {} devices for {}",
                    entry.rules.len(),
                    entry.index.len(),
                    location_id
                );
                self.store(location_id, generation, Arc::clone(&entry)).await;
                Ok(entry)
            }
            Err(err) => Err(err),
        };
        publish.send_replace(Some(outcome.clone()));

        match outcome {
            Ok(entry) => IndexLookup::from_entry(&entry, device_id, IndexFreshness::Rebuilt),
            Err(err) => self.fallback(device_id, location_id, err).await,
        }
    }

    /// Drop the live entry so the next query refetches the catalog.
    /// A rebuild already in flight keeps its callers but is no longer joined.
    pub async fn invalidate(&self, location_id: &str) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(location_id);

        let mut state = self.state.lock().await;
        state.live.pop(location_id);
        *state
            .generations
            .entry(location_id.to_string())
            .or_insert(0) += 1;
        info!("Invalidated rule index for {}", location_id);
    }

    /// Whether a valid entry exists, without touching LRU order
    pub async fn has_fresh_entry(&self, location_id: &str) -> bool {
        let state = self.state.lock().await;
        state
            .live
            .peek(location_id)
            .map(|entry| entry.is_valid(Instant::now()))
            .unwrap_or(false)
    }

    /// Remove expired live entries (called periodically)
    pub async fn prune_expired(&self) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let expired: Vec<String> = state
            .live
            .iter()
            .filter(|(_, entry)| !entry.is_valid(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            state.live.pop(&key);
        }
    }

    /// Number of live entries
    pub async fn len(&self) -> usize {
        self.state.lock().await.live.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn fresh_entry(&self, location_id: &str) -> Option<Arc<CacheEntry>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let cached = state
            .live
            .get(location_id)
            .map(|entry| (entry.is_valid(now), Arc::clone(entry)));
        match cached {
            Some((true, entry)) => Some(entry),
            Some((false, _)) => {
                // Stale entries are treated as absent; last_good keeps a copy.
                state.live.pop(location_id);
                None
            }
            None => None,
        }
    }

    async fn generation(&self, location_id: &str) -> u64 {
        let state = self.state.lock().await;
        state.generations.get(location_id).copied().unwrap_or(0)
    }

    async fn store(&self, location_id: &str, generation: u64, entry: Arc<CacheEntry>) {
        let mut state = self.state.lock().await;
        let current = state.generations.get(location_id).copied().unwrap_or(0);
        if current != generation {
            debug!(
                "Rule index for {} invalidated during rebuild; not caching",
                location_id
            );
            return;
        }
        state.live.put(location_id.to_string(), Arc::clone(&entry));
        state.last_good.put(location_id.to_string(), entry);
    }

    async fn fallback(&self, device_id: &str, location_id: &str, err: ProviderError) -> IndexLookup {
        let previous = self.state.lock().await.last_good.get(location_id).cloned();

        match previous {
            Some(entry) => {
                warn!(
                    "Rule catalog fetch failed for {} ({}); serving last known index",
                    location_id, err
                );
                let mut lookup = IndexLookup::from_entry(
                    &entry,
                    device_id,
                    IndexFreshness::Stale {
                        reason: err.to_string(),
                    },
                );
                lookup.error = Some(err);
                lookup
            }
            None => {
                warn!(
                    "Rule catalog fetch failed for {} ({}); no index available",
                    location_id, err
                );
                IndexLookup {
                    matches: Vec::new(),
                    rules_analyzed: 0,
                    freshness: IndexFreshness::Unavailable {
                        reason: err.to_string(),
                    },
                    error: Some(err),
                }
            }
        }
    }
}

/// Run `fut` to completion, or until `deadline` passes (`None` on timeout)
async fn within<F: Future>(deadline: Option<tokio::time::Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

fn timed_out(limit: Option<Duration>) -> ProviderError {
    ProviderError::Timeout(limit.map_or(0, |limit| limit.as_millis() as u64))
}

/// Build the device -> matches map for a catalog snapshot
pub fn build_index(rules: &[AutomationRule]) -> HashMap<String, Vec<RuleMatch>> {
    let mut index: HashMap<String, Vec<RuleMatch>> = HashMap::new();

    for rule in rules {
        let extraction = extract_references(rule);
        for (device_id, reference) in extraction.references {
            index.entry(device_id).or_default().push(
                RuleMatch::direct(&rule.id, &rule.name, reference.role, rule.status)
                    .with_scheduled(reference.scheduled),
            );
        }
    }

    for matches in index.values_mut() {
        sort_matches(matches);
    }
    index
}
