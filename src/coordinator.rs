use crate::config::ManagerConfig;
use crate::diagnostics::{self, DiagnosticsSource};
use crate::errors::{ErrorKind, SolarwattError, SolarwattResult};
use crate::item_state::Item;
use crate::naming::{self, NormalizeOptions, NormalizedItem};
use crate::solarwatt_client::SolarwattClient;
use serde_derive::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Absorbs float noise when comparing energy deltas against the threshold
const DELTA_EPSILON: f64 = 1e-9;

pub type UpdateListener = Arc<dyn Fn(&Snapshot) + Send + Sync>;

/// Things from `/rest/things`, keyed by UID
pub type ThingsSnapshot = BTreeMap<String, Value>;

/// Published view of all known items after a poll
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub items: BTreeMap<String, NormalizedItem>,
    /// Keys missing from the latest poll. Their values are carried over from earlier polls.
    pub stale_keys: BTreeSet<String>,
}

impl Snapshot {
    pub fn get(&self, key: &str) -> Option<&NormalizedItem> {
        self.items.get(key)
    }

    pub fn is_stale(&self, key: &str) -> bool {
        self.stale_keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Write suppression state for one energy item
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyDeltaState {
    pub last_written_value: f64,
    pub last_seen_value: f64,
}

impl EnergyDeltaState {
    pub fn new(value: f64) -> Self {
        Self {
            last_written_value: value,
            last_seen_value: value,
        }
    }

    /// Records a reading and returns the value to publish
    pub fn apply(&mut self, value: f64, threshold: f64) -> f64 {
        self.last_seen_value = value;
        if threshold <= 0.0 || (value - self.last_written_value).abs() + DELTA_EPSILON >= threshold
        {
            self.last_written_value = value;
        }
        self.last_written_value
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoordinatorStatus {
    pub last_update_success: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_error_kind: Option<ErrorKind>,
    pub available: bool,
    pub successful_polls: u64,
    pub failed_polls: u64,
}

#[derive(Default)]
struct PollState {
    energy: HashMap<String, EnergyDeltaState>,
    /// Parsed items of the last successful poll, numeric or not, for diagnostics
    items: BTreeMap<String, Item>,
    /// Keys that more than one raw item mapped to in the last poll
    key_collisions: BTreeMap<String, BTreeSet<String>>,
}

struct Shared {
    config: ManagerConfig,
    options: NormalizeOptions,
    client: Mutex<SolarwattClient>,
    poll: Mutex<PollState>,
    snapshot: watch::Sender<Arc<Snapshot>>,
    status: RwLock<CoordinatorStatus>,
    things: RwLock<Arc<ThingsSnapshot>>,
    listeners: RwLock<Vec<UpdateListener>>,
}

/// Polls one Manager and keeps the latest normalized snapshot.
///
/// Cloning is cheap and every clone drives the same state.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Shared>,
}

impl Coordinator {
    pub fn new(config: ManagerConfig) -> SolarwattResult<Self> {
        let client = SolarwattClient::new(&config.host, &config.username, &config.password)?;
        Ok(Self::with_client(config, client))
    }

    pub fn with_client(config: ManagerConfig, client: SolarwattClient) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Snapshot::default()));
        Self {
            inner: Arc::new(Shared {
                options: config.normalize_options(),
                config,
                client: Mutex::new(client),
                poll: Mutex::new(PollState::default()),
                snapshot,
                status: RwLock::new(CoordinatorStatus::default()),
                things: RwLock::new(Arc::new(ThingsSnapshot::new())),
                listeners: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn host(&self) -> &str {
        &self.inner.config.host
    }

    pub fn current_snapshot(&self) -> Arc<Snapshot> {
        self.inner.snapshot.borrow().clone()
    }

    pub fn status(&self) -> CoordinatorStatus {
        read(&self.inner.status).clone()
    }

    pub fn is_available(&self) -> bool {
        read(&self.inner.status).available
    }

    /// Receiver that sees every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.inner.snapshot.subscribe()
    }

    /// Registers a callback run after every successful poll, things refresh and availability change
    pub fn on_update<F>(&self, callback: F)
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        write(&self.inner.listeners).push(Arc::new(callback));
    }

    pub fn things(&self) -> Arc<ThingsSnapshot> {
        read(&self.inner.things).clone()
    }

    /// Runs one poll cycle. Failures keep the previous snapshot.
    pub async fn refresh(&self) -> SolarwattResult<Arc<Snapshot>> {
        let mut poll = self.inner.poll.lock().await;

        let fetched = {
            let mut client = self.inner.client.lock().await;
            client.get_items().await
        };

        match fetched {
            Ok(raw_items) => {
                let snapshot = Arc::new(self.build_snapshot(&mut poll, raw_items));
                drop(poll);
                self.record_success(snapshot.len());
                self.inner.snapshot.send_replace(snapshot.clone());
                self.notify(&snapshot);
                Ok(snapshot)
            }
            Err(e) => {
                drop(poll);
                if self.record_failure(&e) {
                    self.notify(&self.current_snapshot());
                }
                Err(e)
            }
        }
    }

    /// Fetches `/rest/things` for diagnostics. Failures are only logged.
    pub async fn refresh_things(&self) {
        let result = {
            let mut client = self.inner.client.lock().await;
            client.get_things().await
        };

        match result {
            Ok(list) => {
                let things: ThingsSnapshot = list
                    .into_iter()
                    .enumerate()
                    .map(|(index, thing)| {
                        let uid = thing
                            .get("UID")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("thing_{index}"));
                        (uid, thing)
                    })
                    .collect();
                info!("Fetched {} things from {}", things.len(), self.host());
                *write(&self.inner.things) = Arc::new(things);
                self.notify(&self.current_snapshot());
            }
            Err(e) => debug!("Things refresh failed for {}: {}", self.host(), e),
        }
    }

    /// Diagnostics export of the current state. Does not touch the network.
    pub async fn diagnostics(&self) -> Value {
        let poll = self.inner.poll.lock().await;
        let snapshot = self.current_snapshot();
        let status = self.status();
        let things = self.things();
        diagnostics::build_report(&DiagnosticsSource {
            config: &self.inner.config,
            status: &status,
            items: &poll.items,
            key_collisions: &poll.key_collisions,
            snapshot: &snapshot,
            things: &things,
        })
    }

    /// Starts the poll loop at the configured scan interval
    pub fn spawn(&self) -> JoinHandle<()> {
        self.spawn_every(self.inner.config.scan_interval())
    }

    /// Starts the poll loop with an explicit period, bypassing the configured limits.
    /// The first poll happens one period from now.
    pub fn spawn_every(&self, period: Duration) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.run(period).await;
        })
    }

    async fn run(&self, period: Duration) {
        info!(
            "Starting SOLARWATT poll loop for {} every {}s",
            self.host(),
            period.as_secs_f32()
        );

        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            // Errors are recorded in the status
            let _ = self.refresh().await;
        }
    }

    fn build_snapshot(&self, poll: &mut PollState, raw_items: Vec<Value>) -> Snapshot {
        let previous = self.current_snapshot();
        let threshold = self.inner.config.energy_delta;
        let total = raw_items.len();

        let mut items: BTreeMap<String, NormalizedItem> = BTreeMap::new();
        let mut parsed_items = BTreeMap::new();
        let mut key_collisions: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut skipped = 0usize;

        for (index, value) in raw_items.into_iter().enumerate() {
            let item = match Item::from_json(value, index) {
                Ok(item) => item,
                Err(e) => {
                    warn!("Skipping malformed item: {}", e);
                    skipped += 1;
                    continue;
                }
            };
            if !self.inner.config.wants_item(&item.name) {
                continue;
            }
            if item.is_switch() {
                debug!("Skipping switch item {}", item.name);
                parsed_items.insert(naming::clean_item_key(&item.name).to_string(), item);
                continue;
            }

            match naming::normalize(&item, &self.inner.options) {
                Ok(mut normalized) => {
                    if let Some(earlier) = items.get(&normalized.key) {
                        if earlier.name != normalized.name {
                            warn!(
                                "Items {} and {} both map to key {}, keeping {}",
                                earlier.name, normalized.name, normalized.key, normalized.name
                            );
                            key_collisions
                                .entry(normalized.key.clone())
                                .or_default()
                                .extend([earlier.name.clone(), normalized.name.clone()]);
                        }
                    }
                    if normalized.is_energy() {
                        let state = poll
                            .energy
                            .entry(normalized.key.clone())
                            .or_insert_with(|| EnergyDeltaState::new(normalized.value));
                        normalized.value = state.apply(normalized.value, threshold);
                    }
                    items.insert(normalized.key.clone(), normalized);
                }
                Err(e) => {
                    debug!("{}", e);
                    skipped += 1;
                }
            }
            parsed_items.insert(naming::clean_item_key(&item.name).to_string(), item);
        }

        let mut stale_keys = BTreeSet::new();
        for (key, item) in &previous.items {
            if !items.contains_key(key) {
                items.insert(key.clone(), item.clone());
                stale_keys.insert(key.clone());
            }
        }

        debug!(
            "Poll of {} returned {} items, {} published, {} skipped, {} stale",
            self.host(),
            total,
            items.len() - stale_keys.len(),
            skipped,
            stale_keys.len()
        );

        poll.items = parsed_items;
        poll.key_collisions = key_collisions;
        Snapshot { items, stale_keys }
    }

    fn record_success(&self, item_count: usize) {
        let mut status = write(&self.inner.status);
        if !status.available {
            info!(
                "SOLARWATT Manager {} available with {} items",
                self.host(),
                item_count
            );
        }
        status.last_update_success = true;
        status.consecutive_failures = 0;
        status.last_error = None;
        status.last_error_kind = None;
        status.available = true;
        status.successful_polls += 1;
    }

    /// Returns true when this failure made the Manager unavailable
    fn record_failure(&self, err: &SolarwattError) -> bool {
        let tolerance = self.inner.config.retry_tolerance;
        let mut status = write(&self.inner.status);
        status.last_update_success = false;
        status.consecutive_failures += 1;
        status.failed_polls += 1;
        status.last_error = Some(err.to_string());
        status.last_error_kind = Some(err.kind());

        let was_available = status.available;
        status.available = was_available && status.consecutive_failures <= tolerance;

        if was_available && !status.available {
            error!(
                "SOLARWATT Manager {} unavailable after {} consecutive failures: {}",
                self.host(),
                status.consecutive_failures,
                err
            );
            true
        } else {
            warn!(
                "Poll of {} failed ({}/{}): {}",
                self.host(),
                status.consecutive_failures,
                tolerance,
                err
            );
            false
        }
    }

    fn notify(&self, snapshot: &Snapshot) {
        let listeners = read(&self.inner.listeners).clone();
        for listener in listeners {
            listener(snapshot);
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
