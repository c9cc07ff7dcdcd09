//! Container pool — warm container cache for function execution.
//!
//! Containers are cached by (subject, action, revision) key. `get_action`
//! reuses a warm container when one exists, creates one otherwise, and backs
//! off while the pool is at capacity. `put_back` pauses the container and
//! returns it to the warm reserve, evicting the oldest idle entry when the
//! reserve is full. A background sweep removes idle containers by age.
//!
//! Two locks: the state lock guards the maps and counters and is held for
//! short critical sections only; `gc_sync` serializes whole sweeps so their
//! teardown I/O never overlaps. No backend call is made under the state lock.

use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::action::{Action, AuthKey, PoolKey, RunResult, STOCK_IMAGE_PREFIX};
use crate::backend::{BackendError, Container, ContainerBackend, ContainerLimits, CreateOptions};
use crate::config::Config;
use crate::metrics::Metrics;

/// Name prefix for pool-managed containers; straggler cleanup keys on it.
pub const CONTAINER_PREFIX: &str = "wsk";

/// Back-off between acquire attempts while the pool is at capacity.
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Grace period before the final log read at teardown, so the engine's log
/// forwarder can catch up.
const TEARDOWN_LOG_DELAY: Duration = Duration::from_millis(150);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContainerState {
    Idle,
    Active,
}

/// Per-container bookkeeping. Lives in `containers` and is referenced from
/// exactly one bucket.
struct ContainerInfo {
    key: PoolKey,
    container: Container,
    state: ContainerState,
    last_used: Instant,
    /// Cleared when init failed and reuse is disabled; `put_back` removes
    /// such containers instead of parking them.
    reusable: bool,
}

/// Everything guarded by the state lock.
struct PoolState {
    /// Every pooled container, by name.
    containers: HashMap<String, ContainerInfo>,
    /// Interchangeable containers per key. Buckets are never empty.
    buckets: HashMap<PoolKey, Vec<String>>,
    /// Creations in flight; at most one pool-wide.
    starting: u32,
    max_active: usize,
    max_idle: usize,
    gc_threshold: Duration,
    log_dir: PathBuf,
}

impl PoolState {
    fn count(&self, state: ContainerState) -> usize {
        self.containers.values().filter(|i| i.state == state).count()
    }

    fn at_capacity(&self) -> bool {
        self.count(ContainerState::Active) + self.starting as usize >= self.max_active
    }

    /// Register a freshly created container as Active.
    fn introduce(&mut self, key: PoolKey, container: Container, reusable: bool) {
        let name = container.name.clone();
        self.buckets.entry(key.clone()).or_default().push(name.clone());
        self.containers.insert(
            name,
            ContainerInfo {
                key,
                container,
                state: ContainerState::Active,
                last_used: Instant::now(),
                reusable,
            },
        );
    }

    /// Unlink a container from both maps, dropping its bucket if it was the
    /// last entry.
    fn remove(&mut self, name: &str) -> Option<ContainerInfo> {
        let info = self.containers.remove(name)?;
        if let Some(bucket) = self.buckets.get_mut(&info.key) {
            bucket.retain(|n| n != name);
            if bucket.is_empty() {
                self.buckets.remove(&info.key);
            }
        }
        Some(info)
    }

    fn oldest_idle(&self) -> Option<String> {
        self.containers
            .values()
            .filter(|i| i.state == ContainerState::Idle)
            .min_by_key(|i| i.last_used)
            .map(|i| i.container.name.clone())
    }

    /// First idle container in the key's bucket, if any.
    fn warm(&self, key: &PoolKey) -> Option<String> {
        self.buckets.get(key).and_then(|bucket| {
            bucket
                .iter()
                .find(|n| {
                    self.containers
                        .get(*n)
                        .is_some_and(|i| i.state == ContainerState::Idle)
                })
                .cloned()
        })
    }
}

/// Outcome of one pass over the cache under the state lock.
enum Probe {
    Hit(Container),
    Miss,
    Busy,
}

/// Result of a successful creation, as produced by the `make` closures.
struct Created {
    container: Container,
    init: Option<RunResult>,
    reusable: bool,
}

/// Point-in-time view of one bucket, for the admin surface.
pub struct BucketSnapshot {
    pub key: String,
    pub total: usize,
    pub idle: usize,
}

/// Point-in-time view of the pool, for the admin surface.
pub struct PoolSnapshot {
    pub active: usize,
    pub idle: usize,
    pub starting: u32,
    pub buckets: Vec<BucketSnapshot>,
}

/// Warm container pool over a container backend.
pub struct Pool<B: ContainerBackend> {
    backend: Arc<B>,
    state: Mutex<PoolState>,
    /// Serializes GC sweeps, teardown included, without stalling get/put
    /// traffic on the state lock.
    gc_sync: Mutex<()>,
    gc_enabled: AtomicBool,
    name_seq: AtomicU64,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
}

impl<B: ContainerBackend> Pool<B> {
    pub fn new(backend: Arc<B>, config: Arc<Config>, metrics: Arc<Metrics>) -> Self {
        let state = PoolState {
            containers: HashMap::new(),
            buckets: HashMap::new(),
            starting: 0,
            max_active: config.max_active,
            max_idle: config.max_idle,
            gc_threshold: Duration::from_secs_f64(config.gc_threshold.max(0.0)),
            log_dir: PathBuf::from(&config.log_dir),
        };
        Self {
            backend,
            state: Mutex::new(state),
            gc_sync: Mutex::new(()),
            gc_enabled: AtomicBool::new(true),
            name_seq: AtomicU64::new(0),
            config,
            metrics,
        }
    }

    // ─── Acquirer ────────────────────────────────────────────────────────

    /// Check out a container for an action invocation. Warm containers are
    /// reused without re-running init (the second tuple element is `None`
    /// for a cache hit). Returns `None` when creation fails.
    pub async fn get_action(
        &self,
        action: &Action,
        auth: &AuthKey,
    ) -> Option<(Container, Option<RunResult>)> {
        let key = PoolKey::for_action(auth, action);
        let (image, pull) = action
            .container_image(&self.config.docker_registry, &self.config.docker_image_tag);

        self.get(&key, || async move {
            let name = self.next_name(&action.fqn());
            let opts = CreateOptions {
                network: self.config.container_network.clone(),
                pull,
                env: self.action_env(auth),
                limits: ContainerLimits {
                    memory_mb: self.config.container_memory_mb,
                },
                args: Vec::new(),
            };
            let container = self.backend.create(&name, &image, &opts).await?;

            match self.backend.init(&container, &action.init_payload()).await {
                Ok(result) => {
                    let reusable = result.ok() || self.config.reuse_after_failed_init;
                    if !result.ok() {
                        Metrics::inc(&self.metrics.init_failures);
                        warn!(container = %container.name, "init reported failure");
                    }
                    Ok(Created {
                        container,
                        init: Some(result),
                        reusable,
                    })
                }
                Err(e) => {
                    // The runtime never came up; reclaim the container
                    // before surfacing the failure.
                    Metrics::inc(&self.metrics.init_failures);
                    self.teardown(container).await;
                    Err(e)
                }
            }
        })
        .await
    }

    /// Check out a container running a raw image, without init.
    pub async fn get_by_image_name(&self, image: &str, args: &[String]) -> Option<Container> {
        let key = PoolKey::for_image(image, args);
        let pull = !image.starts_with(STOCK_IMAGE_PREFIX);

        self.get(&key, || async move {
            let name = self.next_name(image);
            let opts = CreateOptions {
                network: self.config.container_network.clone(),
                pull,
                env: self.base_env(),
                limits: ContainerLimits {
                    memory_mb: self.config.container_memory_mb,
                },
                args: args.to_vec(),
            };
            let container = self.backend.create(&name, image, &opts).await?;
            Ok(Created {
                container,
                init: None,
                reusable: true,
            })
        })
        .await
        .map(|(container, _)| container)
    }

    /// Core acquire loop: probe the cache, back off on capacity, create on
    /// a miss. `make` runs outside the state lock; the `starting` counter
    /// holds its capacity slot meanwhile. Creation is serialized pool-wide.
    async fn get<F, Fut>(&self, key: &PoolKey, make: F) -> Option<(Container, Option<RunResult>)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Created, BackendError>>,
    {
        Metrics::inc(&self.metrics.pool_gets);

        loop {
            let probe = {
                let mut state = self.state.lock().await;
                if state.at_capacity() {
                    Probe::Busy
                } else if let Some(name) = state.warm(key) {
                    match state.containers.get_mut(&name) {
                        Some(info) => {
                            info.state = ContainerState::Active;
                            Probe::Hit(info.container.clone())
                        }
                        None => Probe::Miss,
                    }
                } else {
                    Probe::Miss
                }
            };

            match probe {
                Probe::Hit(container) => {
                    // Unpause outside the lock; the caller must observe a
                    // running container.
                    if let Err(e) = self.backend.unpause(&container).await {
                        warn!(container = %container.name, error = %e, "unpause failed, discarding");
                        let removed = self.state.lock().await.remove(&container.name);
                        if let Some(info) = removed {
                            self.teardown(info.container).await;
                        }
                        continue;
                    }
                    Metrics::inc(&self.metrics.pool_hits);
                    debug!(%key, container = %container.name, "pool: reusing warm container");
                    return Some((container, None));
                }
                Probe::Busy => {
                    Metrics::inc(&self.metrics.pool_busy_waits);
                    tokio::time::sleep(BUSY_RETRY_DELAY).await;
                }
                Probe::Miss => {
                    // Re-check under the lock: another starter may have
                    // raced ahead since the probe.
                    let begin = {
                        let mut state = self.state.lock().await;
                        if state.at_capacity() || state.starting >= 1 {
                            false
                        } else {
                            state.starting += 1;
                            true
                        }
                    };
                    if begin {
                        break;
                    }
                    Metrics::inc(&self.metrics.pool_busy_waits);
                    tokio::time::sleep(BUSY_RETRY_DELAY).await;
                }
            }
        }

        Metrics::inc(&self.metrics.pool_misses);
        debug!(%key, "pool: creating container");
        let outcome = make().await;

        let mut state = self.state.lock().await;
        state.starting -= 1;
        match outcome {
            Ok(created) => {
                state.introduce(key.clone(), created.container.clone(), created.reusable);
                drop(state);
                Metrics::inc(&self.metrics.containers_created);
                Some((created.container, created.init))
            }
            Err(e) => {
                drop(state);
                Metrics::inc(&self.metrics.create_failures);
                warn!(%key, error = %e, "pool: container creation failed");
                None
            }
        }
    }

    // ─── Releaser ────────────────────────────────────────────────────────

    /// Return a container after use. Pauses it and parks it in the warm
    /// reserve, evicting the oldest idle container while the reserve is
    /// over capacity. With `delete`, the container is torn down instead.
    pub async fn put_back(&self, container: &Container, delete: bool) {
        Metrics::inc(&self.metrics.pool_put_backs);

        let reusable = {
            let state = self.state.lock().await;
            match state.containers.get(&container.name) {
                Some(info) if info.state == ContainerState::Active => info.reusable,
                Some(_) => {
                    Metrics::inc(&self.metrics.invariant_violations);
                    error!(container = %container.name, "put_back: container is not active");
                    return;
                }
                None => {
                    Metrics::inc(&self.metrics.invariant_violations);
                    error!(container = %container.name, "put_back: unknown container");
                    return;
                }
            }
        };

        // Pause before the container becomes visible as idle. The entry is
        // still Active, so no other path touches it during the call.
        let mut discard = delete || !reusable;
        if let Err(e) = self.backend.pause(container).await {
            warn!(container = %container.name, error = %e, "put_back: pause failed, discarding");
            discard = true;
        }

        // Capacity eviction sees only containers that were already idle;
        // the one being returned transitions afterwards and so never evicts
        // itself.
        let gc_enabled = self.gc_enabled.load(Ordering::Relaxed);
        let mut torn_down = Vec::new();
        {
            let mut state = self.state.lock().await;
            // Re-verify under the lock: a racing put_back for the same
            // container may have transitioned the entry while pause ran
            // unlocked.
            let still_active = state
                .containers
                .get(&container.name)
                .is_some_and(|info| info.state == ContainerState::Active);
            if !still_active {
                Metrics::inc(&self.metrics.invariant_violations);
                error!(container = %container.name, "put_back: container is no longer active");
                return;
            }
            if gc_enabled {
                while state.count(ContainerState::Idle) >= state.max_idle {
                    let Some(oldest) = state.oldest_idle() else { break };
                    if let Some(victim) = state.remove(&oldest) {
                        Metrics::inc(&self.metrics.evictions_capacity);
                        debug!(container = %victim.container.name, "pool: evicting oldest idle");
                        torn_down.push(victim);
                    }
                }
            }

            if discard {
                if let Some(info) = state.remove(&container.name) {
                    Metrics::inc(&self.metrics.pool_deletes);
                    torn_down.push(info);
                }
            } else if gc_enabled && state.max_idle == 0 {
                // No warm reserve configured; the container goes straight
                // back down.
                if let Some(info) = state.remove(&container.name) {
                    Metrics::inc(&self.metrics.evictions_capacity);
                    torn_down.push(info);
                }
            } else if let Some(info) = state.containers.get_mut(&container.name) {
                info.state = ContainerState::Idle;
                info.last_used = Instant::now();
                debug!(container = %container.name, "pool: container returned");
            }
        }

        for info in torn_down {
            self.teardown(info.container).await;
        }
    }

    // ─── Age GC ──────────────────────────────────────────────────────────

    /// One age-based sweep: remove idle containers older than the
    /// threshold. No-op while GC is disabled.
    pub async fn perform_gc(&self) -> usize {
        if !self.gc_enabled.load(Ordering::Relaxed) {
            return 0;
        }
        let threshold = self.state.lock().await.gc_threshold;
        self.sweep(|info| info.last_used.elapsed() >= threshold)
            .await
    }

    /// Synchronous full sweep of the warm reserve, regardless of age and of
    /// the enabled flag.
    pub async fn force_gc(&self) -> usize {
        self.sweep(|_| true).await
    }

    async fn sweep<P: Fn(&ContainerInfo) -> bool>(&self, expired: P) -> usize {
        // One sweep at a time; get/put traffic keeps flowing on the state
        // lock while this sweep's teardown I/O runs.
        let _sweeping = self.gc_sync.lock().await;

        let victims: Vec<ContainerInfo> = {
            let mut state = self.state.lock().await;
            let names: Vec<String> = state
                .containers
                .values()
                .filter(|i| i.state == ContainerState::Idle && expired(i))
                .map(|i| i.container.name.clone())
                .collect();
            names.iter().filter_map(|n| state.remove(n)).collect()
        };

        let count = victims.len();
        if count > 0 {
            Metrics::add(&self.metrics.evictions_age, count as u64);
            info!(count, "gc: swept idle containers");
        }
        for info in victims {
            self.teardown(info.container).await;
        }
        count
    }

    /// Background task: one age sweep per interval. Overrunning sweeps
    /// serialize on `gc_sync` rather than queue up.
    pub async fn gc_loop(self: Arc<Self>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs_f64(self.config.gc_frequency));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.perform_gc().await;
        }
    }

    pub fn enable_gc(&self) {
        self.gc_enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable_gc(&self) {
        self.gc_enabled.store(false, Ordering::Relaxed);
    }

    // ─── Teardown ────────────────────────────────────────────────────────

    /// Best-effort teardown: persist the container's logs, then remove it.
    /// Failures are logged and swallowed; the entry is already unlinked.
    async fn teardown(&self, container: Container) {
        Metrics::inc(&self.metrics.teardowns);
        tokio::time::sleep(TEARDOWN_LOG_DELAY).await;

        let log_dir = self.state.lock().await.log_dir.clone();
        match self.backend.get_logs(&container).await {
            Ok(logs) => {
                let path = log_dir.join(format!("{}.log", container.name));
                if let Err(e) = tokio::fs::write(&path, logs).await {
                    Metrics::inc(&self.metrics.teardown_failures);
                    warn!(container = %container.name, error = %e, "teardown: failed to persist logs");
                }
            }
            Err(e) => {
                Metrics::inc(&self.metrics.teardown_failures);
                warn!(container = %container.name, error = %e, "teardown: failed to fetch logs");
            }
        }

        if let Err(e) = self.backend.remove(&container).await {
            Metrics::inc(&self.metrics.teardown_failures);
            warn!(container = %container.name, error = %e, "teardown: failed to remove container");
        } else {
            debug!(container = %container.name, "teardown: container removed");
        }
    }

    /// Remove leftover pool containers from a previous run, matched by the
    /// name prefix. Foreign containers are untouched.
    pub async fn kill_stragglers(&self) -> Result<usize, BackendError> {
        let all = self.backend.list_all().await?;
        let mut removed = 0;
        for container in all
            .into_iter()
            .filter(|c| c.name.starts_with(CONTAINER_PREFIX))
        {
            info!(container = %container.name, "removing straggler");
            if let Err(e) = self.backend.kill(&container).await {
                // Already stopped stragglers fail the kill; removal below
                // still applies.
                debug!(container = %container.name, error = %e, "straggler kill failed");
            }
            if let Err(e) = self.backend.remove(&container).await {
                warn!(container = %container.name, error = %e, "straggler remove failed");
                continue;
            }
            removed += 1;
        }
        Metrics::add(&self.metrics.stragglers_killed, removed as u64);
        Ok(removed)
    }

    // ─── Capabilities and introspection ──────────────────────────────────

    /// Size of a container's log, for callers holding a handle.
    pub async fn log_size(&self, container: &Container) -> Result<u64, BackendError> {
        self.backend.get_log_size(container).await
    }

    pub async fn snapshot(&self) -> PoolSnapshot {
        let state = self.state.lock().await;
        let mut buckets: Vec<BucketSnapshot> = state
            .buckets
            .iter()
            .map(|(key, names)| BucketSnapshot {
                key: key.to_string(),
                total: names.len(),
                idle: names
                    .iter()
                    .filter(|n| {
                        state
                            .containers
                            .get(*n)
                            .is_some_and(|i| i.state == ContainerState::Idle)
                    })
                    .count(),
            })
            .collect();
        buckets.sort_by(|a, b| a.key.cmp(&b.key));
        PoolSnapshot {
            active: state.count(ContainerState::Active),
            idle: state.count(ContainerState::Idle),
            starting: state.starting,
            buckets,
        }
    }

    // ─── Tunables ────────────────────────────────────────────────────────

    /// Set the idle-age threshold, in seconds. Negative values clamp to
    /// zero.
    pub async fn set_gc_threshold(&self, seconds: f64) {
        self.state.lock().await.gc_threshold = Duration::from_secs_f64(seconds.max(0.0));
    }

    /// Set the warm-reserve cap. Negative values clamp to zero.
    pub async fn set_max_idle(&self, n: i64) {
        self.state.lock().await.max_idle = n.max(0) as usize;
    }

    /// Set the live-container cap. Negative values clamp to zero.
    pub async fn set_max_active(&self, n: i64) {
        self.state.lock().await.max_active = n.max(0) as usize;
    }

    pub async fn set_log_dir(&self, dir: impl Into<PathBuf>) {
        self.state.lock().await.log_dir = dir.into();
    }

    // ─── Naming and environment ──────────────────────────────────────────

    fn next_name(&self, tag: &str) -> String {
        let seq = self.name_seq.fetch_add(1, Ordering::Relaxed);
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3fZ");
        format!(
            "{}{}_{}_{}_{}",
            CONTAINER_PREFIX,
            self.config.invoker_instance,
            seq,
            sanitize(tag),
            stamp
        )
    }

    fn base_env(&self) -> Vec<String> {
        vec![
            format!("EDGE_HOST={}", self.config.edge_host),
            format!("WHISK_VERSION={}", self.config.whisk_version),
        ]
    }

    fn action_env(&self, auth: &AuthKey) -> Vec<String> {
        let mut env = self.base_env();
        env.push(format!("AUTH_KEY={}", auth.compact()));
        env
    }
}

/// Engine names only allow `[a-zA-Z0-9_.-]`; everything else becomes `_`.
fn sanitize(tag: &str) -> String {
    tag.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Exec;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize};

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Create(String),
        Init(String),
        Pause(String),
        Unpause(String),
        Kill(String),
        Remove(String),
        Logs(String),
    }

    impl Event {
        fn container(&self) -> &str {
            match self {
                Event::Create(n)
                | Event::Init(n)
                | Event::Pause(n)
                | Event::Unpause(n)
                | Event::Kill(n)
                | Event::Remove(n)
                | Event::Logs(n) => n,
            }
        }
    }

    /// Scripted backend recording every call it receives.
    struct MockBackend {
        events: StdMutex<Vec<Event>>,
        id_seq: AtomicU32,
        create_delay: Duration,
        pause_delay: Duration,
        fail_create: AtomicBool,
        fail_init: AtomicBool,
        in_flight_creates: AtomicUsize,
        max_in_flight_creates: AtomicUsize,
        listed: Vec<Container>,
    }

    impl MockBackend {
        fn new() -> Self {
            Self {
                events: StdMutex::new(Vec::new()),
                id_seq: AtomicU32::new(0),
                create_delay: Duration::ZERO,
                pause_delay: Duration::ZERO,
                fail_create: AtomicBool::new(false),
                fail_init: AtomicBool::new(false),
                in_flight_creates: AtomicUsize::new(0),
                max_in_flight_creates: AtomicUsize::new(0),
                listed: Vec::new(),
            }
        }

        fn record(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        /// Most recent call that touched the named container.
        fn last_call_for(&self, name: &str) -> Option<Event> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|e| e.container() == name)
                .cloned()
        }
    }

    #[async_trait]
    impl ContainerBackend for MockBackend {
        async fn create(
            &self,
            name: &str,
            _image: &str,
            _opts: &CreateOptions,
        ) -> Result<Container, BackendError> {
            let n = self.in_flight_creates.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight_creates.fetch_max(n, Ordering::SeqCst);
            if !self.create_delay.is_zero() {
                tokio::time::sleep(self.create_delay).await;
            }
            self.in_flight_creates.fetch_sub(1, Ordering::SeqCst);
            self.record(Event::Create(name.to_string()));
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(BackendError::Runtime("create refused".into()));
            }
            let id = self.id_seq.fetch_add(1, Ordering::SeqCst);
            Ok(Container::new(format!("id-{id}"), name))
        }

        async fn init(
            &self,
            container: &Container,
            _payload: &Value,
        ) -> Result<RunResult, BackendError> {
            self.record(Event::Init(container.name.clone()));
            let now = Utc::now();
            let code = if self.fail_init.load(Ordering::SeqCst) { 1 } else { 0 };
            Ok(RunResult {
                started_at: now,
                ended_at: now,
                response: Some((code, "{}".into())),
            })
        }

        async fn pause(&self, container: &Container) -> Result<(), BackendError> {
            if !self.pause_delay.is_zero() {
                tokio::time::sleep(self.pause_delay).await;
            }
            self.record(Event::Pause(container.name.clone()));
            Ok(())
        }

        async fn unpause(&self, container: &Container) -> Result<(), BackendError> {
            self.record(Event::Unpause(container.name.clone()));
            Ok(())
        }

        async fn kill(&self, container: &Container) -> Result<(), BackendError> {
            self.record(Event::Kill(container.name.clone()));
            Ok(())
        }

        async fn remove(&self, container: &Container) -> Result<(), BackendError> {
            self.record(Event::Remove(container.name.clone()));
            Ok(())
        }

        async fn get_logs(&self, container: &Container) -> Result<String, BackendError> {
            self.record(Event::Logs(container.name.clone()));
            Ok("log line\n".into())
        }

        async fn get_log_size(&self, _container: &Container) -> Result<u64, BackendError> {
            Ok(9)
        }

        async fn list_all(&self) -> Result<Vec<Container>, BackendError> {
            Ok(self.listed.clone())
        }
    }

    static LOG_DIR_SEQ: AtomicU32 = AtomicU32::new(0);

    fn test_config(max_active: usize, max_idle: usize) -> Config {
        let dir = std::env::temp_dir().join(format!(
            "invokerd-test-{}-{}",
            std::process::id(),
            LOG_DIR_SEQ.fetch_add(1, Ordering::SeqCst)
        ));
        std::fs::create_dir_all(&dir).unwrap();

        let mut config = Config::default();
        config.max_active = max_active;
        config.max_idle = max_idle;
        config.log_dir = dir.to_string_lossy().into_owned();
        config
    }

    fn make_pool(max_active: usize, max_idle: usize) -> (Arc<Pool<MockBackend>>, Arc<MockBackend>) {
        make_pool_with(test_config(max_active, max_idle), MockBackend::new())
    }

    fn make_pool_with(
        config: Config,
        backend: MockBackend,
    ) -> (Arc<Pool<MockBackend>>, Arc<MockBackend>) {
        let backend = Arc::new(backend);
        let pool = Arc::new(Pool::new(
            Arc::clone(&backend),
            Arc::new(config),
            Arc::new(Metrics::new()),
        ));
        (pool, backend)
    }

    fn auth() -> AuthKey {
        AuthKey {
            uuid: "tester".into(),
            key: "k3y".into(),
        }
    }

    fn action(name: &str) -> Action {
        Action {
            namespace: "ns".into(),
            name: name.into(),
            rev: "1-a".into(),
            exec: Exec {
                kind: "nodejs".into(),
                image: None,
                code: Some("function main() {}".into()),
                main: None,
            },
        }
    }

    // ─── Warm reuse ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn warm_reuse_returns_same_container() {
        let (pool, backend) = make_pool(2, 1);

        let (c1, init) = pool.get_action(&action("hello"), &auth()).await.unwrap();
        assert!(init.is_some());
        pool.put_back(&c1, false).await;

        let (c2, init) = pool.get_action(&action("hello"), &auth()).await.unwrap();
        assert_eq!(c1, c2);
        // A cache hit never re-runs init.
        assert!(init.is_none());
        assert_eq!(
            backend.events().iter().filter(|e| matches!(e, Event::Init(_))).count(),
            1
        );
    }

    #[tokio::test]
    async fn distinct_revisions_get_distinct_containers() {
        let (pool, _) = make_pool(4, 4);

        let (c1, _) = pool.get_action(&action("hello"), &auth()).await.unwrap();
        pool.put_back(&c1, false).await;

        let mut updated = action("hello");
        updated.rev = "2-b".into();
        let (c2, _) = pool.get_action(&updated, &auth()).await.unwrap();
        assert_ne!(c1, c2);
    }

    #[tokio::test]
    async fn unpause_is_last_call_before_handout() {
        let (pool, backend) = make_pool(2, 1);

        let (c1, _) = pool.get_action(&action("hello"), &auth()).await.unwrap();
        pool.put_back(&c1, false).await;
        assert_eq!(backend.last_call_for(&c1.name), Some(Event::Pause(c1.name.clone())));

        let (c2, _) = pool.get_action(&action("hello"), &auth()).await.unwrap();
        assert_eq!(backend.last_call_for(&c2.name), Some(Event::Unpause(c2.name.clone())));
    }

    // ─── Capacity eviction on return ─────────────────────────────────────

    #[tokio::test]
    async fn put_back_evicts_oldest_idle_when_reserve_full() {
        let (pool, backend) = make_pool(2, 1);

        let (c1, _) = pool.get_action(&action("one"), &auth()).await.unwrap();
        let (c2, _) = pool.get_action(&action("two"), &auth()).await.unwrap();

        pool.put_back(&c1, false).await;
        let snap = pool.snapshot().await;
        assert_eq!((snap.active, snap.idle), (1, 1));

        pool.put_back(&c2, false).await;
        let snap = pool.snapshot().await;
        assert_eq!((snap.active, snap.idle), (0, 1));
        assert_eq!(snap.buckets.len(), 1);

        // The oldest idle container was torn down and its log persisted.
        assert!(backend.events().contains(&Event::Remove(c1.name.clone())));
        let log_path = std::path::Path::new(&pool.config.log_dir).join(format!("{}.log", c1.name));
        assert_eq!(std::fs::read_to_string(log_path).unwrap(), "log line\n");
    }

    #[tokio::test]
    async fn put_back_never_evicts_itself() {
        let (pool, backend) = make_pool(2, 1);

        let (c1, _) = pool.get_action(&action("one"), &auth()).await.unwrap();
        pool.put_back(&c1, false).await;

        // Reserve is at cap but c1 is the container being returned on the
        // second cycle; it must survive.
        let (c1_again, _) = pool.get_action(&action("one"), &auth()).await.unwrap();
        assert_eq!(c1, c1_again);
        pool.put_back(&c1_again, false).await;

        assert!(!backend.events().contains(&Event::Remove(c1.name.clone())));
        assert_eq!(pool.snapshot().await.idle, 1);
    }

    // ─── Active cap and serialized creation ──────────────────────────────

    #[tokio::test]
    async fn active_cap_blocks_until_put_back() {
        let (pool, _) = make_pool(1, 1);

        let (c1, _) = pool.get_action(&action("one"), &auth()).await.unwrap();

        let contender = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.get_action(&action("two"), &auth()).await })
        };

        // The contender sees Busy and keeps retrying while c1 is out.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!contender.is_finished());

        pool.put_back(&c1, false).await;
        let got = contender.await.unwrap();
        assert!(got.is_some());
    }

    #[tokio::test]
    async fn creation_is_serialized_pool_wide() {
        let mut backend = MockBackend::new();
        backend.create_delay = Duration::from_millis(100);
        let (pool, backend) = make_pool_with(test_config(4, 4), backend);

        let mut tasks = Vec::new();
        for name in ["a", "b", "c"] {
            let pool = Arc::clone(&pool);
            tasks.push(tokio::spawn(async move {
                pool.get_action(&action(name), &auth()).await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_some());
        }

        assert_eq!(backend.max_in_flight_creates.load(Ordering::SeqCst), 1);
    }

    // ─── Age GC ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn periodic_gc_evicts_by_age() {
        let mut config = test_config(2, 2);
        config.gc_threshold = 0.1;
        config.gc_frequency = 0.05;
        let (pool, backend) = make_pool_with(config, MockBackend::new());

        let (c1, _) = pool.get_action(&action("one"), &auth()).await.unwrap();
        pool.put_back(&c1, false).await;

        let gc = tokio::spawn(Arc::clone(&pool).gc_loop());
        tokio::time::sleep(Duration::from_millis(500)).await;
        gc.abort();

        assert!(backend.events().contains(&Event::Remove(c1.name.clone())));
        assert_eq!(pool.snapshot().await.idle, 0);

        let (c2, init) = pool.get_action(&action("one"), &auth()).await.unwrap();
        assert_ne!(c1, c2);
        assert!(init.is_some());
    }

    #[tokio::test]
    async fn gc_never_touches_active_containers() {
        let mut config = test_config(2, 2);
        config.gc_threshold = 0.0;
        let (pool, backend) = make_pool_with(config, MockBackend::new());

        let (c1, _) = pool.get_action(&action("one"), &auth()).await.unwrap();
        assert_eq!(pool.perform_gc().await, 0);
        assert!(!backend.events().contains(&Event::Remove(c1.name.clone())));
        assert_eq!(pool.snapshot().await.active, 1);
    }

    #[tokio::test]
    async fn force_gc_sweeps_everything_idle_once() {
        let (pool, _) = make_pool(4, 4);

        let (c1, _) = pool.get_action(&action("one"), &auth()).await.unwrap();
        let (c2, _) = pool.get_action(&action("two"), &auth()).await.unwrap();
        pool.put_back(&c1, false).await;
        pool.put_back(&c2, false).await;

        assert_eq!(pool.force_gc().await, 2);
        // No intervening activity: the second sweep is a no-op.
        assert_eq!(pool.force_gc().await, 0);
    }

    #[tokio::test]
    async fn disabled_gc_skips_eviction_until_reenabled() {
        let (pool, _) = make_pool(4, 1);
        pool.disable_gc();

        let (c1, _) = pool.get_action(&action("one"), &auth()).await.unwrap();
        let (c2, _) = pool.get_action(&action("two"), &auth()).await.unwrap();
        pool.put_back(&c1, false).await;
        pool.put_back(&c2, false).await;

        // Capacity eviction is off along with the sweeps.
        assert_eq!(pool.snapshot().await.idle, 2);
        assert_eq!(pool.perform_gc().await, 0);

        pool.enable_gc();
        pool.set_gc_threshold(0.0).await;
        assert_eq!(pool.perform_gc().await, 2);
    }

    // ─── Delete and failure paths ────────────────────────────────────────

    #[tokio::test]
    async fn put_back_delete_tears_down_and_next_get_creates() {
        let (pool, backend) = make_pool(2, 2);

        let (c1, _) = pool.get_action(&action("one"), &auth()).await.unwrap();
        pool.put_back(&c1, true).await;

        assert!(backend.events().contains(&Event::Remove(c1.name.clone())));
        let snap = pool.snapshot().await;
        assert_eq!((snap.active, snap.idle), (0, 0));

        let (c2, init) = pool.get_action(&action("one"), &auth()).await.unwrap();
        assert_ne!(c1, c2);
        assert!(init.is_some());
    }

    #[tokio::test]
    async fn create_failure_surfaces_none_and_frees_the_slot() {
        let (pool, backend) = make_pool(2, 2);
        backend.fail_create.store(true, Ordering::SeqCst);

        assert!(pool.get_action(&action("one"), &auth()).await.is_none());

        // The starting slot was released; a later attempt succeeds.
        backend.fail_create.store(false, Ordering::SeqCst);
        assert!(pool.get_action(&action("one"), &auth()).await.is_some());
        assert_eq!(pool.snapshot().await.starting, 0);
    }

    #[tokio::test]
    async fn failed_init_is_surfaced_and_container_not_reused() {
        let (pool, backend) = make_pool(2, 2);
        backend.fail_init.store(true, Ordering::SeqCst);

        let (c1, init) = pool.get_action(&action("one"), &auth()).await.unwrap();
        assert!(!init.unwrap().ok());

        // On return the container leaves the pool instead of going warm.
        pool.put_back(&c1, false).await;
        assert!(backend.events().contains(&Event::Remove(c1.name.clone())));
        assert_eq!(pool.snapshot().await.idle, 0);
    }

    #[tokio::test]
    async fn failed_init_container_reused_when_configured() {
        let mut config = test_config(2, 2);
        config.reuse_after_failed_init = true;
        let backend = MockBackend::new();
        backend.fail_init.store(true, Ordering::SeqCst);
        let (pool, _) = make_pool_with(config, backend);

        let (c1, init) = pool.get_action(&action("one"), &auth()).await.unwrap();
        assert!(!init.unwrap().ok());

        pool.put_back(&c1, false).await;
        let (c2, init) = pool.get_action(&action("one"), &auth()).await.unwrap();
        assert_eq!(c1, c2);
        assert!(init.is_none());
    }

    #[tokio::test]
    async fn put_back_of_unknown_container_is_rejected() {
        let (pool, backend) = make_pool(2, 2);

        pool.put_back(&Container::new("id-x", "nonsense"), false).await;

        assert!(backend.events().is_empty());
        let snap = pool.snapshot().await;
        assert_eq!((snap.active, snap.idle), (0, 0));
    }

    #[tokio::test]
    async fn double_put_back_is_rejected() {
        let (pool, _) = make_pool(2, 2);

        let (c1, _) = pool.get_action(&action("one"), &auth()).await.unwrap();
        pool.put_back(&c1, false).await;
        pool.put_back(&c1, false).await;

        assert_eq!(pool.snapshot().await.idle, 1);
    }

    #[tokio::test]
    async fn concurrent_double_put_back_only_one_wins() {
        // A slow pause widens the window between the Active check and the
        // state transition; the loser must be rejected, not re-idled.
        let mut backend = MockBackend::new();
        backend.pause_delay = Duration::from_millis(50);
        let (pool, _) = make_pool_with(test_config(2, 2), backend);

        let (c1, _) = pool.get_action(&action("one"), &auth()).await.unwrap();

        let first = {
            let pool = Arc::clone(&pool);
            let c = c1.clone();
            tokio::spawn(async move { pool.put_back(&c, false).await })
        };
        let second = {
            let pool = Arc::clone(&pool);
            let c = c1.clone();
            tokio::spawn(async move { pool.put_back(&c, false).await })
        };
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(pool.snapshot().await.idle, 1);
        assert_eq!(pool.metrics.invariant_violations.load(Ordering::SeqCst), 1);
    }

    // ─── Straggler cleanup ───────────────────────────────────────────────

    #[tokio::test]
    async fn kill_stragglers_matches_prefix_only() {
        let mut backend = MockBackend::new();
        backend.listed = vec![
            Container::new("id-1", "wsk0_1_old_a"),
            Container::new("id-2", "wsk0_2_old_b"),
            Container::new("id-3", "other_service"),
        ];
        let (pool, backend) = make_pool_with(test_config(2, 2), backend);

        assert_eq!(pool.kill_stragglers().await.unwrap(), 2);

        let events = backend.events();
        assert!(events.contains(&Event::Remove("wsk0_1_old_a".into())));
        assert!(events.contains(&Event::Remove("wsk0_2_old_b".into())));
        assert!(!events.iter().any(|e| e.container() == "other_service"));
    }

    // ─── Invariants, tunables, naming ────────────────────────────────────

    #[tokio::test]
    async fn counts_stay_consistent_across_operations() {
        let (pool, _) = make_pool(4, 2);

        let (c1, _) = pool.get_action(&action("one"), &auth()).await.unwrap();
        let (c2, _) = pool.get_action(&action("two"), &auth()).await.unwrap();
        let (c3, _) = pool.get_action(&action("three"), &auth()).await.unwrap();
        pool.put_back(&c1, false).await;
        pool.put_back(&c2, true).await;

        let snap = pool.snapshot().await;
        let total: usize = snap.buckets.iter().map(|b| b.total).sum();
        assert_eq!(snap.active + snap.idle, total);
        assert_eq!((snap.active, snap.idle, snap.starting), (1, 1, 0));
        assert!(snap.buckets.iter().all(|b| b.total > 0));

        pool.put_back(&c3, false).await;
        assert!(pool.snapshot().await.idle <= 2);
    }

    #[tokio::test]
    async fn zero_max_idle_keeps_no_warm_reserve() {
        let (pool, backend) = make_pool(2, 2);
        pool.set_max_idle(-3).await; // clamps to 0

        let (c1, _) = pool.get_action(&action("one"), &auth()).await.unwrap();
        pool.put_back(&c1, false).await;

        assert!(backend.events().contains(&Event::Remove(c1.name.clone())));
        assert_eq!(pool.snapshot().await.idle, 0);
    }

    #[tokio::test]
    async fn negative_gc_threshold_clamps_to_immediate_expiry() {
        let (pool, _) = make_pool(2, 2);
        pool.set_gc_threshold(-60.0).await;

        let (c1, _) = pool.get_action(&action("one"), &auth()).await.unwrap();
        pool.put_back(&c1, false).await;
        assert_eq!(pool.perform_gc().await, 1);
    }

    #[tokio::test]
    async fn container_names_carry_prefix_instance_and_sequence() {
        let (pool, _) = make_pool(4, 4);

        let (c1, _) = pool.get_action(&action("my/action"), &auth()).await.unwrap();
        let (c2, _) = pool.get_action(&action("other"), &auth()).await.unwrap();

        assert!(c1.name.starts_with("wsk0_0_"));
        assert!(c2.name.starts_with("wsk0_1_"));
        // Slashes in the fqn are sanitized away.
        assert!(c1.name.contains("ns_my_action"));
    }

    #[tokio::test]
    async fn raw_image_containers_skip_init() {
        let (pool, backend) = make_pool(2, 2);

        let c = pool
            .get_by_image_name("whisk/dockerskeleton", &["run".into()])
            .await
            .unwrap();

        assert!(!backend.events().iter().any(|e| matches!(e, Event::Init(_))));
        pool.put_back(&c, false).await;
        let again = pool
            .get_by_image_name("whisk/dockerskeleton", &["run".into()])
            .await
            .unwrap();
        assert_eq!(c, again);
    }

    #[tokio::test]
    async fn log_size_capability_delegates_to_backend() {
        let (pool, _) = make_pool(2, 2);
        let (c1, _) = pool.get_action(&action("one"), &auth()).await.unwrap();
        assert_eq!(pool.log_size(&c1).await.unwrap(), 9);
    }
}
