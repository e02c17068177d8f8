// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session Pool (spec.md §4.9): the set of live Sessions for a workspace,
//! plus the background autoscaler.
//!
//! The single-writer map-of-entries shape is grounded on
//! `engine/src/scheduler.rs`'s `Scheduler` (a locked collection owned by one
//! struct, mutated only through its own methods); the periodic background
//! pass is grounded on `daemon/src/lifecycle/reconcile.rs`'s
//! `reconcile_state` shape, narrowed to a `tokio::select!` tick racing a
//! shutdown oneshot like every other background task in this workspace.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use relay_bus::EventBus;
use relay_core::{Clock, SessionConfig, SessionId, SessionState, Topic, WorkspaceId};
use relay_recovery::CircuitBreaker;
use relay_session::Session;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool is at max_size and no session is evictable")]
    PoolFull,
    #[error("session creation is rejected while the circuit breaker is open")]
    PoolCold,
    #[error("no session with that id is tracked by this pool")]
    UnknownSession,
}

/// Constructs a fresh `Session` bound to a newly spawned subprocess. Kept as
/// a trait so `Pool` never names a concrete `Sandbox`/`ProcessSpec`, matching
/// the `SessionStore`/adapter seam convention used throughout this
/// workspace: capability traits injected at construction, no dependency on
/// what sits behind them.
#[async_trait]
pub trait SessionFactory<C: Clock>: Send + Sync {
    async fn create(&self, workspace_id: WorkspaceId, session_id: SessionId, config: SessionConfig) -> Result<Arc<Session<C>>, PoolError>;
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub autoscale_interval: Duration,
}

impl From<&relay_core::config::PoolConfig> for PoolConfig {
    fn from(config: &relay_core::config::PoolConfig) -> Self {
        Self {
            min_size: config.min_size,
            max_size: config.max_size,
            scale_up_threshold: config.scale_up_threshold,
            scale_down_threshold: config.scale_down_threshold,
            autoscale_interval: config.autoscale_interval,
        }
    }
}

struct Background {
    shutdown: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

struct Entry<C: Clock> {
    session: Arc<Session<C>>,
}

/// One workspace's set of live Sessions, routed by compatibility and load.
/// `Pool` does not itself know how to build a Session: it asks its
/// `SessionFactory` and otherwise only reads state a `Session` already
/// exposes (`state()`, `last_active()`) plus the Bus's subscriber counts for
/// load.
pub struct Pool<C: Clock> {
    workspace_id: WorkspaceId,
    clock: C,
    bus: Arc<EventBus>,
    breaker: Arc<CircuitBreaker>,
    factory: Arc<dyn SessionFactory<C>>,
    config: Mutex<PoolConfig>,
    entries: Mutex<HashMap<SessionId, Entry<C>>>,
    background: Mutex<Option<Background>>,
    next_id: Mutex<u64>,
}

impl<C: Clock + 'static> Pool<C> {
    pub fn new(workspace_id: WorkspaceId, clock: C, bus: Arc<EventBus>, breaker: Arc<CircuitBreaker>, factory: Arc<dyn SessionFactory<C>>, config: PoolConfig) -> Arc<Self> {
        let pool = Arc::new(Self {
            workspace_id,
            clock,
            bus,
            breaker,
            factory,
            config: Mutex::new(config),
            entries: Mutex::new(HashMap::new()),
            background: Mutex::new(None),
            next_id: Mutex::new(0),
        });
        pool.spawn_autoscaler();
        pool
    }

    pub fn reconfigure(&self, config: PoolConfig) {
        *self.config.lock() = config;
    }

    pub fn size(&self) -> usize {
        self.entries.lock().len()
    }

    /// Snapshot of every Session this pool currently tracks, for callers
    /// (the daemon's listener) that need to look one up by id; routing
    /// itself never uses this, since `acquire` always selects by
    /// compatibility and load rather than identifier.
    pub fn sessions(&self) -> Vec<Arc<Session<C>>> {
        self.entries.lock().values().map(|entry| entry.session.clone()).collect()
    }

    /// Returns an existing compatible `Idle` Session chosen by weighted
    /// routing, or asks the factory to create one if none fits.
    pub async fn acquire(&self, config: SessionConfig) -> Result<Arc<Session<C>>, PoolError> {
        self.evict_failed();

        if let Some(session) = self.pick_idle_candidate(&config) {
            return Ok(session);
        }

        let pool_size = self.size();
        let max_size = self.config.lock().max_size;
        if pool_size >= max_size && self.evict_one_idle().is_none() {
            return Err(PoolError::PoolFull);
        }

        if self.breaker.state(self.clock.now()).state == relay_core::CircuitState::Open {
            return Err(PoolError::PoolCold);
        }

        let session_id = self.fresh_session_id();
        let session = self.factory.create(self.workspace_id.clone(), session_id.clone(), config).await?;
        self.bus.register_session(session_id.clone(), self.workspace_id.clone());
        self.entries.lock().insert(session_id, Entry { session: session.clone() });
        Ok(session)
    }

    /// `Active -> Idle` (spec.md §4.9 `Release`).
    pub fn release(&self, session: &Arc<Session<C>>) {
        session.release();
    }

    /// Force-closes a tracked Session and removes it from the pool.
    pub async fn close(&self, session_id: &SessionId, graceful_deadline: Duration) -> Result<(), PoolError> {
        let entry = self.entries.lock().remove(session_id).ok_or(PoolError::UnknownSession)?;
        self.bus.unregister_session(session_id.clone());
        self.bus.close_topic(&Topic::Session(session_id.clone()));
        let _ = entry.session.close(graceful_deadline).await;
        Ok(())
    }

    /// Removes any Session that has transitioned to `Failed` since it was
    /// last observed (spec.md §4.9: "the Pool does not reuse its
    /// identifier").
    fn evict_failed(&self) {
        let mut entries = self.entries.lock();
        let failed: Vec<SessionId> = entries
            .iter()
            .filter(|(_, entry)| entry.session.state() == SessionState::Failed)
            .map(|(id, _)| id.clone())
            .collect();
        for id in failed {
            entries.remove(&id);
            self.bus.unregister_session(id.clone());
            self.bus.close_topic(&Topic::Session(id));
        }
    }

    /// Weighted-by-`1/(load+1)` selection among compatible `Idle` candidates,
    /// falling back to least-recently-used when every candidate's load ties
    /// (the common case, since most Idle sessions have no subscribers).
    fn pick_idle_candidate(&self, requested: &SessionConfig) -> Option<Arc<Session<C>>> {
        let entries = self.entries.lock();
        let candidates: Vec<Arc<Session<C>>> = entries
            .values()
            .map(|entry| entry.session.clone())
            .filter(|session| session.state() == SessionState::Idle && session.config().compatible_with(requested))
            .collect();
        drop(entries);
        if candidates.is_empty() {
            return None;
        }

        let weights: Vec<f64> = candidates
            .iter()
            .map(|session| {
                let load = self.bus.topic_subscriber_count(&Topic::Session(session.id())) as f64;
                1.0 / (load + 1.0)
            })
            .collect();

        let all_tied = weights.iter().all(|w| (*w - weights[0]).abs() < f64::EPSILON);
        if all_tied {
            return candidates.into_iter().min_by_key(|session| session.last_active());
        }

        let total: f64 = weights.iter().sum();
        let mut pick = rand::thread_rng().gen_range(0.0..total);
        for (session, weight) in candidates.into_iter().zip(weights) {
            if pick < weight {
                return Some(session);
            }
            pick -= weight;
        }
        None
    }

    /// Evicts the oldest `Idle` Session (spec.md §4.9 eviction ordering:
    /// "`Idle` oldest first, then `Active` lowest-load, never
    /// `Pending`/`Starting`"). Used both by a saturated `acquire` and by
    /// `autoscale`'s scale-down pass.
    fn evict_one_idle(&self) -> Option<SessionId> {
        let victim = {
            let entries = self.entries.lock();
            entries
                .values()
                .filter(|entry| entry.session.state() == SessionState::Idle)
                .min_by_key(|entry| entry.session.last_active())
                .map(|entry| entry.session.id())
        };
        if let Some(id) = &victim {
            self.entries.lock().remove(id);
            self.bus.unregister_session(id.clone());
            self.bus.close_topic(&Topic::Session(id.clone()));
        }
        victim
    }

    fn fresh_session_id(&self) -> SessionId {
        let mut next = self.next_id.lock();
        *next += 1;
        SessionId::new(format!("{}-{}", self.workspace_id.as_str(), *next))
    }

    fn active_count(&self) -> usize {
        self.entries.lock().values().filter(|entry| entry.session.state() == SessionState::Active).count()
    }

    fn stop_background(&self) {
        if let Some(background) = self.background.lock().take() {
            let _ = background.shutdown.send(());
            background.task.abort();
        }
    }

    fn spawn_autoscaler(self: &Arc<Self>) {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let pool = self.clone();
        let task = tokio::spawn(autoscale(pool, shutdown_rx));
        *self.background.lock() = Some(Background { shutdown: shutdown_tx, task });
    }
}

impl<C: Clock> Drop for Pool<C> {
    fn drop(&mut self) {
        self.stop_background();
    }
}

/// Periodic scale-up/scale-down pass (spec.md §4.9 `Autoscale`).
/// Scale-up only asks the factory to create one Session per tick even if
/// still saturated afterward; the next tick grows it further, matching the
/// "then to 4 on next tick if still saturated" scenario.
async fn autoscale<C: Clock + 'static>(pool: Arc<Pool<C>>, mut shutdown_rx: oneshot::Receiver<()>) {
    loop {
        let interval = pool.config.lock().autoscale_interval;
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => {
                debug!("autoscaler stopping");
                break;
            }
            _ = tokio::time::sleep(interval) => {
                let (min_size, max_size, scale_up, scale_down) = {
                    let config = pool.config.lock();
                    (config.min_size, config.max_size, config.scale_up_threshold, config.scale_down_threshold)
                };
                let pool_size = pool.size().max(1);
                let utilization = pool.active_count() as f64 / pool_size as f64;

                if utilization > scale_up && pool.size() < max_size {
                    info!(utilization, pool_size, "autoscaler growing pool");
                    // Best-effort: a transient factory failure just skips this tick.
                    let _ = pool.acquire(default_autoscale_config()).await;
                } else if utilization < scale_down && pool.size() > min_size {
                    if pool.evict_one_idle().is_none() {
                        warn!("autoscaler wanted to shrink but found no evictable idle session");
                    } else {
                        info!(utilization, pool_size, "autoscaler shrinking pool");
                    }
                }
            }
        }
    }
}

/// Placeholder config used only to pre-warm a pool slot with no specific
/// caller request yet; the first real `acquire` for a distinct config always
/// creates its own session since compatibility requires an exact match.
fn default_autoscale_config() -> SessionConfig {
    SessionConfig {
        system_prompt: String::new(),
        turn_budget: 0,
        tool_allowlist: std::collections::BTreeSet::new(),
        environment: std::collections::BTreeMap::new(),
        working_directory: std::path::PathBuf::from("."),
        oauth_token: None,
        max_idle: Duration::from_secs(600),
        max_lifetime: Duration::from_secs(3600),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::FakeClock;
    use relay_sandbox::FakeSandbox;
    use relay_stream::{Pipeline, PipelineConfig};
    use relay_supervisor::{HealthPolicy, Supervisor};
    use std::collections::{BTreeMap, BTreeSet};
    use std::path::PathBuf;

    struct TestFactory;

    #[async_trait]
    impl SessionFactory<FakeClock> for TestFactory {
        async fn create(&self, workspace_id: WorkspaceId, session_id: SessionId, config: SessionConfig) -> Result<Arc<Session<FakeClock>>, PoolError> {
            let clock = FakeClock::new();
            let bus = Arc::new(EventBus::new());
            let pipeline = Arc::new(Pipeline::new(
                clock.clone(),
                bus,
                PipelineConfig { buffer_size: 16, stall_deadline: Duration::from_millis(200), max_line_bytes: 1024 },
            ));
            let sandbox = Arc::new(FakeSandbox::new());
            let supervisor = Arc::new(Supervisor::new(clock.clone(), sandbox, pipeline, HealthPolicy::default()));
            Ok(Session::new(session_id, workspace_id, clock, supervisor, config))
        }
    }

    fn session_config() -> SessionConfig {
        SessionConfig {
            system_prompt: "be helpful".to_string(),
            turn_budget: 10,
            tool_allowlist: BTreeSet::new(),
            environment: BTreeMap::new(),
            working_directory: PathBuf::from("."),
            oauth_token: None,
            max_idle: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(3600),
        }
    }

    fn pool_config() -> PoolConfig {
        PoolConfig { min_size: 1, max_size: 4, scale_up_threshold: 0.8, scale_down_threshold: 0.3, autoscale_interval: Duration::from_secs(3600) }
    }

    fn breaker() -> Arc<CircuitBreaker> {
        let config = relay_recovery::BreakerConfig::from(&relay_core::config::BreakerConfig::default());
        CircuitBreaker::new(config, std::time::Instant::now())
    }

    fn pool() -> Arc<Pool<FakeClock>> {
        Pool::new(WorkspaceId::new("w1"), FakeClock::new(), Arc::new(EventBus::new()), breaker(), Arc::new(TestFactory), pool_config())
    }

    #[tokio::test]
    async fn acquire_creates_a_session_when_none_exists() {
        let pool = pool();
        let session = pool.acquire(session_config()).await.expect("acquire");
        assert_eq!(session.state(), SessionState::Pending);
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn acquire_reuses_a_compatible_idle_session() {
        let pool = pool();
        let first = pool.acquire(session_config()).await.expect("acquire");
        first.note_first_message(1);
        first.release();
        assert_eq!(first.state(), SessionState::Idle);

        let second = pool.acquire(session_config()).await.expect("acquire");
        assert_eq!(second.id(), first.id());
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn acquire_creates_a_new_session_for_an_incompatible_request() {
        let pool = pool();
        let first = pool.acquire(session_config()).await.expect("acquire");
        first.release();

        let mut other = session_config();
        other.system_prompt = "be terse".to_string();
        let second = pool.acquire(other).await.expect("acquire");
        assert_ne!(second.id(), first.id());
        assert_eq!(pool.size(), 2);
    }

    #[tokio::test]
    async fn pool_full_when_at_max_size_with_nothing_evictable() {
        let mut config = pool_config();
        config.max_size = 1;
        let pool = Pool::new(WorkspaceId::new("w1"), FakeClock::new(), Arc::new(EventBus::new()), breaker(), Arc::new(TestFactory), config);
        let first = pool.acquire(session_config()).await.expect("acquire");
        first.note_first_message(1);
        // first stays Active (never released), so it cannot be evicted.

        let mut other = session_config();
        other.system_prompt = "different".to_string();
        assert_eq!(pool.acquire(other).await, Err(PoolError::PoolFull));
    }

    #[tokio::test]
    async fn release_demotes_a_session_back_to_idle() {
        let pool = pool();
        let session = pool.acquire(session_config()).await.expect("acquire");
        session.note_first_message(1);
        assert_eq!(session.state(), SessionState::Active);
        pool.release(&session);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn close_removes_the_session_from_the_pool() {
        let pool = pool();
        let session = pool.acquire(session_config()).await.expect("acquire");
        let id = session.id();
        pool.close(&id, Duration::from_millis(10)).await.expect("close");
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.close(&id, Duration::from_millis(10)).await, Err(PoolError::UnknownSession));
    }

    #[tokio::test]
    async fn failed_sessions_are_evicted_on_next_acquire() {
        let pool = pool();
        let session = pool.acquire(session_config()).await.expect("acquire");
        session.fail();

        let second = pool.acquire(session_config()).await.expect("acquire");
        assert_ne!(second.id(), session.id());
        assert_eq!(pool.size(), 1);
    }
}
