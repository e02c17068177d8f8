// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wires the four subsystems together into one running daemon: one shared
//! `EventBus`, one `CircuitBreaker`-gated `SessionFactory` that spawns real
//! `claude` subprocesses, and one `Pool` per workspace created on first use.

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_bus::EventBus;
use relay_core::{Clock, SessionConfig, SessionId, SystemClock, WorkspaceId};
use relay_pool::{Pool, PoolConfig, PoolError, SessionFactory};
use relay_recovery::{BreakerConfig, CircuitBreaker};
use relay_sandbox::{ProcessSpec, SubprocessSandbox};
use relay_session::Session;
use relay_stream::{Pipeline, PipelineConfig};
use relay_supervisor::{HealthPolicy, Supervisor};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

/// Builds the real `Supervisor`/`Pipeline`/`Sandbox` stack behind every
/// Session a Pool creates, bridging the Pipeline's published messages back
/// onto the Session's own `bytes_in`/activity bookkeeping.
pub struct SubprocessSessionFactory {
    clock: SystemClock,
    bus: Arc<EventBus>,
    pipeline_config: PipelineConfig,
    health_policy: HealthPolicy,
    command: String,
}

impl SubprocessSessionFactory {
    pub fn new(clock: SystemClock, bus: Arc<EventBus>, pipeline_config: PipelineConfig, health_policy: HealthPolicy, command: String) -> Self {
        Self { clock, bus, pipeline_config, health_policy, command }
    }
}

#[async_trait]
impl SessionFactory<SystemClock> for SubprocessSessionFactory {
    async fn create(&self, workspace_id: WorkspaceId, session_id: SessionId, config: SessionConfig) -> Result<Arc<Session<SystemClock>>, PoolError> {
        let pipeline = Arc::new(Pipeline::new(self.clock.clone(), self.bus.clone(), self.pipeline_config.clone()));
        let sandbox: Arc<dyn relay_sandbox::Sandbox> = Arc::new(SubprocessSandbox);
        let supervisor = Arc::new(Supervisor::new(self.clock.clone(), sandbox, pipeline, self.health_policy.clone()));

        let spec = ProcessSpec {
            command: self.command.clone(),
            args: Vec::new(),
            environment: config.environment.clone(),
            working_directory: config.working_directory.clone(),
        };
        supervisor.start(spec, session_id.clone()).await.map_err(|e| {
            warn!(session = %session_id, error = %e, "failed to spawn subprocess for new session");
            PoolError::PoolCold
        })?;

        let session = Session::new(session_id.clone(), workspace_id.clone(), self.clock.clone(), supervisor, config);
        self.bus.register_session(session_id.clone(), workspace_id);
        spawn_activity_bridge(self.bus.clone(), session.clone());
        Ok(session)
    }
}

/// Subscribes to a Session's own topic purely to drive its `bytes_in`/
/// `Pending -> Active` bookkeeping; real consumers (CLI log followers)
/// subscribe to the same topic independently and are unaffected by this.
fn spawn_activity_bridge(bus: Arc<EventBus>, session: Arc<Session<SystemClock>>) {
    tokio::spawn(async move {
        let topic = relay_core::Topic::Session(session.id());
        let receiver = bus.subscribe(topic, 256, relay_core::BackpressurePolicy::DropOldest);
        let mut first = true;
        while let Some(message) = receiver.recv().await {
            let bytes = serde_json::to_vec(&message).map(|v| v.len()).unwrap_or(0);
            if first {
                session.note_first_message(bytes);
                first = false;
            } else {
                session.note_message(bytes);
            }
            if session.state().is_terminal() {
                break;
            }
        }
    });
}

/// Per-workspace pool plus the pieces needed to build one lazily.
pub struct AppState {
    clock: SystemClock,
    bus: Arc<EventBus>,
    breaker: Arc<CircuitBreaker>,
    pool_config: PoolConfig,
    factory: Arc<SubprocessSessionFactory>,
    session_max_idle: std::time::Duration,
    session_max_lifetime: std::time::Duration,
    pools: Mutex<HashMap<WorkspaceId, Arc<Pool<SystemClock>>>>,
}

impl AppState {
    pub fn new(config: &relay_core::Config, command: String) -> Self {
        let clock = SystemClock;
        let bus = Arc::new(EventBus::new());
        let breaker = CircuitBreaker::new(BreakerConfig::from(&config.breaker), clock.now());
        let pipeline_config = PipelineConfig::from(&config.pipeline);
        let health_policy = HealthPolicy::from(&config.supervisor);
        let factory = Arc::new(SubprocessSessionFactory::new(clock.clone(), bus.clone(), pipeline_config, health_policy, command));
        Self {
            clock,
            bus,
            breaker,
            pool_config: PoolConfig::from(&config.pool),
            factory,
            session_max_idle: config.session.max_idle,
            session_max_lifetime: config.session.max_lifetime,
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn pool_for(&self, workspace_id: &WorkspaceId) -> Arc<Pool<SystemClock>> {
        if let Some(pool) = self.pools.lock().get(workspace_id).cloned() {
            return pool;
        }
        let pool = Pool::new(workspace_id.clone(), self.clock.clone(), self.bus.clone(), self.breaker.clone(), self.factory.clone(), self.pool_config);
        self.pools.lock().insert(workspace_id.clone(), pool.clone());
        info!(workspace = %workspace_id, "pool created");
        pool
    }

    pub fn default_session_config(&self, system_prompt: String, working_directory: std::path::PathBuf) -> SessionConfig {
        SessionConfig {
            system_prompt,
            turn_budget: 0,
            tool_allowlist: std::collections::BTreeSet::new(),
            environment: BTreeMap::new(),
            working_directory,
            oauth_token: None,
            max_idle: self.session_max_idle,
            max_lifetime: self.session_max_lifetime,
        }
    }

    pub fn pool_sizes(&self) -> HashMap<WorkspaceId, usize> {
        self.pools.lock().iter().map(|(id, pool)| (id.clone(), pool.size())).collect()
    }
}
