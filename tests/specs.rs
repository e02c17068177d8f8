// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenarios wiring the Process Supervisor, Stream Pipeline,
//! Session Pool, and Error Recovery subsystems together through real
//! production code, with only the subprocess boundary faked
//! (`relay_sandbox::FakeSandbox`). Durations that the literal scenarios
//! state in seconds are shortened here the same way the per-crate tests
//! already do (e.g. `relay-session`'s `idle_timeout_demotes_an_active_session`),
//! so the suite stays fast without changing the behaviour under test.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use relay_bus::EventBus;
use relay_core::{BackpressurePolicy, CircuitState, Clock, ErrorKind, FakeClock, SessionConfig, SessionId, SessionState, SystemClock, Topic, WorkspaceId};
use relay_recovery::{Action, BreakerConfig, CircuitBreaker, Classifier, Orchestrator, OrchestratorConfig, RawError};
use relay_sandbox::{FakeSandbox, Sandbox};
use relay_session::Session;
use relay_stream::{Pipeline, PipelineConfig};
use relay_supervisor::{HealthPolicy, Supervisor};

fn process_spec() -> relay_sandbox::ProcessSpec {
    relay_sandbox::ProcessSpec {
        command: "claude".to_string(),
        args: Vec::new(),
        environment: BTreeMap::new(),
        working_directory: PathBuf::from("."),
    }
}

fn session_config(max_idle: Duration) -> SessionConfig {
    SessionConfig {
        system_prompt: String::new(),
        turn_budget: 0,
        tool_allowlist: BTreeSet::new(),
        environment: BTreeMap::new(),
        working_directory: PathBuf::from("."),
        oauth_token: None,
        max_idle,
        max_lifetime: Duration::from_secs(3600),
    }
}

fn health_policy() -> HealthPolicy {
    HealthPolicy {
        health_interval: Duration::from_secs(3600),
        health_failure_budget: 100,
        ..HealthPolicy::default()
    }
}

/// S1 — happy path: send input, receive two ordered Messages on the
/// session's topic, then observe the idle transition after inactivity.
#[tokio::test]
async fn s1_happy_path_delivers_ordered_messages_then_goes_idle() {
    let clock = FakeClock::new();
    let bus = Arc::new(EventBus::new());
    let fake_sandbox = Arc::new(FakeSandbox::new());
    let sandbox: Arc<dyn Sandbox> = fake_sandbox.clone();
    let pipeline = Arc::new(Pipeline::new(clock.clone(), bus.clone(), PipelineConfig { buffer_size: 16, stall_deadline: Duration::from_millis(200), max_line_bytes: 1 << 16 }));
    let supervisor = Arc::new(Supervisor::new(clock.clone(), sandbox, pipeline.clone(), health_policy()));

    let session_id = SessionId::new("w");
    let workspace_id = WorkspaceId::new("wkA");
    supervisor.start(process_spec(), session_id.clone()).await.expect("start");
    bus.register_session(session_id.clone(), workspace_id.clone());

    let subscriber = bus.subscribe(Topic::Session(session_id.clone()), 16, BackpressurePolicy::Block);

    let session = Session::new(session_id.clone(), workspace_id, clock.clone(), supervisor.clone(), session_config(Duration::from_millis(50)));
    session.send(b"hi\n").await.expect("send");

    let control = fake_sandbox.last_control().expect("process spawned");
    control.push_stdout(b"{\"type\":\"text\",\"content\":\"hello\",\"id\":\"m1\"}\n{\"type\":\"completion\",\"final\":true,\"id\":\"m2\"}\n");

    let first = subscriber.recv().await.expect("first message");
    assert_eq!(first.sequence, 1);
    assert_eq!(first.message_type.as_tag(), "text");
    let second = subscriber.recv().await.expect("second message");
    assert_eq!(second.sequence, 2);
    assert_eq!(second.message_type.as_tag(), "completion");

    clock.advance(Duration::from_millis(100));
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(session.state(), SessionState::Idle);
}

/// S2 — backpressure eviction: a slow `Block`-policy subscriber with buffer
/// 1 is evicted with `OverflowEvicted` inside `stall_deadline`, while the
/// publisher still completes every publish.
#[tokio::test]
async fn s2_slow_subscriber_is_evicted_without_blocking_the_publisher() {
    let clock = FakeClock::new();
    let bus = Arc::new(EventBus::new());
    let pipeline = Arc::new(Pipeline::new(clock.clone(), bus.clone(), PipelineConfig { buffer_size: 4, stall_deadline: Duration::from_millis(200), max_line_bytes: 1 << 16 }));

    let fake_sandbox = Arc::new(FakeSandbox::new());
    let sandbox: Arc<dyn Sandbox> = fake_sandbox.clone();
    let supervisor = Arc::new(Supervisor::new(clock.clone(), sandbox, pipeline.clone(), health_policy()));
    let session_id = SessionId::new("slow");
    supervisor.start(process_spec(), session_id.clone()).await.expect("start");

    // Never-consuming subscriber with a capacity-1 buffer.
    let slow = bus.subscribe(Topic::Session(session_id.clone()), 1, BackpressurePolicy::Block);

    let control = fake_sandbox.last_control().expect("process spawned");
    for i in 0..10 {
        control.push_stdout(format!("{{\"type\":\"text\",\"content\":\"m{i}\"}}\n").as_bytes());
    }

    tokio::time::sleep(Duration::from_millis(350)).await;

    let metrics = pipeline.metrics();
    assert_eq!(metrics.dropped, 0);
    assert_eq!(metrics.evicted_subscriptions, 1);
    // The evicted subscriber received at most its buffer's worth before closing.
    assert!(slow.recv().await.is_some());
}

/// S3 — crash and restart: a classified `ProcessExited` error drives the
/// Orchestrator to `Restart` up to the restart budget, then `Escalate` once
/// it is exhausted, matching the Supervisor's own `restart_count`.
#[tokio::test]
async fn s3_process_exit_restarts_until_the_budget_is_exhausted_then_escalates() {
    let clock = FakeClock::new();
    let bus = Arc::new(EventBus::new());
    let pipeline = Arc::new(Pipeline::new(clock.clone(), bus.clone(), PipelineConfig { buffer_size: 16, stall_deadline: Duration::from_millis(200), max_line_bytes: 1 << 16 }));
    let sandbox: Arc<dyn Sandbox> = Arc::new(FakeSandbox::new());
    let supervisor = Arc::new(Supervisor::new(clock.clone(), sandbox, pipeline.clone(), health_policy()));
    let session_id = SessionId::new("crashy");
    supervisor.start(process_spec(), session_id.clone()).await.expect("start");

    let breaker = CircuitBreaker::new(
        BreakerConfig { failure_threshold: 100, recovery_timeout: Duration::from_secs(30), success_threshold: 1, request_volume_threshold: 100, error_percentage_threshold: 100.0, half_open_max_calls: 1, rolling_window: Duration::from_secs(60) },
        clock.now(),
    );
    let orchestrator = Orchestrator::new(
        clock.clone(),
        Classifier::default(),
        breaker,
        OrchestratorConfig { max_restarts: 3, restart_interval: Duration::from_secs(300), base_delay: Duration::from_millis(10), max_backoff: Duration::from_secs(1) },
    );

    let err = RawError::new("exit 139").with_kind_hint(ErrorKind::ProcessExited);
    for expected_restart in 1..=3 {
        assert_eq!(orchestrator.handle_error("crashy", &err), Action::Restart);
        supervisor.restart(process_spec(), session_id.clone(), Duration::from_millis(10)).await.expect("restart");
        assert_eq!(supervisor.record().restart_count, expected_restart);
    }

    // The fifth classification (budget of 3 exhausted) escalates.
    assert_eq!(orchestrator.handle_error("crashy", &err), Action::Escalate);
}

/// S4 — breaker opens: three failing calls trip the breaker; a fourth call
/// is rejected outright; after `recovery_timeout` it half-opens, and a
/// success closes it again.
#[tokio::test]
async fn s4_three_failures_open_the_breaker_then_recovery_closes_it() {
    let now = std::time::Instant::now();
    let breaker = CircuitBreaker::new(
        BreakerConfig { failure_threshold: 3, recovery_timeout: Duration::from_secs(1), success_threshold: 1, request_volume_threshold: 3, error_percentage_threshold: 100.0, half_open_max_calls: 1, rolling_window: Duration::from_secs(60) },
        now,
    );

    for _ in 0..3 {
        let result: Result<(), &str> = breaker.execute(now, || Err("spawn failed"));
        assert!(result.is_err());
    }
    assert_eq!(breaker.state(now).state, CircuitState::Open);

    let fourth: Result<(), &str> = breaker.execute(now, || Ok(()));
    assert!(fourth.is_err(), "breaker should reject calls immediately while open");

    let after_recovery = now + Duration::from_secs(1) + Duration::from_millis(1);
    assert_eq!(breaker.state(after_recovery).state, CircuitState::HalfOpen);

    let recovered: Result<(), &str> = breaker.execute(after_recovery, || Ok(()));
    assert!(recovered.is_ok());
    assert_eq!(breaker.state(after_recovery).state, CircuitState::Closed);
}

/// S5 — parser robustness: a malformed line in the middle of a stream
/// yields a `ParseError` message without aborting the surrounding valid
/// lines.
#[tokio::test]
async fn s5_a_malformed_line_does_not_abort_the_stream() {
    let clock = FakeClock::new();
    let bus = Arc::new(EventBus::new());
    let pipeline = Arc::new(Pipeline::new(clock.clone(), bus.clone(), PipelineConfig { buffer_size: 16, stall_deadline: Duration::from_millis(200), max_line_bytes: 1 << 16 }));
    let fake_sandbox = Arc::new(FakeSandbox::new());
    let sandbox: Arc<dyn Sandbox> = fake_sandbox.clone();
    let supervisor = Arc::new(Supervisor::new(clock.clone(), sandbox, pipeline.clone(), health_policy()));
    let session_id = SessionId::new("noisy");
    supervisor.start(process_spec(), session_id.clone()).await.expect("start");

    let subscriber = bus.subscribe(Topic::Session(session_id.clone()), 16, BackpressurePolicy::Block);

    let control = fake_sandbox.last_control().expect("process spawned");
    control.push_stdout(b"{\"type\":\"text\",\"content\":\"a\"}\nnot json at all\n{\"type\":\"text\",\"content\":\"b\"}\n");

    let first = subscriber.recv().await.expect("first");
    assert_eq!(first.sequence, 1);
    assert_eq!(first.message_type.as_tag(), "text");

    let second = subscriber.recv().await.expect("second");
    assert_eq!(second.sequence, 2);
    assert_eq!(second.message_type.as_tag(), "parse_error");

    let third = subscriber.recv().await.expect("third");
    assert_eq!(third.sequence, 3);
    assert_eq!(third.message_type.as_tag(), "text");
}

/// S6 — pool autoscale: saturating every Idle session grows the pool past
/// `min_size` on the next tick; releasing them back shrinks it again, never
/// below `min_size`.
#[tokio::test]
async fn s6_pool_autoscales_up_under_load_and_back_down_when_idle() {
    use relay_pool::{Pool, PoolConfig, PoolError, SessionFactory};

    struct TestFactory {
        clock: SystemClock,
        bus: Arc<EventBus>,
        pipeline_config: PipelineConfig,
        health_policy: HealthPolicy,
    }

    #[async_trait::async_trait]
    impl SessionFactory<SystemClock> for TestFactory {
        async fn create(&self, workspace_id: WorkspaceId, session_id: SessionId, config: SessionConfig) -> Result<Arc<Session<SystemClock>>, PoolError> {
            let pipeline = Arc::new(Pipeline::new(self.clock.clone(), self.bus.clone(), self.pipeline_config.clone()));
            let sandbox: Arc<dyn Sandbox> = Arc::new(FakeSandbox::new());
            let supervisor = Arc::new(Supervisor::new(self.clock.clone(), sandbox, pipeline, self.health_policy.clone()));
            supervisor.start(process_spec(), session_id.clone()).await.map_err(|_| PoolError::PoolCold)?;
            Ok(Session::new(session_id, workspace_id, self.clock.clone(), supervisor, config))
        }
    }

    let clock = SystemClock;
    let bus = Arc::new(EventBus::new());
    let breaker = CircuitBreaker::new(
        BreakerConfig { failure_threshold: 100, recovery_timeout: Duration::from_secs(30), success_threshold: 1, request_volume_threshold: 100, error_percentage_threshold: 100.0, half_open_max_calls: 1, rolling_window: Duration::from_secs(60) },
        std::time::Instant::now(),
    );
    let factory = Arc::new(TestFactory { clock: clock.clone(), bus: bus.clone(), pipeline_config: PipelineConfig { buffer_size: 16, stall_deadline: Duration::from_millis(200), max_line_bytes: 1 << 16 }, health_policy: health_policy() });

    let pool_config = PoolConfig { min_size: 2, max_size: 10, scale_up_threshold: 0.8, scale_down_threshold: 0.3, autoscale_interval: Duration::from_millis(120) };
    let pool = Pool::new(WorkspaceId::new("wk6"), clock, bus, breaker, factory, pool_config);

    // Prime two Idle sessions the autoscaler can count against `min_size`.
    let a = pool.acquire(session_config(Duration::from_secs(3600))).await.expect("acquire a");
    let b = pool.acquire(session_config(Duration::from_secs(3600))).await.expect("acquire b");
    a.send(b"x\n").await.expect("activate a");
    b.send(b"x\n").await.expect("activate b");
    assert_eq!(pool.size(), 2);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(pool.size() > 2, "pool should have grown past min_size while saturated");

    pool.release(&a);
    pool.release(&b);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(pool.size(), 2, "pool should shrink back to min_size once idle, never below it");
}
