// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stream Pipeline (spec.md §4.3): drives a Parser against a Supervisor's
//! stdout, applies backpressure, publishes to the Bus.
//!
//! The reader/parser/publisher task split and the `tokio::select!`-driven
//! shutdown handshake are grounded on `watcher.rs`'s `watch_loop` (reader
//! task feeding a bounded channel, a oneshot shutdown signal raced against
//! incoming work). The bounded-producer pattern between the parser and the
//! publish stage is grounded on
//! `other_examples/0b29bf65_..._worker.rs.rs`'s concurrent-job-processing
//! shape.

use parking_lot::Mutex;
use relay_bus::EventBus;
use relay_core::{Clock, Message, SessionId, Topic};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncRead;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::parser::{Parser, ParserStats};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub buffer_size: usize,
    pub stall_deadline: Duration,
    pub max_line_bytes: usize,
}

impl From<&relay_core::config::PipelineConfig> for PipelineConfig {
    fn from(c: &relay_core::config::PipelineConfig) -> Self {
        Self {
            buffer_size: c.buffer_size,
            stall_deadline: c.stall_deadline,
            max_line_bytes: c.max_line_bytes,
        }
    }
}

/// Snapshot returned by `Pipeline::metrics` (spec.md §4.3 `Metrics()`).
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineMetrics {
    pub processed: u64,
    pub error_count: u64,
    pub dropped: u64,
    pub evicted_subscriptions: u64,
    pub buffer_high_water_mark: usize,
    pub average_parse_latency: Duration,
}

struct Counters {
    processed: AtomicU64,
    error_count: AtomicU64,
    dropped: AtomicU64,
    evicted_subscriptions: AtomicU64,
    buffer_high_water_mark: std::sync::atomic::AtomicUsize,
    parse_latency_total_nanos: AtomicU64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            processed: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            evicted_subscriptions: AtomicU64::new(0),
            buffer_high_water_mark: std::sync::atomic::AtomicUsize::new(0),
            parse_latency_total_nanos: AtomicU64::new(0),
        }
    }
}

struct AttachedHandle {
    topic: Topic,
    shutdown: oneshot::Sender<()>,
    reader_task: JoinHandle<()>,
    publisher_task: JoinHandle<()>,
}

/// One Pipeline binds one subprocess's stdout to one session's Bus topic.
/// `Attach`/`Detach` may be called repeatedly across the Pipeline's
/// lifetime (one Attach per Supervisor restart).
pub struct Pipeline<C: Clock> {
    clock: C,
    bus: Arc<EventBus>,
    config: PipelineConfig,
    counters: Arc<Counters>,
    handle: Mutex<Option<AttachedHandle>>,
}

impl<C: Clock> Pipeline<C> {
    pub fn new(clock: C, bus: Arc<EventBus>, config: PipelineConfig) -> Self {
        Self {
            clock,
            bus,
            config,
            counters: Arc::new(Counters::default()),
            handle: Mutex::new(None),
        }
    }

    /// Binds the Pipeline to `stdout`, publishing parsed messages to
    /// `session_id`'s Bus topic. Any previously attached reader is
    /// detached first.
    pub fn attach<R>(&self, stdout: R, session_id: SessionId)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.detach();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (queue_tx, queue_rx) = tokio::sync::mpsc::channel::<Message>(self.config.buffer_size);

        let clock = self.clock.clone();
        let max_line_bytes = self.config.max_line_bytes;
        let counters = self.counters.clone();
        let reader_task = tokio::spawn(read_loop(stdout, clock, max_line_bytes, queue_tx, shutdown_rx, counters));

        let bus = self.bus.clone();
        let topic = Topic::Session(session_id);
        let stall_deadline = self.config.stall_deadline;
        let counters = self.counters.clone();
        let publisher_task = tokio::spawn(publish_loop(bus, topic.clone(), stall_deadline, queue_rx, counters));

        *self.handle.lock() = Some(AttachedHandle {
            topic,
            shutdown: shutdown_tx,
            reader_task,
            publisher_task,
        });
    }

    /// Stops reading, drains the Parser, closes the outbound Subscriptions
    /// backing this session's topic.
    pub fn detach(&self) {
        let attached = self.handle.lock().take();
        if let Some(attached) = attached {
            let _ = attached.shutdown.send(());
            attached.reader_task.abort();
            attached.publisher_task.abort();
            self.bus.close_topic(&attached.topic);
        }
    }

    pub fn metrics(&self) -> PipelineMetrics {
        PipelineMetrics {
            processed: self.counters.processed.load(Ordering::Relaxed),
            error_count: self.counters.error_count.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            evicted_subscriptions: self.counters.evicted_subscriptions.load(Ordering::Relaxed),
            buffer_high_water_mark: self.counters.buffer_high_water_mark.load(Ordering::Relaxed),
            average_parse_latency: average_latency(&self.counters),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.handle.lock().is_some()
    }
}

fn average_latency(counters: &Counters) -> Duration {
    let processed = counters.processed.load(Ordering::Relaxed);
    if processed == 0 {
        return Duration::ZERO;
    }
    let total_nanos = counters.parse_latency_total_nanos.load(Ordering::Relaxed);
    Duration::from_nanos(total_nanos / processed)
}

async fn read_loop<R, C>(
    stdout: R,
    clock: C,
    max_line_bytes: usize,
    queue_tx: tokio::sync::mpsc::Sender<Message>,
    mut shutdown_rx: oneshot::Receiver<()>,
    counters: Arc<Counters>,
) where
    R: AsyncRead + Send + Unpin + 'static,
    C: Clock,
{
    let mut parser = Parser::new(stdout, clock, max_line_bytes);
    loop {
        let parse_started = Instant::now();
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => {
                debug!("pipeline detach requested, stopping reader");
                break;
            }
            message = parser.next_message() => {
                match message {
                    Some(message) => {
                        counters.processed.fetch_add(1, Ordering::Relaxed);
                        counters.parse_latency_total_nanos.fetch_add(
                            parse_started.elapsed().as_nanos() as u64,
                            Ordering::Relaxed,
                        );
                        let depth = queue_tx.max_capacity() - queue_tx.capacity();
                        counters.buffer_high_water_mark.fetch_max(depth + 1, Ordering::Relaxed);
                        if queue_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
    record_parser_stats(&counters, parser.stats());
}

fn record_parser_stats(counters: &Counters, stats: ParserStats) {
    counters.processed.store(stats.messages_emitted, Ordering::Relaxed);
    let errors = stats.parse_errors + stats.oversize_lines + stats.trailing_garbage;
    counters.error_count.store(errors, Ordering::Relaxed);
}

async fn publish_loop(
    bus: Arc<EventBus>,
    topic: Topic,
    stall_deadline: Duration,
    mut queue_rx: tokio::sync::mpsc::Receiver<Message>,
    counters: Arc<Counters>,
) {
    while let Some(message) = queue_rx.recv().await {
        let evicted = bus.publish_with_deadline(&topic, message, stall_deadline).await;
        if !evicted.is_empty() {
            warn!(count = evicted.len(), topic = %topic, "subscriber evicted for stalling past the pipeline's stall-deadline");
            counters.evicted_subscriptions.fetch_add(evicted.len() as u64, Ordering::Relaxed);
            for id in evicted {
                bus.unsubscribe(&topic, id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{BackpressurePolicy, FakeClock};
    use std::time::Duration;

    fn config() -> PipelineConfig {
        PipelineConfig {
            buffer_size: 4,
            stall_deadline: Duration::from_millis(200),
            max_line_bytes: 1024 * 1024,
        }
    }

    #[tokio::test]
    async fn attach_publishes_parsed_messages_to_the_session_topic() {
        let bus = Arc::new(EventBus::new());
        let session_id = SessionId::new("s1");
        let receiver = bus.subscribe(Topic::Session(session_id.clone()), 8, BackpressurePolicy::Block);

        let pipeline = Pipeline::new(FakeClock::new(), bus, config());
        let stdout = std::io::Cursor::new(b"{\"type\":\"text\"}\n{\"type\":\"completion\"}\n".to_vec());
        pipeline.attach(stdout, session_id);

        let first = tokio::time::timeout(Duration::from_secs(1), receiver.recv()).await.unwrap().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), receiver.recv()).await.unwrap().unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
    }

    #[tokio::test]
    async fn detach_closes_the_session_subscriptions() {
        let bus = Arc::new(EventBus::new());
        let session_id = SessionId::new("s1");
        let receiver = bus.subscribe(Topic::Session(session_id.clone()), 8, BackpressurePolicy::Block);

        let pipeline = Pipeline::new(FakeClock::new(), bus.clone(), config());
        let stdout = std::io::Cursor::new(b"{\"type\":\"text\"}\n".to_vec());
        pipeline.attach(stdout, session_id.clone());
        tokio::time::timeout(Duration::from_secs(1), receiver.recv()).await.unwrap().unwrap();

        pipeline.detach();
        assert_eq!(receiver.recv().await, None);
        assert!(!pipeline.is_attached());
    }

    #[tokio::test]
    async fn stalled_block_subscriber_is_evicted_within_the_stall_deadline() {
        let bus = Arc::new(EventBus::new());
        let session_id = SessionId::new("s1");
        let slow = bus.subscribe(Topic::Session(session_id.clone()), 1, BackpressurePolicy::Block);

        let mut pipeline_config = config();
        pipeline_config.buffer_size = 4;
        pipeline_config.stall_deadline = Duration::from_millis(50);
        let pipeline = Pipeline::new(FakeClock::new(), bus.clone(), pipeline_config);

        let lines: String = (0..10).map(|_| "{\"type\":\"text\"}\n").collect();
        let stdout = std::io::Cursor::new(lines.into_bytes());
        pipeline.attach(stdout, session_id.clone());

        tokio::time::sleep(Duration::from_millis(500)).await;
        let metrics = pipeline.metrics();
        assert_eq!(metrics.evicted_subscriptions, 1);
        assert_eq!(bus.topic_subscriber_count(&Topic::Session(session_id)), 0);

        // The one message that made it into the slow subscriber's buffer
        // before eviction is still delivered.
        assert!(slow.recv().await.is_some());
        assert_eq!(slow.recv().await, None);
    }
}
