use crate::client::{ClientFactory, ConsumeClient, OutboundRecord, RawMessage};
use crate::errors::{ConnectionError, DispatchError, RouterError};
use crate::metadata::DecodeFailurePolicy;
use crate::producer::ProducerFactory;
use crate::registration::{DispatchEnv, TopicRegistration};
use crate::resolver::ServiceResolver;
use crate::telemetry::{LoopMetrics, MetricsSnapshot};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const POLL_TIMEOUT: Duration = Duration::from_millis(1000);
const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(60);
const STARTUP_BACKOFF_BASE: Duration = Duration::from_millis(500);
const STARTUP_BACKOFF_CAP: Duration = Duration::from_secs(30);
const STARTUP_MAX_ATTEMPTS: u32 = 8;

/// Bounded exponential backoff for client construction. `next` returns the
/// delay before the following attempt, or `None` once attempts are
/// exhausted.
pub(crate) struct Backoff {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Backoff {
            base,
            cap,
            max_attempts,
            attempt: 0,
        }
    }

    pub fn next(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let delay = self
            .base
            .checked_mul(1u32 << self.attempt.min(16))
            .map_or(self.cap, |d| d.min(self.cap));
        self.attempt += 1;
        Some(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// Terminal state of one topic loop, returned to the router when it exits.
#[derive(Debug)]
pub struct LoopSummary {
    pub topic: String,
    pub outcome: LoopOutcome,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug)]
pub enum LoopOutcome {
    Stopped,
    Faulted(RouterError),
}

impl LoopOutcome {
    pub fn is_faulted(&self) -> bool {
        matches!(self, LoopOutcome::Faulted(_))
    }
}

enum Started {
    Client(Arc<dyn ConsumeClient>),
    Cancelled,
}

/// One consume loop: owns its client exclusively, polls, dispatches one
/// message at a time, commits after success. A fault here never reaches a
/// sibling loop.
pub(crate) struct ConsumerLoop {
    registration: Arc<TopicRegistration>,
    resolver: Arc<ServiceResolver>,
    factory: Arc<dyn ClientFactory>,
    producers: Arc<ProducerFactory>,
    shutdown: CancellationToken,
    metrics: Arc<LoopMetrics>,
    poll_timeout: Duration,
    backoff: Backoff,
}

impl ConsumerLoop {
    pub fn new(
        registration: Arc<TopicRegistration>,
        resolver: Arc<ServiceResolver>,
        factory: Arc<dyn ClientFactory>,
        producers: Arc<ProducerFactory>,
        shutdown: CancellationToken,
    ) -> Self {
        ConsumerLoop {
            registration,
            resolver,
            factory,
            producers,
            shutdown,
            metrics: Arc::new(LoopMetrics::default()),
            poll_timeout: POLL_TIMEOUT,
            backoff: Backoff::new(
                STARTUP_BACKOFF_BASE,
                STARTUP_BACKOFF_CAP,
                STARTUP_MAX_ATTEMPTS,
            ),
        }
    }

    /// Runs until shutdown or an unrecoverable startup failure. `ready`
    /// reports whether the loop made it past startup.
    pub async fn run(mut self, ready: oneshot::Sender<bool>) -> LoopSummary {
        let topic = self.registration.topic().to_string();

        let client = match self.start().await {
            Ok(Started::Client(client)) => client,
            Ok(Started::Cancelled) => {
                let _ = ready.send(true);
                return LoopSummary {
                    topic,
                    outcome: LoopOutcome::Stopped,
                    metrics: self.metrics.snapshot(),
                };
            }
            Err(e) => {
                error!("topic loop {topic} failed to start: {e}");
                let _ = ready.send(false);
                return LoopSummary {
                    topic,
                    outcome: LoopOutcome::Faulted(e),
                    metrics: self.metrics.snapshot(),
                };
            }
        };
        let _ = ready.send(true);
        info!("topic loop {topic} started");

        let report_stopped = CancellationToken::new();
        let report_interval = self
            .registration
            .metadata()
            .report_interval()
            .unwrap_or(DEFAULT_REPORT_INTERVAL);
        let reporter = tokio::spawn(report_loop(
            topic.clone(),
            self.metrics.clone(),
            report_interval,
            report_stopped.clone(),
        ));

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("topic loop {topic} received shutdown signal");
                    break;
                }
                polled = client.poll(self.poll_timeout) => match polled {
                    Ok(Some(raw)) => self.dispatch(client.as_ref(), raw).await,
                    Ok(None) => {}
                    Err(e) => warn!("error receiving message on {topic}: {e}"),
                }
            }
        }

        report_stopped.cancel();
        let _ = reporter.await;

        if let Err(e) = client.unsubscribe() {
            warn!("shutdown of topic loop {topic} was not clean: {e}");
        }

        LoopSummary {
            topic,
            outcome: LoopOutcome::Stopped,
            metrics: self.metrics.snapshot(),
        }
    }

    async fn start(&mut self) -> Result<Started, RouterError> {
        let settings = self
            .registration
            .metadata()
            .consumer_settings(self.registration.topic())?;
        self.registration
            .handler()
            .prepare(&self.resolver, self.registration.metadata())?;

        loop {
            match self.factory.consumer(&settings) {
                Ok(client) => return Ok(Started::Client(client)),
                Err(e) => match self.backoff.next() {
                    Some(delay) => {
                        warn!(
                            "failed to connect consumer for {}: {e}; retrying in {delay:?}",
                            settings.topic
                        );
                        tokio::select! {
                            _ = self.shutdown.cancelled() => return Ok(Started::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => {
                        return Err(ConnectionError::RetriesExhausted {
                            topic: settings.topic.clone(),
                            attempts: self.backoff.attempts(),
                            last: Box::new(e),
                        }
                        .into());
                    }
                },
            }
        }
    }

    async fn dispatch(&self, client: &dyn ConsumeClient, raw: RawMessage) {
        self.metrics.record_received();
        let topic = raw.topic.clone();
        let partition = raw.partition;
        let offset = raw.offset;

        let policy = self.registration.metadata().decode_failure();
        let retained = match &policy {
            DecodeFailurePolicy::DeadLetter(_) => Some(raw.clone()),
            _ => None,
        };

        let env = DispatchEnv {
            raw,
            cancel: self.shutdown.clone(),
            resolver: self.resolver.clone(),
            metadata: self.registration.metadata_arc(),
            producers: self.producers.clone(),
        };

        let outcome = AssertUnwindSafe(self.registration.handler().handle(env))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(DispatchError::Handler {
                    reason: panic_reason(&panic),
                })
            });

        match outcome {
            Ok(()) => {
                self.metrics.record_dispatched();
                self.commit(client, &topic, partition, offset);
            }
            Err(e @ DispatchError::Decode { .. }) => {
                self.metrics.record_failed();
                error!("undecodable message at {topic}[{partition}]@{offset}: {e}");
                match policy {
                    DecodeFailurePolicy::Skip => self.commit(client, &topic, partition, offset),
                    DecodeFailurePolicy::Hold => {}
                    DecodeFailurePolicy::DeadLetter(dead_letter_topic) => {
                        if let Some(raw) = retained {
                            self.forward_dead_letter(raw, &dead_letter_topic).await;
                        }
                        self.commit(client, &topic, partition, offset);
                    }
                }
            }
            Err(e) => {
                self.metrics.record_failed();
                // left uncommitted: redelivered after a loop restart
                error!("handler failed for {topic}[{partition}]@{offset}: {e}");
            }
        }
    }

    fn commit(&self, client: &dyn ConsumeClient, topic: &str, partition: i32, offset: i64) {
        match client.commit(topic, partition, offset) {
            Ok(()) => self.metrics.record_committed(),
            Err(e) => error!("{e}"),
        }
    }

    async fn forward_dead_letter(&self, raw: RawMessage, dead_letter_topic: &str) {
        let settings = match self
            .registration
            .metadata()
            .producer_settings(dead_letter_topic)
        {
            Ok(settings) => settings,
            Err(e) => {
                error!("cannot forward to {dead_letter_topic}: {e}");
                return;
            }
        };
        let client = match self.producers.get(&settings) {
            Ok(client) => client,
            Err(e) => {
                error!("cannot forward to {dead_letter_topic}: {e}");
                return;
            }
        };
        let record = OutboundRecord {
            topic: dead_letter_topic.to_string(),
            key: raw.key,
            payload: raw.payload,
            headers: raw.headers,
        };
        match client.send(record).await {
            Ok(_) => self.metrics.record_dead_lettered(),
            Err(e) => error!("dead-letter forward to {dead_letter_topic} failed: {e}"),
        }
    }

    #[cfg(test)]
    fn metrics(&self) -> Arc<LoopMetrics> {
        self.metrics.clone()
    }

    #[cfg(test)]
    fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

fn panic_reason(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

/// Periodic throughput report, independent of the dispatch cycle. Runs as
/// its own task so a stalled handler never delays it and a report failure
/// never reaches the dispatch path.
async fn report_loop(
    topic: String,
    metrics: Arc<LoopMetrics>,
    period: Duration,
    stopped: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = stopped.cancelled() => break,
            _ = interval.tick() => {
                let s = metrics.snapshot();
                info!(
                    "topic loop {topic}: received={} dispatched={} failed={} committed={} dead_lettered={}",
                    s.received, s.dispatched, s.failed, s.committed, s.dead_lettered
                );
            }
        }
    }
}
