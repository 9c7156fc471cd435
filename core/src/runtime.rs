use crate::client::ClientFactory;
use crate::consumer::{ConsumerLoop, LoopSummary};
use crate::errors::{RouterError, ShutdownError};
use crate::producer::ProducerFactory;
use crate::registration::DataSource;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info};

/// The built runtime: one consume loop per registration, launched together,
/// torn down together.
pub struct KafkaRouter {
    data_source: DataSource,
    factory: Arc<dyn ClientFactory>,
    producers: Arc<ProducerFactory>,
}

impl KafkaRouter {
    pub(crate) fn new(data_source: DataSource, factory: Arc<dyn ClientFactory>) -> Self {
        let producers = Arc::new(ProducerFactory::new(factory.clone()));
        KafkaRouter {
            data_source,
            factory,
            producers,
        }
    }

    pub fn data_source(&self) -> &DataSource {
        &self.data_source
    }

    /// Launches every registered loop and runs until `shutdown` fires. Loops
    /// are fully isolated: a fault in one is reported and the rest keep
    /// going. Returns the per-loop summaries once all loops have exited, or
    /// an error when every loop already faulted during startup.
    pub async fn start(
        &self,
        shutdown: tokio_util::sync::CancellationToken,
    ) -> Result<Vec<LoopSummary>, RouterError> {
        let registrations = self.data_source.registrations();
        if registrations.is_empty() {
            return Ok(Vec::new());
        }
        let total = registrations.len();
        info!("starting {total} topic loops");

        let mut ready_signals = Vec::with_capacity(total);
        let mut handles = Vec::with_capacity(total);
        for registration in registrations {
            let (ready_tx, ready_rx) = oneshot::channel();
            let consumer_loop = ConsumerLoop::new(
                registration.clone(),
                self.data_source.resolver().clone(),
                self.factory.clone(),
                self.producers.clone(),
                shutdown.clone(),
            );
            ready_signals.push(ready_rx);
            handles.push(tokio::spawn(consumer_loop.run(ready_tx)));
        }

        let mut started = 0usize;
        for ready in ready_signals {
            if ready.await.unwrap_or(false) {
                started += 1;
            }
        }
        if started < total {
            error!("{} of {total} topic loops faulted during startup", total - started);
        }

        let mut summaries = Vec::with_capacity(total);
        for handle in handles {
            match handle.await {
                Ok(summary) => summaries.push(summary),
                Err(e) => {
                    let join_error: RouterError = ShutdownError::Join {
                        reason: e.to_string(),
                    }
                    .into();
                    error!("{join_error}");
                }
            }
        }
        self.producers.clear();

        let faulted = summaries
            .iter()
            .filter(|summary| summary.outcome.is_faulted())
            .count();
        for summary in &summaries {
            info!(
                "topic loop {} exited: {:?} ({} dispatched, {} failed)",
                summary.topic, summary.outcome, summary.metrics.dispatched, summary.metrics.failed
            );
        }
        if faulted > 0 {
            return Err(RouterError::Faulted { faulted, total });
        }
        Ok(summaries)
    }
}
