use crate::client::{ClientFactory, ProduceClient, ProducerSettings};
use crate::errors::ConnectionError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

struct CachedProducer {
    client: Arc<dyn ProduceClient>,
    last_used: Instant,
}

/// Keyed cache of produce clients. Clients are reused across sends with the
/// same effective settings, expired after sitting idle, and dropped when the
/// router shuts down.
pub struct ProducerFactory {
    factory: Arc<dyn ClientFactory>,
    cache: Mutex<HashMap<String, CachedProducer>>,
    idle_timeout: Duration,
}

impl ProducerFactory {
    pub(crate) fn new(factory: Arc<dyn ClientFactory>) -> Self {
        ProducerFactory {
            factory,
            cache: Mutex::new(HashMap::new()),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_idle_timeout(factory: Arc<dyn ClientFactory>, idle_timeout: Duration) -> Self {
        ProducerFactory {
            factory,
            cache: Mutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    pub(crate) fn get(
        &self,
        settings: &ProducerSettings,
    ) -> Result<Arc<dyn ProduceClient>, ConnectionError> {
        let mut cache = self.cache.lock().expect("producer cache poisoned");

        let idle_timeout = self.idle_timeout;
        cache.retain(|_, entry| entry.last_used.elapsed() < idle_timeout);

        let key = settings.cache_key();
        if let Some(entry) = cache.get_mut(&key) {
            entry.last_used = Instant::now();
            return Ok(entry.client.clone());
        }

        debug!("building produce client for {}", settings.bootstrap_servers);
        let client = self.factory.producer(settings)?;
        cache.insert(
            key,
            CachedProducer {
                client: client.clone(),
                last_used: Instant::now(),
            },
        );
        Ok(client)
    }

    pub(crate) fn clear(&self) {
        self.cache.lock().expect("producer cache poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::ScriptedFactory;
    use std::sync::atomic::Ordering;

    fn settings(servers: &str) -> ProducerSettings {
        ProducerSettings {
            bootstrap_servers: servers.to_string(),
            properties: vec![],
        }
    }

    #[test]
    fn clients_are_reused_for_equal_settings() {
        let factory = Arc::new(ScriptedFactory::new());
        let producers = ProducerFactory::new(factory.clone());

        producers.get(&settings("localhost:9092")).unwrap();
        producers.get(&settings("localhost:9092")).unwrap();
        producers.get(&settings("other:9092")).unwrap();

        assert_eq!(factory.producers_built.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn idle_clients_are_rebuilt() {
        let factory = Arc::new(ScriptedFactory::new());
        let producers =
            ProducerFactory::with_idle_timeout(factory.clone(), Duration::from_millis(0));

        producers.get(&settings("localhost:9092")).unwrap();
        producers.get(&settings("localhost:9092")).unwrap();

        assert_eq!(factory.producers_built.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn clear_drops_cached_clients() {
        let factory = Arc::new(ScriptedFactory::new());
        let producers = ProducerFactory::new(factory.clone());

        producers.get(&settings("localhost:9092")).unwrap();
        producers.clear();
        producers.get(&settings("localhost:9092")).unwrap();

        assert_eq!(factory.producers_built.load(Ordering::SeqCst), 2);
    }
}
