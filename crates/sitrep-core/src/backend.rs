//! Backend contract and payload fan-out

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use sitrep_api::Payload;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::error::{BackendError, RunError};
use crate::module::{Configurable, LogProducer};

/// A sink for the final payload
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Acquire resources (files, clients) before the run
    ///
    /// # Errors
    /// Any error aborts the run.
    async fn init(&mut self) -> Result<(), BackendError>;

    /// Deliver the payload; must not mutate it
    ///
    /// # Errors
    /// Failures are logged and do not affect other backends.
    async fn write(&self, payload: &Payload) -> Result<(), BackendError>;

    /// Release resources
    ///
    /// # Errors
    /// Failures are logged only.
    async fn close(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    fn as_configurable(&mut self) -> Option<&mut dyn Configurable> {
        None
    }

    fn as_log_producer(&mut self) -> Option<&mut dyn LogProducer> {
        None
    }
}

/// A backend whose `write` (or `close`) failed
#[derive(Debug)]
pub struct BackendFailure {
    pub backend: String,
    pub error: BackendError,
}

/// The enabled backends of one run
#[derive(Default)]
pub struct BackendSet {
    backends: Vec<Box<dyn Backend>>,
    initialized: usize,
}

impl BackendSet {
    #[must_use]
    pub fn new(backends: Vec<Box<dyn Backend>>) -> Self {
        Self {
            backends,
            initialized: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.backends.iter().map(|b| b.name())
    }

    /// Initialize every backend in order
    ///
    /// On the first failure, the backends already initialized are closed.
    ///
    /// # Errors
    /// Returns `RunError::BackendInit` naming the failing backend.
    pub async fn init_all(&mut self) -> Result<(), RunError> {
        for index in 0..self.backends.len() {
            let backend = &mut self.backends[index];
            let name = backend.name();
            match backend.init().await {
                Ok(()) => {
                    debug!(backend = name, "backend initialized");
                    self.initialized = index + 1;
                }
                Err(source) => {
                    warn!(backend = name, error = %source, "backend init failed");
                    self.close_all().await;
                    return Err(RunError::BackendInit {
                        backend: name.to_string(),
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    /// Send the same payload to every backend
    ///
    /// At most `concurrency` writes are in flight; results keep backend order.
    pub async fn write_all(&self, payload: &Payload, concurrency: usize) -> Vec<BackendFailure> {
        let results: Vec<_> = stream::iter(self.backends.iter().take(self.initialized))
            .map(|backend| {
                let name = backend.name();
                async move {
                    let result = backend
                        .write(payload)
                        .instrument(info_span!("backend", name))
                        .await;
                    (name, result)
                }
            })
            .buffered(concurrency.max(1))
            .collect()
            .await;

        let mut failures = Vec::new();
        for (name, result) in results {
            match result {
                Ok(()) => info!(backend = name, "payload delivered"),
                Err(error) => {
                    warn!(backend = name, error = %error, "backend write failed");
                    failures.push(BackendFailure {
                        backend: name.to_string(),
                        error,
                    });
                }
            }
        }
        failures
    }

    /// Close every initialized backend, even after failures
    pub async fn close_all(&mut self) -> Vec<BackendFailure> {
        let mut failures = Vec::new();
        for backend in self.backends.iter_mut().take(self.initialized) {
            let name = backend.name();
            if let Err(error) = backend.close().await {
                warn!(backend = name, error = %error, "backend close failed");
                failures.push(BackendFailure {
                    backend: name.to_string(),
                    error,
                });
            }
        }
        self.initialized = 0;
        failures
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingBackend {
        name: &'static str,
        fail_init: bool,
        fail_write: bool,
        writes: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl CountingBackend {
        fn boxed(
            name: &'static str,
            fail_init: bool,
            fail_write: bool,
            writes: &Arc<AtomicUsize>,
            closes: &Arc<AtomicUsize>,
        ) -> Box<dyn Backend> {
            Box::new(Self {
                name,
                fail_init,
                fail_write,
                writes: Arc::clone(writes),
                closes: Arc::clone(closes),
            })
        }
    }

    #[async_trait]
    impl Backend for CountingBackend {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn init(&mut self) -> Result<(), BackendError> {
            if self.fail_init {
                return Err(BackendError::Transport("unreachable".into()));
            }
            Ok(())
        }

        async fn write(&self, _payload: &Payload) -> Result<(), BackendError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.fail_write {
                return Err(BackendError::Status {
                    status: 500,
                    body: "boom".into(),
                });
            }
            Ok(())
        }

        async fn close(&mut self) -> Result<(), BackendError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_write_failure_does_not_stop_peers() {
        let writes = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let mut set = BackendSet::new(vec![
            CountingBackend::boxed("a", false, true, &writes, &closes),
            CountingBackend::boxed("b", false, false, &writes, &closes),
        ]);
        set.init_all().await.unwrap();

        let failures = set.write_all(&Payload::default(), 2).await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].backend, "a");
        assert_eq!(writes.load(Ordering::SeqCst), 2);

        assert!(set.close_all().await.is_empty());
        assert_eq!(closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_init_failure_closes_initialized() {
        let writes = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let mut set = BackendSet::new(vec![
            CountingBackend::boxed("a", false, false, &writes, &closes),
            CountingBackend::boxed("b", true, false, &writes, &closes),
            CountingBackend::boxed("c", false, false, &writes, &closes),
        ]);

        let err = set.init_all().await.unwrap_err();
        assert!(matches!(err, RunError::BackendInit { ref backend, .. } if backend == "b"));
        // only "a" had been initialized
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
