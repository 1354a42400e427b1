//! The aggregation engine and its lifecycle.
//!
//! [`Engine`] is the context object owning the metric store, the store's
//! lock, the shutdown signal and the listener task. It moves through
//! `Stopped -> Initialized -> Running -> ShuttingDown -> Stopped`:
//! [`Engine::new`] initializes, [`Engine::start`] brings up ingestion,
//! [`Engine::shutdown`] tears everything down. Starting twice does not
//! replace a populated store and shutting down twice is a no-op.
//!
//! The flush cycle is driven from outside: some scheduler -- the binary's
//! interval timer, or an embedder's -- calls [`Engine::flush_into`] on a
//! fixed period, with no overlap between passes.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::flush;
use crate::listener::{self, Listener};
use crate::signals::Shutdown;
use crate::sink::{self, Sink};
use crate::store::Store;

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis())
}

#[derive(Debug)]
/// The aggregation engine.
pub struct Engine {
    config: Config,
    store: Arc<Mutex<Store>>,
    shutdown: Shutdown,
    listener: Option<JoinHandle<Result<(), listener::Error>>>,
}

impl Engine {
    /// Create an initialized engine: the store exists, ingestion is not
    /// yet running.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: Arc::new(Mutex::new(Store::new())),
            shutdown: Shutdown::new(),
            listener: None,
        }
    }

    /// Shared handle to the metric store, for embedders that feed updates
    /// without the UDP listener.
    #[must_use]
    pub fn store(&self) -> Arc<Mutex<Store>> {
        Arc::clone(&self.store)
    }

    /// Bind the listener sockets and start the receive loops.
    ///
    /// Idempotent: calling `start` while the listener is already running
    /// does nothing and never touches the store.
    ///
    /// # Errors
    ///
    /// Function will return an error if no listener socket could be
    /// bound. The engine remains usable without ingestion; the flush cycle
    /// keeps working.
    pub async fn start(&mut self) -> Result<(), listener::Error> {
        if self.listener.is_some() {
            return Ok(());
        }
        let listener = Listener::bind(
            &self.config.listener,
            Arc::clone(&self.store),
            self.shutdown.clone(),
        )
        .await?;
        info!(addrs = ?listener.local_addrs(), "listener running");
        self.listener = Some(tokio::spawn(listener.run()));
        Ok(())
    }

    /// Run one flush pass and dispatch its samples.
    ///
    /// The store lock is held only while summaries are computed; dispatch
    /// happens after release. Returns the number of samples emitted.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink failed; the store's per-interval
    /// resets have already happened by then and are not rolled back, the
    /// transport being lossy by contract.
    pub fn flush_into<S: Sink>(&self, sink: &mut S) -> Result<usize, sink::Error> {
        let samples = {
            let mut store = self.store.lock().expect("metric store lock poisoned");
            flush::flush(&mut store, &self.config.flush, unix_millis())
        };
        for sample in &samples {
            sink.dispatch(sample)?;
        }
        sink.flush()?;
        Ok(samples.len())
    }

    /// Stop ingestion and drain the store.
    ///
    /// Signals the listener, waits for its loops to exit, then destroys
    /// every metric record. Best-effort: listener failures are logged, not
    /// escalated. Safe to call any number of times; a later [`start`]
    /// re-initializes cleanly.
    ///
    /// [`start`]: Engine::start
    pub async fn shutdown(&mut self) {
        if let Some(handle) = self.listener.take() {
            self.shutdown.signal();
            match handle.await {
                Ok(Ok(())) => info!("listener stopped"),
                Ok(Err(error)) => warn!(%error, "listener exited with error"),
                Err(error) => warn!(%error, "listener task failed to join"),
            }
            // The old signal stays latched; a fresh one lets start() run
            // again after shutdown.
            self.shutdown = Shutdown::new();
        }
        self.store
            .lock()
            .expect("metric store lock poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Update;
    use crate::sample::{Sample, SampleKind, SampleValue};
    use crate::store::{MetricKey, MetricKind};

    fn test_config() -> Config {
        Config {
            listener: listener::Config {
                host: Some("127.0.0.1".to_string()),
                port: 0,
                read_buffer_bytes: 4096,
            },
            ..Config::default()
        }
    }

    fn apply_counter(store: &Arc<Mutex<Store>>, name: &str, delta: f64) {
        store
            .lock()
            .expect("lock")
            .apply(Update::Counter {
                name: name.to_string(),
                delta,
            });
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_is_idempotent_and_preserves_the_store() {
        let mut engine = Engine::new(test_config());
        engine.start().await.expect("first start succeeds");

        apply_counter(&engine.store(), "requests", 5.0);
        engine.start().await.expect("second start succeeds");

        let store = engine.store();
        let store = store.lock().expect("lock");
        assert_eq!(store.len(), 1, "second start must not replace the store");
        drop(store);

        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_twice_is_safe_and_drains_the_store() {
        let mut engine = Engine::new(test_config());
        engine.start().await.expect("start succeeds");
        apply_counter(&engine.store(), "requests", 5.0);

        engine.shutdown().await;
        assert!(engine.store().lock().expect("lock").is_empty());
        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn engine_restarts_after_shutdown() {
        let mut engine = Engine::new(test_config());
        engine.start().await.expect("start succeeds");
        engine.shutdown().await;

        engine.start().await.expect("restart succeeds");
        apply_counter(&engine.store(), "requests", 1.0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn flush_into_dispatches_after_the_pass() {
        let engine = Engine::new(test_config());
        apply_counter(&engine.store(), "requests", 7.6);

        let mut sink: Vec<Sample> = Vec::new();
        let emitted = engine.flush_into(&mut sink).expect("flush succeeds");
        assert_eq!(emitted, 1);
        assert_eq!(sink[0].kind, SampleKind::Derive);
        assert_eq!(sink[0].value, SampleValue::Int(8));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_increments_sum_exactly() {
        let engine = Engine::new(test_config());

        // Many writers, one key: post-flush cumulative total must be the
        // exact number of increments, independent of interleaving.
        let tasks: i64 = 8;
        let increments_per_task: i64 = 250;
        let mut handles = Vec::new();
        for _ in 0..tasks {
            let store = engine.store();
            handles.push(tokio::spawn(async move {
                for _ in 0..increments_per_task {
                    store
                        .lock()
                        .expect("lock")
                        .apply(Update::Counter {
                            name: "hits".to_string(),
                            delta: 1.0,
                        });
                }
            }));
        }
        for handle in handles {
            handle.await.expect("writer completes");
        }

        let mut sink: Vec<Sample> = Vec::new();
        engine.flush_into(&mut sink).expect("flush succeeds");
        assert_eq!(sink[0].value, SampleValue::Int(tasks * increments_per_task));

        let store = engine.store();
        let store = store.lock().expect("lock");
        let metric = store
            .get(&MetricKey::new(MetricKind::Counter, "hits"))
            .expect("metric exists");
        assert_eq!(metric.cumulative(), tasks * increments_per_task);
    }
}
