//! Saga timeout sweeper
//!
//! A background worker that finds non-completed sagas whose last update
//! is older than the configured timeout, parks them in the `TimedOut`
//! state, and finalizes them. Losing an optimistic-concurrency race just
//! means another worker got there first; any other failure is logged and
//! the loop keeps running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{MessagingError, MessagingResult};
use crate::saga::repository::SagaRepository;
use crate::saga::{Saga, TIMED_OUT_STATE};
use crate::timebase::Timebase;

/// Sweeper configuration
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Interval between sweeps
    pub check_interval: Duration,
    /// Age past which a non-completed saga is considered stale
    pub default_timeout: Duration,
    /// Whether the worker runs at all
    pub enabled: bool,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            default_timeout: Duration::from_secs(24 * 3600),
            enabled: true,
        }
    }
}

impl SweeperConfig {
    /// Validate configuration
    pub fn validate(&self) -> MessagingResult<()> {
        if self.enabled && self.check_interval.is_zero() {
            return Err(MessagingError::invalid_input(
                "check_interval",
                "must be positive when the sweeper is enabled",
            ));
        }
        if self.default_timeout.is_zero() {
            return Err(MessagingError::invalid_input(
                "default_timeout",
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Background worker that times out stalled sagas.
pub struct SagaTimeoutSweeper<TSaga: Saga> {
    repository: Arc<dyn SagaRepository<TSaga>>,
    clock: Arc<dyn Timebase>,
    config: SweeperConfig,
    shutdown_token: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl<TSaga: Saga + Clone> SagaTimeoutSweeper<TSaga> {
    /// Create a sweeper and start its worker (when enabled). Fails fast
    /// on invalid configuration.
    pub fn new(
        repository: Arc<dyn SagaRepository<TSaga>>,
        clock: Arc<dyn Timebase>,
        config: SweeperConfig,
    ) -> MessagingResult<Arc<Self>> {
        config.validate()?;
        let sweeper = Arc::new(Self {
            repository,
            clock,
            shutdown_token: CancellationToken::new(),
            worker: Mutex::new(None),
            disposed: AtomicBool::new(false),
            config,
        });
        if sweeper.config.enabled {
            let handle = tokio::spawn(sweeper.clone().run());
            *sweeper.worker.lock() = Some(handle);
        }
        Ok(sweeper)
    }

    /// Stop the worker promptly.
    ///
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_token.cancel();
        let handle = { self.worker.lock().take() };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.clock.sleep(self.config.check_interval) => {}
                _ = self.shutdown_token.cancelled() => break,
            }
            self.sweep_once().await;
        }
    }

    /// One sweep pass. Never panics and never lets an error kill the loop.
    pub async fn sweep_once(&self) {
        let stale = match self.repository.find_stale(self.config.default_timeout).await {
            Ok(stale) => stale,
            Err(error) => {
                warn!(%error, "failed to query stale sagas");
                return;
            }
        };
        for mut saga in stale {
            let correlation_id = saga.correlation_id();
            saga.set_current_state(TIMED_OUT_STATE.to_string());
            saga.set_completed(true);
            match self.repository.update(&mut saga).await {
                Ok(()) => {
                    info!(%correlation_id, "saga timed out");
                }
                Err(MessagingError::ConcurrencyConflict { .. }) => {
                    // Another worker or a live event won the race.
                    debug!(%correlation_id, "saga advanced while timing out, skipping");
                }
                Err(error) => {
                    warn!(%correlation_id, %error, "failed to time out saga");
                }
            }
        }
    }
}
