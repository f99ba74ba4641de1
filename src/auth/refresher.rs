use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::config::RefreshConfig;
use crate::util::http::NetworkError;

use super::pipeline::{AuthError, AuthPipeline};
use super::store::CredentialStore;

type Outcome = Option<Result<(), AuthError>>;

/// Proactively refreshes credentials before they expire and absorbs
/// concurrent refresh triggers: while a refresh chain is in flight, further
/// callers subscribe to its outcome instead of starting their own.
///
/// The chain itself runs in a detached task, so a caller going away cannot
/// leave the store half-updated.
pub struct CredentialRefresher {
    pipeline: Arc<AuthPipeline>,
    store: Arc<CredentialStore>,
    config: RefreshConfig,
    pending: Mutex<Option<watch::Receiver<Outcome>>>,
}

impl CredentialRefresher {
    pub fn new(
        pipeline: Arc<AuthPipeline>,
        store: Arc<CredentialStore>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            pipeline,
            store,
            config,
            pending: Mutex::new(None),
        }
    }

    /// Triggers a refresh, or joins the one already running, and waits for
    /// its outcome.
    pub async fn refresh(&self) -> Result<(), AuthError> {
        let mut rx = self.subscribe().await;
        loop {
            {
                let outcome = rx.borrow_and_update();
                if let Some(result) = outcome.as_ref() {
                    return result.clone();
                }
            }
            if rx.changed().await.is_err() {
                return Err(AuthError::Network(NetworkError::Unreachable(
                    "refresh task terminated".to_string(),
                )));
            }
        }
    }

    /// Like [`Self::refresh`] but bounded; callers that cannot block
    /// indefinitely (directory, dispatch) give up after `wait`.
    pub async fn refresh_within(&self, wait: Duration) -> Result<(), AuthError> {
        match tokio::time::timeout(wait, self.refresh()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AuthError::Network(NetworkError::Timeout)),
        }
    }

    /// Returns a receiver for the in-flight refresh, starting one if none
    /// is running.
    async fn subscribe(&self) -> watch::Receiver<Outcome> {
        let mut pending = self.pending.lock().await;
        if let Some(rx) = pending.as_ref() {
            if rx.borrow().is_none() {
                // still in flight, join it
                return rx.clone();
            }
        }

        let (tx, rx) = watch::channel(None);
        *pending = Some(rx.clone());
        let pipeline = Arc::clone(&self.pipeline);
        tokio::spawn(async move {
            let outcome = pipeline.refresh().await.map(|_| ());
            let _ = tx.send(Some(outcome));
        });
        rx
    }

    /// Starts the recurring expiry check. The loop runs until the returned
    /// handle is stopped or dropped.
    pub fn start(self: &Arc<Self>) -> RefresherHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(());
        let refresher = Arc::clone(self);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refresher.config.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if refresher.store.expiring_within(refresher.config.safety_margin) {
                            debug!("credentials within safety margin, refreshing");
                            if let Err(err) = refresher.refresh().await {
                                warn!("background refresh failed: {err}");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        RefresherHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Keeps the background expiry check alive; stopping (or dropping) the
/// handle terminates the loop.
pub struct RefresherHandle {
    shutdown: watch::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl RefresherHandle {
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }
}

impl Drop for RefresherHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
