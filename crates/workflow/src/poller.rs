use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use dealflow_core::errors::ApplicationError;

/// A running poll loop. Stops after the shutdown channel flips to `true`.
pub struct PollerHandle {
    name: String,
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> Result<(), JoinError> {
        self.task.await
    }
}

/// Runs `tick` every `period` until shutdown. The first tick runs immediately; ticks missed
/// while a pass overruns are skipped rather than bunched up. A failed pass is logged and the
/// loop carries on.
pub fn spawn_poller<F, Fut>(
    name: impl Into<String>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> PollerHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), ApplicationError>> + Send,
{
    let name = name.into();
    let loop_name = name.clone();
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            event_name = "workflow.poller.started",
            poller = %loop_name,
            period_secs = period.as_secs_f64(),
            "poller started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = tick().await {
                        warn!(
                            event_name = "workflow.poller.pass_failed",
                            poller = %loop_name,
                            error = %error,
                            "poll pass failed"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(event_name = "workflow.poller.stopped", poller = %loop_name, "poller stopped");
    });

    PollerHandle { name, task }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::watch;

    use dealflow_core::errors::ApplicationError;

    use super::spawn_poller;

    #[tokio::test]
    async fn keeps_polling_through_failures_and_stops_on_shutdown() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let passes = Arc::new(AtomicUsize::new(0));
        let counter = passes.clone();

        let handle = spawn_poller("test", Duration::from_millis(10), shutdown_rx, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ApplicationError::Persistence("database is locked".to_string()))
            }
        });

        tokio::time::sleep(Duration::from_millis(120)).await;
        shutdown_tx.send(true).expect("send shutdown");
        tokio::time::timeout(Duration::from_secs(2), handle.join())
            .await
            .expect("poller stops")
            .expect("poller task joins");

        let seen = passes.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected repeated passes, saw {seen}");
    }

    #[tokio::test]
    async fn dropping_the_shutdown_sender_stops_the_loop() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_poller("orphan", Duration::from_secs(3600), shutdown_rx, || async { Ok(()) });
        assert_eq!(handle.name(), "orphan");

        drop(shutdown_tx);
        tokio::time::timeout(Duration::from_secs(2), handle.join())
            .await
            .expect("poller stops")
            .expect("poller task joins");
    }
}
