//! Background task that expires sessions.
//!
//! Ticks every `interval`, runs [`FilteringEngine::expire`] and applies the
//! resulting TCP probes as [`Effect`]s once the tables are unlocked.

use crate::clock::Instant;
use crate::effect::{Effect, EffectSink};
use crate::filtering::FilteringEngine;
use crate::pool::{Pool4, Pool6};
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// A running expiry task. Dropping it stops the task.
pub struct Reaper {
    /// Shutdown signal sender
    shutdown_tx: watch::Sender<bool>,
    /// Handle to the reaper task
    _handle: tokio::task::JoinHandle<()>,
}

impl Reaper {
    /// Start the reaper on the current tokio runtime.
    pub fn spawn<P4, P6>(
        engine: Arc<FilteringEngine<P4, P6>>,
        sink: Arc<dyn EffectSink>,
        interval: Duration,
    ) -> Self
    where
        P4: Pool4 + 'static,
        P6: Pool6 + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let interval = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            Self::run(engine, sink, interval, shutdown_rx).await;
        });

        Self {
            shutdown_tx,
            _handle: handle,
        }
    }

    async fn run<P4: Pool4, P6: Pool6>(
        engine: Arc<FilteringEngine<P4, P6>>,
        sink: Arc<dyn EffectSink>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("Session reaper started, interval {:?}", interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for probe in engine.expire(Instant::now()) {
                        sink.apply(&Effect::SendTcpProbe(probe));
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Session reaper shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Stop the reaper.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.shutdown();
    }
}
