//! Supervisor: starts the loops this process's role calls for, reports
//! their liveness, and shuts them down cooperatively.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::PipelineConfig;
use crate::enrich::Enrichers;
use crate::error::ConfigError;
use crate::mailbox::Mailbox;
use crate::pipeline::{Consumer, PipelineStats, Producer, RecoverySweeper, StatsSnapshot};
use crate::store::ItemStore;

/// Collaborators the loops are built from.
pub struct PipelineDeps {
    pub store: Arc<dyn ItemStore>,
    /// Required when the role runs the producer.
    pub mailbox: Option<Arc<dyn Mailbox>>,
    /// Required when the role runs consumers.
    pub enrichers: Option<Enrichers>,
    pub allowed_senders: Vec<String>,
    /// Messages from this address are never ingested.
    pub own_address: Option<String>,
}

/// Liveness of one supervised loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopStatus {
    pub name: String,
    pub running: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub role: &'static str,
    pub shutting_down: bool,
    pub loops: Vec<LoopStatus>,
    pub stats: StatsSnapshot,
}

struct LoopHandle {
    name: String,
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Clears the running flag when the loop future finishes or is dropped.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Supervisor {
    config: PipelineConfig,
    cancel: CancellationToken,
    stats: Arc<PipelineStats>,
    producer: Option<Arc<Producer>>,
    loops: Mutex<Vec<LoopHandle>>,
    statuses: Vec<(String, Arc<AtomicBool>)>,
}

impl Supervisor {
    /// Build and spawn every loop the configured role needs.
    ///
    /// Fails without spawning anything if a required collaborator is missing.
    pub fn start(config: PipelineConfig, deps: PipelineDeps) -> Result<Self, ConfigError> {
        let role = config.role;

        let mailbox = match (role.runs_producer(), deps.mailbox) {
            (true, None) => {
                return Err(ConfigError::InvalidValue {
                    key: "MAILROOM_ROLE".into(),
                    message: format!("role '{}' needs a configured mailbox", role.as_str()),
                });
            }
            (true, Some(mailbox)) => Some(mailbox),
            (false, _) => None,
        };
        let enrichers = match (role.runs_consumers(), deps.enrichers) {
            (true, None) => {
                return Err(ConfigError::InvalidValue {
                    key: "MAILROOM_ROLE".into(),
                    message: format!("role '{}' needs enrichment configured", role.as_str()),
                });
            }
            (true, Some(enrichers)) => Some(enrichers),
            (false, _) => None,
        };

        let cancel = CancellationToken::new();
        let stats = Arc::new(PipelineStats::default());
        let mut loops = Vec::new();

        let producer = mailbox.map(|mailbox| {
            Arc::new(
                Producer::new(mailbox, deps.store.clone())
                    .with_sender_filter(deps.allowed_senders, deps.own_address)
                    .with_intervals(config.fetch_interval, config.fetch_error_interval)
                    .with_stats(stats.clone()),
            )
        });
        if let Some(producer) = &producer {
            let producer = producer.clone();
            loops.push(spawn_loop("producer", &cancel, move |cancel| async move {
                producer.run(cancel).await
            }));
        }

        if let Some(enrichers) = enrichers {
            for n in 0..config.consumer_workers {
                let name = format!("consumer-{n}");
                let consumer = Consumer::new(deps.store.clone(), enrichers.clone())
                    .with_timing(config.enrich_timeout, config.idle_interval)
                    .with_stats(stats.clone())
                    .with_name(name.clone());
                loops.push(spawn_loop(&name, &cancel, move |cancel| async move {
                    consumer.run(cancel).await
                }));
            }

            let sweeper = RecoverySweeper::new(deps.store.clone())
                .with_timing(config.stale_after, config.sweep_interval)
                .with_retry(config.retry.clone())
                .with_stats(stats.clone());
            loops.push(spawn_loop("recovery", &cancel, move |cancel| async move {
                sweeper.run(cancel).await
            }));
        }

        let statuses = loops
            .iter()
            .map(|l| (l.name.clone(), l.running.clone()))
            .collect();
        info!(role = role.as_str(), loops = loops.len(), "Pipeline started");

        Ok(Self {
            config,
            cancel,
            stats,
            producer,
            loops: Mutex::new(loops),
            statuses,
        })
    }

    /// The running producer, for on-demand ingestion.
    pub fn producer(&self) -> Option<Arc<Producer>> {
        self.producer.clone()
    }

    pub fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            role: self.config.role.as_str(),
            shutting_down: self.cancel.is_cancelled(),
            loops: self
                .statuses
                .iter()
                .map(|(name, running)| LoopStatus {
                    name: name.clone(),
                    running: running.load(Ordering::SeqCst),
                })
                .collect(),
            stats: self.stats.snapshot(),
        }
    }

    /// Signal every loop to stop and wait for them. Each loop finishes the
    /// item or cycle it is in first. Calling this twice is harmless.
    pub async fn shutdown(&self) {
        info!("Shutting down pipeline");
        self.cancel.cancel();

        let loops = {
            let mut guard = self
                .loops
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *guard)
        };

        let (names, handles): (Vec<_>, Vec<_>) =
            loops.into_iter().map(|l| (l.name, l.handle)).unzip();
        for (name, result) in names.iter().zip(join_all(handles).await) {
            if let Err(e) = result {
                error!(loop_name = %name, error = %e, "Loop task ended abnormally");
            }
        }
        info!("Pipeline stopped");
    }
}

fn spawn_loop<F, Fut>(name: &str, cancel: &CancellationToken, body: F) -> LoopHandle
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let running = Arc::new(AtomicBool::new(true));
    let guard = RunningGuard(running.clone());
    let fut = body(cancel.clone());
    let handle = tokio::spawn(async move {
        let _guard = guard;
        fut.await
    });
    LoopHandle {
        name: name.to_string(),
        running,
        handle,
    }
}
