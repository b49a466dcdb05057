//! Daemon lifecycle management.
//!
//! Wires the pool client to a work processor, handles signals, and
//! shuts everything down in order. Credentials come from a
//! [`CredentialStore`] collaborator; OS keychains and other secure
//! backends implement the trait outside this crate, with an
//! environment-variable store as the built-in default.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal::unix::{self, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::compute::{IdleProcessor, WorkProcessor};
use crate::stratum::{PoolClient, PoolConfig, PoolError, PoolEvent, Submission};
use crate::tracing::prelude::*;

/// Nonces handed to the processor per job.
const NONCE_BATCH: u32 = 0x0100_0000;

/// Worker credentials for a pool.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Worker (usually wallet.rig) name
    pub worker: String,
    /// Pool password, often just "x"
    pub password: String,
}

/// Source of pool credentials.
pub trait CredentialStore: Send + Sync {
    /// Look up credentials for a pool. `Ok(None)` means none configured.
    fn credentials(&self, pool_url: &str) -> anyhow::Result<Option<Credentials>>;
}

/// Credentials from GALENA_POOL_USER / GALENA_POOL_PASS.
pub struct EnvCredentials;

impl CredentialStore for EnvCredentials {
    fn credentials(&self, _pool_url: &str) -> anyhow::Result<Option<Credentials>> {
        match std::env::var("GALENA_POOL_USER") {
            Ok(worker) => Ok(Some(Credentials {
                worker,
                password: std::env::var("GALENA_POOL_PASS").unwrap_or_else(|_| "x".to_string()),
            })),
            Err(_) => Ok(None),
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Pool session configuration
    pub pool: PoolConfig,
    /// How often to log a stats snapshot
    pub stats_interval: Duration,
}

/// The daemon: owns the runtime wiring and coordinates shutdown.
pub struct Daemon {
    config: DaemonConfig,
    credentials: Credentials,
    processor: Arc<dyn WorkProcessor>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    /// Build a daemon with explicit collaborators.
    pub fn new(
        config: DaemonConfig,
        store: &dyn CredentialStore,
        processor: Arc<dyn WorkProcessor>,
    ) -> anyhow::Result<Self> {
        let credentials = store
            .credentials(&config.pool.url)?
            .context("no pool credentials configured")?;

        Ok(Self {
            config,
            credentials,
            processor,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// Build a daemon from GALENA_* environment variables, with the idle
    /// work processor.
    pub fn from_env() -> anyhow::Result<Self> {
        let url = std::env::var("GALENA_POOL_URL")
            .context("GALENA_POOL_URL environment variable not set")?;

        let config = DaemonConfig {
            pool: PoolConfig {
                url,
                ..PoolConfig::default()
            },
            stats_interval: Duration::from_secs(60),
        };

        Self::new(config, &EnvCredentials, Arc::new(IdleProcessor))
    }

    /// Run until SIGINT/SIGTERM or a terminal failure.
    pub async fn run(self) -> anyhow::Result<()> {
        info!(pool = %self.config.pool.url, worker = %self.credentials.worker, "starting");

        let (client, mut events) = PoolClient::spawn(self.config.pool.clone());

        // Failures from here on are the supervisor's problem.
        if let Err(e) = client.connect().await {
            warn!(error = %e, "initial connect failed; retrying in background");
        }

        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;
        let mut stats_ticker = tokio::time::interval(self.config.stats_interval);
        let mut work_task: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    self.handle_event(event, &client, &mut work_task);
                }
                _ = stats_ticker.tick() => {
                    if let Ok(stats) = client.stats().await {
                        info!(stats = %stats, "session stats");
                    }
                }
                _ = self.shutdown.cancelled() => {
                    break;
                }
                _ = sigint.recv() => {
                    info!("received SIGINT");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM");
                    break;
                }
            }
        }

        trace!("shutting down");
        self.shutdown.cancel();
        if let Some(task) = work_task {
            task.abort();
        }
        client.shutdown().await;
        self.tracker.close();
        self.tracker.wait().await;
        info!("exiting");

        Ok(())
    }

    fn handle_event(
        &self,
        event: PoolEvent,
        client: &PoolClient,
        work_task: &mut Option<JoinHandle<()>>,
    ) {
        match event {
            PoolEvent::Connected { host, port } => {
                info!(host = %host, port, "pool connected; authorizing");
                let client = client.clone();
                let credentials = self.credentials.clone();
                let shutdown = self.shutdown.clone();
                self.tracker.spawn(async move {
                    match client
                        .authenticate(&credentials.worker, &credentials.password)
                        .await
                    {
                        Ok(()) => info!(worker = %credentials.worker, "authorized"),
                        Err(PoolError::AuthenticationFailed(reason)) => {
                            // Retrying bad credentials only gets the
                            // worker banned; stop instead.
                            error!(reason = %reason, "pool rejected credentials; shutting down");
                            shutdown.cancel();
                        }
                        Err(e) => warn!(error = %e, "authorization attempt failed"),
                    }
                });
            }

            PoolEvent::NewJob(job) => {
                debug!(job_id = %job.id, clean_jobs = job.clean_jobs, "starting work");
                if let Some(task) = work_task.take() {
                    task.abort();
                }
                let client = client.clone();
                let processor = Arc::clone(&self.processor);
                let worker = self.credentials.worker.clone();
                *work_task = Some(tokio::spawn(async move {
                    let header = job.header_template();
                    let candidates = processor.search(&header, 0, NONCE_BATCH).await;
                    for candidate in candidates {
                        let submission = Submission {
                            worker: worker.clone(),
                            job_id: job.id.clone(),
                            extranonce2: vec![0; job.extranonce2_size],
                            ntime: job.ntime,
                            nonce: candidate.nonce,
                            result: candidate.result,
                        };
                        match client.submit(submission).await {
                            Ok(true) => {
                                info!(
                                    nonce = format!("{:#010x}", candidate.nonce),
                                    "share accepted"
                                );
                            }
                            Ok(false) => {
                                warn!(
                                    nonce = format!("{:#010x}", candidate.nonce),
                                    "share rejected"
                                );
                            }
                            Err(PoolError::ReplayRejected) => {
                                debug!("duplicate candidate skipped");
                            }
                            Err(e) => warn!(error = %e, "submit failed"),
                        }
                    }
                }));
            }

            PoolEvent::DifficultyChanged(difficulty) => {
                info!(difficulty, "pool difficulty changed");
            }

            PoolEvent::Reconnecting { attempt, delay } => {
                info!(attempt, delay_secs = delay.as_secs(), "reconnect scheduled");
            }

            PoolEvent::Disconnected(Some(reason)) => {
                warn!(reason = %reason, "connection lost");
            }

            PoolEvent::Disconnected(None) => {
                info!("disconnected");
            }

            PoolEvent::Error(error) => {
                warn!(error = %error, "pool error");
            }

            PoolEvent::StateChanged(state) => {
                debug!(state = %state, "connection state");
            }

            // The submit path already logs verdicts with more context.
            PoolEvent::SubmitResult { .. } | PoolEvent::StatsUpdated(_) => {}
        }
    }
}
