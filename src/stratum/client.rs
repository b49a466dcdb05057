//! Public pool client handle.
//!
//! [`PoolClient::spawn`] wires the whole session together: the session
//! actor, the reconnection supervisor, the replay guard, and the event
//! channel handed back to the caller. Ownership is a straight line: the
//! orchestrator owns the client, the client owns its tasks, and events
//! flow one way out through the channel.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::error::{PoolError, PoolResult};
use super::messages::{PoolEvent, Submission};
use super::reconnect::ReconnectSupervisor;
use super::replay::ReplayGuard;
use super::session::{Command, PoolConfig, Session, StatsSnapshot};

/// Handle to a running pool session.
///
/// All methods are non-blocking from the caller's perspective: they hand
/// the call into the session task and resolve when the session completes
/// it. The handle is cheap to clone; every clone talks to the same
/// session.
#[derive(Clone)]
pub struct PoolClient {
    commands: mpsc::Sender<Command>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl PoolClient {
    /// Start a session for `config`.
    ///
    /// Returns the handle and the event stream. Dropping the receiver
    /// does not stop the session; call [`shutdown`](Self::shutdown) for
    /// that.
    pub fn spawn(config: PoolConfig) -> (Self, mpsc::Receiver<PoolEvent>) {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (command_tx, command_rx) = mpsc::channel(32);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let replay = Arc::new(ReplayGuard::new(config.replay_window));

        let supervisor = ReconnectSupervisor::new(
            config.reconnect.clone(),
            signal_rx,
            command_tx.clone(),
            event_tx.clone(),
            shutdown.clone(),
        );
        let session = Session::new(
            config,
            replay,
            event_tx,
            command_rx,
            signal_tx,
            shutdown.clone(),
        );

        let tracker = TaskTracker::new();
        tracker.spawn(session.run());
        tracker.spawn(supervisor.run());
        tracker.close();

        (
            Self {
                commands: command_tx,
                shutdown,
                tracker,
            },
            event_rx,
        )
    }

    /// Open the transport. Valid only while disconnected.
    pub async fn connect(&self) -> PoolResult<()> {
        self.request(|reply| Command::Connect { reply }).await?
    }

    /// Authorize a worker on the connected pool.
    pub async fn authenticate(&self, worker: &str, password: &str) -> PoolResult<()> {
        let worker = worker.to_string();
        let password = password.to_string();
        self.request(|reply| Command::Authenticate {
            worker,
            password,
            reply,
        })
        .await?
    }

    /// Submit a share. Resolves to the pool's verdict: `Ok(true)` for
    /// accepted, `Ok(false)` for rejected.
    pub async fn submit(&self, submission: Submission) -> PoolResult<bool> {
        self.request(|reply| Command::Submit { submission, reply })
            .await?
    }

    /// Close the connection intentionally. No automatic reconnect will
    /// follow, and every in-flight request fails before this resolves.
    pub async fn disconnect(&self) -> PoolResult<()> {
        self.request(|reply| Command::Disconnect { reply }).await?
    }

    /// Snapshot of the session counters.
    pub async fn stats(&self) -> PoolResult<StatsSnapshot> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Stop the session and supervisor and wait for both to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.wait().await;
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> PoolResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(make(reply_tx))
            .await
            .map_err(|_| PoolError::ConnectionClosed)?;
        reply_rx.await.map_err(|_| PoolError::ConnectionClosed)
    }
}
