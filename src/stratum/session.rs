//! Connection session: the state machine at the center of the client.
//!
//! The session is a single actor task owning the transport, the
//! connection state, the pending-request map, and the current job.
//! Public API calls arrive as [`Command`]s over a channel and complete
//! through oneshot senders, so every touch of session state happens on
//! the actor; no lock is needed. Incoming frames are either responses,
//! matched to pending requests purely by id, or notifications,
//! dispatched in arrival order.
//!
//! Every request gets a fixed deadline when it is sent. A pending entry
//! is removed exactly once: by its response, by its deadline firing, or
//! by the connection going away, whichever happens first. The oneshot
//! completion makes delivering two outcomes for one request impossible
//! by construction.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, info, warn};

use super::connection::{Connection, Transport};
use super::error::{PoolError, PoolResult};
use super::job::Job;
use super::messages::{Envelope, PoolEvent, RpcError, Submission};
use super::reconnect::{ReconnectPolicy, SessionSignal};
use super::replay::{Fingerprint, ReplayGuard, DEFAULT_WINDOW};

/// Extranonce2 width assumed until the pool announces one.
const DEFAULT_EXTRANONCE2_SIZE: usize = 4;

/// Where the session is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport; the resting state
    Disconnected,
    /// Transport being established
    Connecting,
    /// Transport up, traffic flowing
    Connected,
    /// Transport being torn down on request
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Pool connection configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool URL (stratum+tcp://host:port, stratum+ssl://host:port, or
    /// bare host:port)
    pub url: String,

    /// Deadline for each outstanding request
    pub request_timeout: Duration,

    /// Deadline for establishing the transport
    pub connect_timeout: Duration,

    /// Replay guard window size
    pub replay_window: usize,

    /// Backoff shape for automatic reconnects
    pub reconnect: ReconnectPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            replay_window: DEFAULT_WINDOW,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Counters exposed by value; a copy, never a window into live state.
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    /// Bytes read off the transport
    pub bytes_received: u64,
    /// Bytes written to the transport
    pub bytes_sent: u64,
    /// Requests issued this session
    pub requests_sent: u64,
    /// Jobs received
    pub jobs_received: u64,
    /// Shares the pool accepted
    pub shares_accepted: u64,
    /// Shares the pool rejected
    pub shares_rejected: u64,
    /// Failures of any kind
    pub errors: u64,
    /// Wall-clock time of the last read or write
    pub last_activity: Option<SystemTime>,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "jobs: {}, shares: {}/{} accepted, requests: {}, io: {}B in / {}B out, errors: {}",
            self.jobs_received,
            self.shares_accepted,
            self.shares_accepted + self.shares_rejected,
            self.requests_sent,
            self.bytes_received,
            self.bytes_sent,
            self.errors,
        )
    }
}

/// API calls, handed into the actor.
pub(crate) enum Command {
    /// Open the transport
    Connect {
        reply: oneshot::Sender<PoolResult<()>>,
    },
    /// Authorize a worker
    Authenticate {
        worker: String,
        password: String,
        reply: oneshot::Sender<PoolResult<()>>,
    },
    /// Submit a share
    Submit {
        submission: Submission,
        reply: oneshot::Sender<PoolResult<bool>>,
    },
    /// Close the transport intentionally
    Disconnect {
        reply: oneshot::Sender<PoolResult<()>>,
    },
    /// Snapshot the counters
    Stats {
        reply: oneshot::Sender<StatsSnapshot>,
    },
}

/// How to finish a pending request once its response (or deadline)
/// arrives.
enum Completion {
    Authorize {
        reply: oneshot::Sender<PoolResult<()>>,
    },
    Submit {
        job_id: String,
        nonce: u32,
        reply: oneshot::Sender<PoolResult<bool>>,
    },
}

impl Completion {
    fn fail(self, err: PoolError) {
        match self {
            Completion::Authorize { reply } => {
                let _ = reply.send(Err(err));
            }
            Completion::Submit { reply, .. } => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

struct PendingRequest {
    sent_at: Instant,
    completion: Completion,
    timeout_key: delay_queue::Key,
}

pub(crate) struct Session {
    config: PoolConfig,
    state: ConnectionState,
    transport: Option<Box<dyn Transport>>,
    next_id: u64,
    pending: HashMap<u64, PendingRequest>,
    timeouts: DelayQueue<u64>,
    current_job: Option<Job>,
    extranonce1: Vec<u8>,
    extranonce2_size: usize,
    difficulty: Option<f64>,
    replay: Arc<ReplayGuard>,
    stats: StatsSnapshot,
    last_io: (u64, u64),
    events: mpsc::Sender<PoolEvent>,
    commands: mpsc::Receiver<Command>,
    signals: mpsc::UnboundedSender<SessionSignal>,
    shutdown: CancellationToken,
}

/// Read the next frame, or park forever while there is no transport.
async fn read_next(transport: &mut Option<Box<dyn Transport>>) -> PoolResult<Option<Envelope>> {
    match transport.as_mut() {
        Some(conn) => conn.read_message().await,
        None => std::future::pending().await,
    }
}

impl Session {
    pub(crate) fn new(
        config: PoolConfig,
        replay: Arc<ReplayGuard>,
        events: mpsc::Sender<PoolEvent>,
        commands: mpsc::Receiver<Command>,
        signals: mpsc::UnboundedSender<SessionSignal>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            transport: None,
            next_id: 1,
            pending: HashMap::new(),
            timeouts: DelayQueue::new(),
            current_job: None,
            extranonce1: Vec::new(),
            extranonce2_size: DEFAULT_EXTRANONCE2_SIZE,
            difficulty: None,
            replay,
            stats: StatsSnapshot::default(),
            last_io: (0, 0),
            events,
            commands,
            signals,
            shutdown,
        }
    }

    /// Actor main loop.
    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                io = read_next(&mut self.transport) => {
                    self.handle_io(io).await;
                }
                Some(expired) = self.timeouts.next() => {
                    self.expire_request(expired.into_inner());
                }
                _ = self.shutdown.cancelled() => break,
            }
        }

        // Nothing may outlive the session.
        self.fail_all_pending();
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { reply } => self.do_connect(reply).await,
            Command::Authenticate {
                worker,
                password,
                reply,
            } => self.do_authenticate(worker, password, reply).await,
            Command::Submit { submission, reply } => self.do_submit(submission, reply).await,
            Command::Disconnect { reply } => self.do_disconnect(reply).await,
            Command::Stats { reply } => {
                self.sync_io_totals();
                let _ = reply.send(self.stats.clone());
            }
        }
    }

    async fn do_connect(&mut self, reply: oneshot::Sender<PoolResult<()>>) {
        if self.state != ConnectionState::Disconnected {
            let _ = reply.send(Err(PoolError::InvalidState {
                op: "connect",
                state: self.state,
            }));
            return;
        }

        self.set_state(ConnectionState::Connecting).await;

        let dial = async {
            match tokio::time::timeout(
                self.config.connect_timeout,
                Connection::connect(&self.config.url),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(PoolError::Timeout),
            }
        };
        let result = tokio::select! {
            result = dial => result,
            _ = self.shutdown.cancelled() => Err(PoolError::ConnectionClosed),
        };

        match result {
            Ok(conn) => {
                let peer = conn.peer();
                self.transport = Some(Box::new(conn));
                self.last_io = (0, 0);
                self.set_state(ConnectionState::Connected).await;
                if let Some((host, port)) = peer {
                    info!(host = %host, port, "connected to pool");
                    self.emit(PoolEvent::Connected { host, port }).await;
                }
                let _ = self.signals.send(SessionSignal::Established);
                let _ = reply.send(Ok(()));
            }
            Err(e) => {
                warn!(url = %self.config.url, error = %e, "connect failed");
                self.stats.errors += 1;
                self.set_state(ConnectionState::Disconnected).await;
                self.emit(PoolEvent::Error(format!("connect failed: {e}")))
                    .await;
                let _ = self.signals.send(SessionSignal::Lost);
                let _ = reply.send(Err(e));
            }
        }
    }

    async fn do_authenticate(
        &mut self,
        worker: String,
        password: String,
        reply: oneshot::Sender<PoolResult<()>>,
    ) {
        if self.state != ConnectionState::Connected {
            let _ = reply.send(Err(PoolError::InvalidState {
                op: "authenticate",
                state: self.state,
            }));
            return;
        }

        debug!(worker = %worker, "authorizing");
        self.send_request(
            "mining.authorize",
            json!([worker, password]),
            Completion::Authorize { reply },
        )
        .await;
    }

    async fn do_submit(&mut self, submission: Submission, reply: oneshot::Sender<PoolResult<bool>>) {
        if self.state != ConnectionState::Connected {
            let _ = reply.send(Err(PoolError::InvalidState {
                op: "submit",
                state: self.state,
            }));
            return;
        }

        let fingerprint = Fingerprint::from(&submission);
        if !self.replay.check_and_mark(&fingerprint) {
            debug!(
                job_id = %submission.job_id,
                nonce = format!("{:#010x}", submission.nonce),
                "duplicate submission suppressed"
            );
            let _ = reply.send(Err(PoolError::ReplayRejected));
            return;
        }

        debug!(
            job_id = %submission.job_id,
            nonce = format!("{:#010x}", submission.nonce),
            "submitting share"
        );
        let params = submission.to_wire_params();
        self.send_request(
            "mining.submit",
            params,
            Completion::Submit {
                job_id: submission.job_id,
                nonce: submission.nonce,
                reply,
            },
        )
        .await;
    }

    async fn do_disconnect(&mut self, reply: oneshot::Sender<PoolResult<()>>) {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {}
            state => {
                let _ = reply.send(Err(PoolError::InvalidState {
                    op: "disconnect",
                    state,
                }));
                return;
            }
        }

        self.set_state(ConnectionState::Disconnecting).await;
        self.sync_io_totals();
        self.transport = None;
        self.fail_all_pending();
        self.set_state(ConnectionState::Disconnected).await;
        info!("disconnected");
        self.emit(PoolEvent::Disconnected(None)).await;
        let _ = self.signals.send(SessionSignal::Closed);
        let _ = reply.send(Ok(()));
    }

    /// Issue a request: write, arm the deadline, remember the completion.
    async fn send_request(&mut self, method: &str, params: Value, completion: Completion) {
        let Some(conn) = self.transport.as_mut() else {
            completion.fail(PoolError::ConnectionClosed);
            return;
        };

        let id = self.next_id;
        self.next_id += 1;

        let msg = Envelope::request(id, method, params);
        match conn.write_message(&msg).await {
            Ok(()) => {
                let timeout_key = self.timeouts.insert(id, self.config.request_timeout);
                self.pending.insert(
                    id,
                    PendingRequest {
                        sent_at: Instant::now(),
                        completion,
                        timeout_key,
                    },
                );
                self.stats.requests_sent += 1;
                self.touch();
                self.sync_io_totals();
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(method, error = %reason, "write failed");
                completion.fail(e);
                self.connection_lost(Some(reason)).await;
            }
        }
    }

    async fn handle_io(&mut self, io: PoolResult<Option<Envelope>>) {
        match io {
            Ok(Some(msg)) => {
                self.touch();
                self.sync_io_totals();
                self.handle_envelope(msg).await;
            }
            Ok(None) => {
                info!("connection closed by pool");
                self.connection_lost(Some("connection closed by pool".to_string()))
                    .await;
            }
            Err(e) => {
                warn!(error = %e, "transport failure");
                self.connection_lost(Some(e.to_string())).await;
            }
        }
    }

    async fn handle_envelope(&mut self, msg: Envelope) {
        match msg {
            Envelope::Reply { id, result, error } => self.handle_reply(id, result, error).await,
            Envelope::Call {
                id: None,
                method,
                params,
            } => self.handle_notification(&method, &params).await,
            Envelope::Call {
                id: Some(_),
                method,
                ..
            } => {
                warn!(method = %method, "server sent a request; ignoring");
            }
        }
    }

    /// Resolve a pending request from its response. Exactly once: the
    /// entry is removed before the completion fires, and a second
    /// response for the same id finds nothing.
    async fn handle_reply(&mut self, id: u64, result: Option<Value>, error: Option<Value>) {
        let Some(pending) = self.pending.remove(&id) else {
            debug!(id, "response for unknown or already completed request");
            return;
        };
        self.timeouts.remove(&pending.timeout_key);

        let outcome = match (result, error) {
            (_, Some(err)) if !err.is_null() => {
                let rpc = RpcError::from_value(&err);
                Err(PoolError::Server {
                    code: rpc.code,
                    message: rpc.message,
                })
            }
            (Some(value), _) => Ok(value),
            (None, _) => Ok(Value::Null),
        };

        match pending.completion {
            Completion::Authorize { reply } => {
                let verdict = match outcome {
                    Ok(value) => {
                        if value.as_bool().unwrap_or(false) {
                            info!("worker authorized");
                            Ok(())
                        } else {
                            Err(PoolError::AuthenticationFailed(format!(
                                "pool returned {value}"
                            )))
                        }
                    }
                    Err(PoolError::Server { message, .. }) => {
                        Err(PoolError::AuthenticationFailed(message))
                    }
                    Err(e) => Err(e),
                };
                if verdict.is_err() {
                    self.stats.errors += 1;
                }
                let _ = reply.send(verdict);
            }
            Completion::Submit {
                job_id,
                nonce,
                reply,
            } => {
                let verdict = match outcome {
                    Ok(value) => Ok(value.as_bool().unwrap_or(false)),
                    Err(PoolError::Server { code, message }) => {
                        // An explicit rejection is a normal outcome, not
                        // a client failure.
                        debug!(code, message = %message, job_id = %job_id, "share rejected");
                        Ok(false)
                    }
                    Err(e) => Err(e),
                };
                match &verdict {
                    Ok(true) => self.stats.shares_accepted += 1,
                    Ok(false) => self.stats.shares_rejected += 1,
                    Err(_) => self.stats.errors += 1,
                }
                if let Ok(accepted) = &verdict {
                    self.emit(PoolEvent::SubmitResult {
                        accepted: *accepted,
                        job_id,
                        nonce,
                    })
                    .await;
                    self.emit(PoolEvent::StatsUpdated(self.stats.clone())).await;
                }
                let _ = reply.send(verdict);
            }
        }
    }

    /// Notifications, dispatched by method name in arrival order.
    async fn handle_notification(&mut self, method: &str, params: &Value) {
        match method {
            "mining.notify" => {
                let Some(arr) = params.as_array() else {
                    warn!("mining.notify params not an array; dropping");
                    return;
                };
                match Job::from_notify_params(arr, &self.extranonce1, self.extranonce2_size) {
                    Ok(job) => {
                        debug!(job_id = %job.id, clean_jobs = job.clean_jobs, "new job");
                        self.stats.jobs_received += 1;
                        self.current_job = Some(job.clone());
                        self.emit(PoolEvent::NewJob(job)).await;
                    }
                    Err(e) => warn!(error = %e, "dropping malformed mining.notify"),
                }
            }
            "mining.set_difficulty" => {
                let value = params
                    .as_array()
                    .and_then(|a| a.first())
                    .and_then(Value::as_f64);
                match value {
                    Some(difficulty) => {
                        info!(difficulty, "pool set difficulty");
                        self.difficulty = Some(difficulty);
                        self.emit(PoolEvent::DifficultyChanged(difficulty)).await;
                    }
                    None => warn!("dropping malformed mining.set_difficulty"),
                }
            }
            "mining.set_extranonce" => {
                let Some(hex_str) = params
                    .as_array()
                    .and_then(|a| a.first())
                    .and_then(Value::as_str)
                else {
                    warn!("dropping malformed mining.set_extranonce");
                    return;
                };
                match hex::decode(hex_str) {
                    Ok(extranonce1) => {
                        if let Some(size) = params
                            .as_array()
                            .and_then(|a| a.get(1))
                            .and_then(Value::as_u64)
                        {
                            self.extranonce2_size = size as usize;
                        }
                        info!(extranonce1 = %hex_str, "extranonce updated");
                        self.extranonce1 = extranonce1;
                        if let Some(job) = self.current_job.take() {
                            // Supersede the current job rather than
                            // mutating it.
                            self.current_job = Some(job.with_extranonce(
                                self.extranonce1.clone(),
                                self.extranonce2_size,
                            ));
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping malformed mining.set_extranonce"),
                }
            }
            other => {
                // Pools emit vendor extensions; unknown methods are not
                // an error.
                warn!(method = %other, "ignoring unknown notification");
            }
        }
    }

    /// Deadline fired before the response arrived.
    fn expire_request(&mut self, id: u64) {
        if let Some(pending) = self.pending.remove(&id) {
            warn!(
                id,
                elapsed_ms = pending.sent_at.elapsed().as_millis() as u64,
                "request timed out"
            );
            self.stats.errors += 1;
            pending.completion.fail(PoolError::Timeout);
        }
    }

    /// Unsolicited transport loss: straight to Disconnected, fail
    /// everything in flight, wake the supervisor.
    async fn connection_lost(&mut self, reason: Option<String>) {
        self.sync_io_totals();
        self.transport = None;
        self.stats.errors += 1;
        self.fail_all_pending();
        self.set_state(ConnectionState::Disconnected).await;
        self.emit(PoolEvent::Disconnected(reason)).await;
        let _ = self.signals.send(SessionSignal::Lost);
    }

    fn fail_all_pending(&mut self) {
        self.timeouts.clear();
        for (_, pending) in self.pending.drain() {
            pending.completion.fail(PoolError::ConnectionClosed);
        }
    }

    async fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "state change");
            self.state = state;
            self.emit(PoolEvent::StateChanged(state)).await;
        }
    }

    async fn emit(&self, event: PoolEvent) {
        self.events.send(event).await.ok();
    }

    fn touch(&mut self) {
        self.stats.last_activity = Some(SystemTime::now());
    }

    fn sync_io_totals(&mut self) {
        if let Some(conn) = &self.transport {
            let (bytes_in, bytes_out) = conn.io_totals();
            self.stats.bytes_received += bytes_in - self.last_io.0;
            self.stats.bytes_sent += bytes_out - self.last_io.1;
            self.last_io = (bytes_in, bytes_out);
        }
    }
}
