//! Reconnection supervisor.
//!
//! Watches the session for failure disconnects and re-dials with capped
//! exponential backoff. The supervisor is one serial task, so at most
//! one reconnect attempt is ever outstanding; a stale trigger that fires
//! after the session is already connecting or connected lands as an
//! InvalidState reply and ends the retry loop.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::PoolError;
use super::messages::PoolEvent;
use super::session::Command;

/// Backoff shape for reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first retry
    pub initial: Duration,
    /// Ceiling the delay doubles up to
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(300),
        }
    }
}

/// Doubled delay, clamped to the policy ceiling.
fn next_delay(current: Duration, policy: &ReconnectPolicy) -> Duration {
    (current * 2).min(policy.max)
}

/// Session happenings the supervisor reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionSignal {
    /// A connect succeeded (user-initiated or ours): reset backoff
    Established,
    /// Failure disconnect or failed connect attempt: schedule a retry
    Lost,
    /// Explicit disconnect: cancel any scheduled retry
    Closed,
}

pub(crate) struct ReconnectSupervisor {
    policy: ReconnectPolicy,
    signals: mpsc::UnboundedReceiver<SessionSignal>,
    commands: mpsc::Sender<Command>,
    events: mpsc::Sender<PoolEvent>,
    shutdown: CancellationToken,
}

impl ReconnectSupervisor {
    pub(crate) fn new(
        policy: ReconnectPolicy,
        signals: mpsc::UnboundedReceiver<SessionSignal>,
        commands: mpsc::Sender<Command>,
        events: mpsc::Sender<PoolEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            policy,
            signals,
            commands,
            events,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut delay = self.policy.initial;
        let mut attempts: u32 = 0;

        loop {
            let signal = tokio::select! {
                signal = self.signals.recv() => match signal {
                    Some(s) => s,
                    None => return,
                },
                _ = self.shutdown.cancelled() => return,
            };

            match signal {
                SessionSignal::Established => {
                    delay = self.policy.initial;
                    attempts = 0;
                }
                SessionSignal::Closed => {
                    // Nothing scheduled while idle; the retry loop below
                    // handles cancellation during a wait.
                }
                SessionSignal::Lost => {
                    if !self.retry_until_connected(&mut delay, &mut attempts).await {
                        return;
                    }
                }
            }
        }
    }

    /// Retry loop entered on a failure disconnect.
    ///
    /// Returns false when the supervisor should exit entirely.
    async fn retry_until_connected(&mut self, delay: &mut Duration, attempts: &mut u32) -> bool {
        loop {
            *attempts += 1;
            info!(attempt = *attempts, delay_secs = delay.as_secs_f64(), "scheduling reconnect");
            self.events
                .send(PoolEvent::Reconnecting {
                    attempt: *attempts,
                    delay: *delay,
                })
                .await
                .ok();

            // Wait out the backoff, staying responsive to signals that
            // cancel or obsolete the scheduled attempt.
            tokio::select! {
                _ = tokio::time::sleep(*delay) => {}
                signal = self.signals.recv() => match signal {
                    Some(SessionSignal::Closed) => {
                        debug!("reconnect cancelled by explicit disconnect");
                        *delay = self.policy.initial;
                        *attempts = 0;
                        return true;
                    }
                    Some(SessionSignal::Established) => {
                        *delay = self.policy.initial;
                        *attempts = 0;
                        return true;
                    }
                    // A duplicate loss report while already scheduled is
                    // a no-op.
                    Some(SessionSignal::Lost) => {
                        *attempts -= 1;
                        continue;
                    }
                    None => return false,
                },
                _ = self.shutdown.cancelled() => return false,
            }

            let (reply_tx, reply_rx) = oneshot::channel();
            if self
                .commands
                .send(Command::Connect { reply: reply_tx })
                .await
                .is_err()
            {
                return false;
            }

            match reply_rx.await {
                Ok(Ok(())) => {
                    info!(attempt = *attempts, "reconnected");
                    *delay = self.policy.initial;
                    *attempts = 0;
                    return true;
                }
                Ok(Err(PoolError::InvalidState { .. })) => {
                    // Someone else connected in the meantime; stand down.
                    debug!("session already connecting or connected");
                    return true;
                }
                Ok(Err(e)) => {
                    warn!(attempt = *attempts, error = %e, "reconnect attempt failed");
                    *delay = next_delay(*delay, &self.policy);
                    // The failed attempt also emits a Lost signal; drain
                    // it so it does not re-trigger at the top level.
                    while let Ok(sig) = self.signals.try_recv() {
                        if sig == SessionSignal::Closed {
                            *delay = self.policy.initial;
                            *attempts = 0;
                            return true;
                        }
                    }
                }
                Err(_) => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[test]
    fn next_delay_doubles_to_cap() {
        let policy = ReconnectPolicy::default();
        let mut d = policy.initial;
        let mut schedule = Vec::new();
        for _ in 0..12 {
            schedule.push(d.as_secs());
            d = next_delay(d, &policy);
        }
        assert_eq!(
            schedule,
            vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 300, 300, 300]
        );
    }

    struct Harness {
        signals: mpsc::UnboundedSender<SessionSignal>,
        commands: mpsc::Receiver<Command>,
        events: mpsc::Receiver<PoolEvent>,
        shutdown: CancellationToken,
    }

    fn spawn_supervisor(policy: ReconnectPolicy) -> Harness {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();

        let supervisor = ReconnectSupervisor::new(
            policy,
            signal_rx,
            command_tx,
            event_tx,
            shutdown.clone(),
        );
        tokio::spawn(supervisor.run());

        Harness {
            signals: signal_tx,
            commands: command_rx,
            events: event_rx,
            shutdown,
        }
    }

    async fn fail_next_connect(h: &mut Harness) -> Duration {
        let start = Instant::now();
        let cmd = h.commands.recv().await.expect("supervisor quit");
        let waited = start.elapsed();
        match cmd {
            Command::Connect { reply } => {
                reply
                    .send(Err(PoolError::ConnectionClosed))
                    .ok();
                // Mirror the session: a failed attempt reports Lost.
                h.signals.send(SessionSignal::Lost).unwrap();
            }
            _ => panic!("expected Connect command"),
        }
        waited
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_and_resets_on_success() {
        let mut h = spawn_supervisor(ReconnectPolicy {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(300),
        });

        h.signals.send(SessionSignal::Lost).unwrap();

        // Three consecutive failures: waits of 1s, 2s, 4s.
        for expected_secs in [1, 2, 4] {
            let waited = fail_next_connect(&mut h).await;
            let expected = Duration::from_secs(expected_secs);
            assert!(
                waited >= expected && waited < expected + Duration::from_millis(100),
                "expected ~{expected:?}, waited {waited:?}"
            );
        }

        // Fourth attempt succeeds.
        match h.commands.recv().await.unwrap() {
            Command::Connect { reply } => {
                reply.send(Ok(())).ok();
                h.signals.send(SessionSignal::Established).unwrap();
            }
            _ => panic!("expected Connect command"),
        }

        // A fresh loss starts over at the initial delay.
        h.signals.send(SessionSignal::Lost).unwrap();
        let waited = fail_next_connect(&mut h).await;
        assert!(
            waited >= Duration::from_secs(1) && waited < Duration::from_millis(1100),
            "waited {waited:?}"
        );

        h.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn delay_caps_at_policy_max() {
        let mut h = spawn_supervisor(ReconnectPolicy {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(4),
        });

        h.signals.send(SessionSignal::Lost).unwrap();

        let mut waits = Vec::new();
        for _ in 0..5 {
            waits.push(fail_next_connect(&mut h).await.as_secs());
        }
        assert_eq!(waits, vec![1, 2, 4, 4, 4]);

        h.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_disconnect_cancels_scheduled_attempt() {
        let mut h = spawn_supervisor(ReconnectPolicy {
            initial: Duration::from_secs(60),
            max: Duration::from_secs(300),
        });

        h.signals.send(SessionSignal::Lost).unwrap();

        // The Reconnecting event proves the attempt is scheduled.
        match h.events.recv().await.unwrap() {
            PoolEvent::Reconnecting { attempt: 1, .. } => {}
            other => panic!("unexpected event: {other:?}"),
        }

        // Cancel during the wait; no Connect command may follow.
        h.signals.send(SessionSignal::Closed).unwrap();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(
            h.commands.try_recv().is_err(),
            "connect attempted after cancellation"
        );

        h.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_lost_signals_do_not_double_schedule() {
        let mut h = spawn_supervisor(ReconnectPolicy {
            initial: Duration::from_secs(10),
            max: Duration::from_secs(300),
        });

        h.signals.send(SessionSignal::Lost).unwrap();
        h.signals.send(SessionSignal::Lost).unwrap();
        h.signals.send(SessionSignal::Lost).unwrap();

        let waited = fail_next_connect(&mut h).await;
        assert!(waited >= Duration::from_secs(10), "waited {waited:?}");

        // Exactly one attempt came out of three triggers; the next one
        // is the backed-off retry, not a duplicate.
        let waited = fail_next_connect(&mut h).await;
        assert!(waited >= Duration::from_secs(20), "waited {waited:?}");

        h.shutdown.cancel();
    }
}
