//! Stratum pool protocol session manager.
//!
//! Stratum is a line-delimited JSON-RPC style protocol spoken over a
//! long-lived TCP (optionally TLS) connection. The pool streams work
//! assignments to the client and the client submits proof candidates
//! back, interleaved with request/response traffic on the same socket.
//!
//! # Architecture
//!
//! The session is an active async task owning all connection state. The
//! public [`PoolClient`] handle forwards API calls into the task over a
//! command channel and hands completions back through oneshot channels,
//! so callers never touch session state directly. Protocol happenings
//! (new jobs, difficulty changes, share results, connectivity) flow out
//! as [`PoolEvent`]s on an mpsc channel owned by the orchestrator.
//!
//! A separate supervisor task watches for failure disconnects and
//! re-dials with capped exponential backoff; the [`ReplayGuard`] vetoes
//! duplicate submissions before they reach the wire.
//!
//! # Usage
//!
//! ```rust,ignore
//! use galena_miner::stratum::{PoolClient, PoolConfig, PoolEvent};
//!
//! let config = PoolConfig {
//!     url: "stratum+tcp://pool.example.com:3333".to_string(),
//!     ..PoolConfig::default()
//! };
//! let (client, mut events) = PoolClient::spawn(config);
//!
//! client.connect().await?;
//! client.authenticate("worker1", "x").await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         PoolEvent::NewJob(job) => { /* hand to the work processor */ }
//!         PoolEvent::DifficultyChanged(d) => { /* retarget */ }
//!         _ => {}
//!     }
//! }
//! ```

mod client;
mod connection;
mod error;
mod job;
mod messages;
mod reconnect;
mod replay;
mod session;

pub use client::PoolClient;
pub use connection::{Connection, Transport};
pub use error::{PoolError, PoolResult};
pub use job::Job;
pub use messages::{Envelope, PoolEvent, RpcError, Submission};
pub use reconnect::ReconnectPolicy;
pub use replay::{Fingerprint, ReplayGuard};
pub use session::{ConnectionState, PoolConfig, StatsSnapshot};
