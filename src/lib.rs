//! galena-miner: a Stratum pool client and mining daemon.
//!
//! The heart of the crate is [`stratum`], a session manager for the
//! line-delimited JSON-RPC protocol mining pools speak: it owns the
//! TCP/TLS connection, correlates requests with responses, dispatches
//! work notifications, reconnects with capped backoff after failures,
//! and refuses to submit the same share twice.
//!
//! Proof-of-work search itself is out of scope: the daemon hands job
//! headers to a [`compute::WorkProcessor`], an opaque collaborator that
//! real GPU/ASIC backends implement outside this crate.

pub mod compute;
pub mod daemon;
pub mod stratum;
pub mod tracing;
