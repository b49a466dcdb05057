//! Work processor seam.
//!
//! The session manager treats proof-of-work search as an opaque
//! collaborator: it hands over a header template and a nonce range and
//! gets back whatever candidates the backend found. GPU and ASIC
//! implementations live outside this crate; [`IdleProcessor`] stands in
//! where no hardware is wired up.

use async_trait::async_trait;

/// A (nonce, hash) pair the processor believes meets the target.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Nonce that produced the result
    pub nonce: u32,

    /// Resulting hash
    pub result: [u8; 32],
}

/// Opaque proof-of-work search backend.
#[async_trait]
pub trait WorkProcessor: Send + Sync {
    /// Search `count` nonces starting at `nonce_start` against the
    /// 76-byte header template. Returns the candidates found, possibly
    /// none.
    async fn search(&self, header: &[u8; 76], nonce_start: u32, count: u32) -> Vec<Candidate>;

    /// Backend identifier for logging.
    fn name(&self) -> &str;
}

/// Placeholder backend that never finds anything.
pub struct IdleProcessor;

#[async_trait]
impl WorkProcessor for IdleProcessor {
    async fn search(&self, _header: &[u8; 76], _nonce_start: u32, _count: u32) -> Vec<Candidate> {
        Vec::new()
    }

    fn name(&self) -> &str {
        "idle"
    }
}
