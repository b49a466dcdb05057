//! Work assignments and compact-target difficulty.

use bitcoin::block::Version;
use bitcoin::CompactTarget;
use serde_json::Value;

/// One unit of work from the pool.
///
/// Created from a `mining.notify` notification and never mutated: the
/// next notification (or a `mining.set_extranonce` update) supersedes it
/// with a fresh value. Hash fields are kept in wire byte order as the
/// pool sent them.
#[derive(Debug, Clone)]
pub struct Job {
    /// Pool-assigned job identifier
    pub id: String,

    /// Previous block hash, wire order
    pub prev_hash: [u8; 32],

    /// Coinbase prefix (before the extranonces)
    pub coinbase1: Vec<u8>,

    /// Coinbase suffix (after the extranonces)
    pub coinbase2: Vec<u8>,

    /// Merkle branch hashes, wire order, pool-given sequence
    pub merkle_branches: Vec<[u8; 32]>,

    /// Block version
    pub version: Version,

    /// Encoded difficulty target (compact "bits")
    pub bits: CompactTarget,

    /// Block timestamp (epoch seconds)
    pub ntime: u32,

    /// If true, abandon work on all previous jobs immediately
    pub clean_jobs: bool,

    /// Pool-assigned extranonce1 in effect for this job
    pub extranonce1: Vec<u8>,

    /// Extranonce2 width in bytes
    pub extranonce2_size: usize,
}

impl Job {
    /// Parse from `mining.notify` positional params.
    ///
    /// Layout: [job_id, prev_hash, coinbase1, coinbase2, merkle_branches,
    /// version, bits, ntime, clean_jobs, ...extras ignored]. Merkle
    /// branches arrive as an array of hex strings from most pools, but a
    /// few concatenate them into a single hex string; both are accepted.
    pub fn from_notify_params(
        params: &[Value],
        extranonce1: &[u8],
        extranonce2_size: usize,
    ) -> Result<Self, String> {
        if params.len() < 9 {
            return Err(format!("mining.notify params too short: {}", params.len()));
        }

        let id = params[0].as_str().ok_or("job_id not a string")?.to_string();

        let prev_hash_str = params[1].as_str().ok_or("prev_hash not a string")?;
        let prev_hash = parse_hash32(prev_hash_str).map_err(|e| format!("prev_hash: {e}"))?;

        let coinbase1_str = params[2].as_str().ok_or("coinbase1 not a string")?;
        let coinbase1 = hex::decode(coinbase1_str).map_err(|e| format!("coinbase1 hex: {e}"))?;

        let coinbase2_str = params[3].as_str().ok_or("coinbase2 not a string")?;
        let coinbase2 = hex::decode(coinbase2_str).map_err(|e| format!("coinbase2 hex: {e}"))?;

        let merkle_branches = parse_merkle_branches(&params[4])?;

        let version_str = params[5].as_str().ok_or("version not a string")?;
        let version_u32 =
            u32::from_str_radix(version_str, 16).map_err(|e| format!("version hex: {e}"))?;
        let version = Version::from_consensus(version_u32 as i32);

        let bits_str = params[6].as_str().ok_or("bits not a string")?;
        let bits_u32 = u32::from_str_radix(bits_str, 16).map_err(|e| format!("bits hex: {e}"))?;
        let bits = CompactTarget::from_consensus(bits_u32);

        let ntime_str = params[7].as_str().ok_or("ntime not a string")?;
        let ntime = u32::from_str_radix(ntime_str, 16).map_err(|e| format!("ntime hex: {e}"))?;

        let clean_jobs = params[8].as_bool().ok_or("clean_jobs not a bool")?;

        Ok(Self {
            id,
            prev_hash,
            coinbase1,
            coinbase2,
            merkle_branches,
            version,
            bits,
            ntime,
            clean_jobs,
            extranonce1: extranonce1.to_vec(),
            extranonce2_size,
        })
    }

    /// Superseding copy with new extranonce parameters.
    pub fn with_extranonce(&self, extranonce1: Vec<u8>, extranonce2_size: usize) -> Self {
        Self {
            extranonce1,
            extranonce2_size,
            ..self.clone()
        }
    }

    /// Share difficulty encoded by this job's compact target.
    pub fn difficulty(&self) -> f64 {
        difficulty_from_bits(self.bits)
    }

    /// 76-byte header prefix for the work processor.
    ///
    /// version, prev_hash, a zeroed 32-byte merkle root placeholder,
    /// ntime, and bits, each byte-reversed from its big-endian wire form
    /// to little-endian. The processor fills in the merkle root for the
    /// extranonce2 it rolls and appends the nonce at bytes 76..80.
    pub fn header_template(&self) -> [u8; 76] {
        let mut header = [0u8; 76];

        header[0..4].copy_from_slice(&(self.version.to_consensus() as u32).to_le_bytes());

        let mut prev = self.prev_hash;
        prev.reverse();
        header[4..36].copy_from_slice(&prev);

        // 36..68 stays zero: merkle root placeholder

        header[68..72].copy_from_slice(&self.ntime.to_le_bytes());
        header[72..76].copy_from_slice(&self.bits.to_consensus().to_le_bytes());

        header
    }
}

/// Difficulty encoded by a compact target.
///
/// The compact form packs an 8-bit exponent and 24-bit coefficient.
/// target = coefficient / 256^(3 - exponent) for exponent <= 3, else
/// coefficient * 256^(exponent - 3). Difficulty is the ratio of the
/// difficulty-1 target (bits 0x1d00ffff) to this target. A zero target
/// yields difficulty 0 rather than an error.
pub fn difficulty_from_bits(bits: CompactTarget) -> f64 {
    let raw = bits.to_consensus();
    let exponent = (raw >> 24) as i32;
    let coefficient = (raw & 0x00ff_ffff) as f64;

    let target = if exponent <= 3 {
        coefficient / 256f64.powi(3 - exponent)
    } else {
        coefficient * 256f64.powi(exponent - 3)
    };

    if target == 0.0 {
        return 0.0;
    }

    max_target() / target
}

/// Difficulty-1 target: coefficient 0xffff at exponent 0x1d.
fn max_target() -> f64 {
    0xffff as f64 * 256f64.powi(0x1d - 3)
}

fn parse_hash32(hex_str: &str) -> Result<[u8; 32], String> {
    let bytes = hex::decode(hex_str).map_err(|e| format!("bad hex: {e}"))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|b: Vec<u8>| format!("wrong length: {}", b.len()))?;
    Ok(arr)
}

fn parse_merkle_branches(value: &Value) -> Result<Vec<[u8; 32]>, String> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| {
                let s = item.as_str().ok_or("merkle branch not a string")?;
                parse_hash32(s).map_err(|e| format!("merkle branch: {e}"))
            })
            .collect(),
        Value::String(s) => {
            // Concatenated form: consecutive 64-hex-char nodes.
            if s.is_empty() {
                return Ok(Vec::new());
            }
            if s.len() % 64 != 0 {
                return Err(format!("merkle branch string length {} not 64-aligned", s.len()));
            }
            s.as_bytes()
                .chunks(64)
                .map(|chunk| {
                    let chunk_str =
                        std::str::from_utf8(chunk).map_err(|_| "merkle branch not utf-8")?;
                    parse_hash32(chunk_str).map_err(|e| format!("merkle branch: {e}"))
                })
                .collect()
        }
        _ => Err("merkle_branches neither array nor string".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn notify_params() -> Vec<Value> {
        json!([
            "job1",
            "00000000000000000001529600000000000000000000000000000000000000aa",
            "01000000",
            "ffffffff",
            [],
            "20000000",
            "1d00ffff",
            "5f000000",
            true
        ])
        .as_array()
        .unwrap()
        .clone()
    }

    #[test]
    fn parses_minimal_notify() {
        let job = Job::from_notify_params(&notify_params(), &[0xab, 0xcd], 4).unwrap();

        assert_eq!(job.id, "job1");
        assert_eq!(job.coinbase1, vec![0x01, 0x00, 0x00, 0x00]);
        assert_eq!(job.coinbase2, vec![0xff; 4]);
        assert!(job.merkle_branches.is_empty());
        assert_eq!(job.version.to_consensus(), 0x20000000);
        assert_eq!(job.bits.to_consensus(), 0x1d00ffff);
        assert_eq!(job.ntime, 0x5f000000);
        assert!(job.clean_jobs);
        assert_eq!(job.extranonce1, vec![0xab, 0xcd]);
        assert_eq!(job.extranonce2_size, 4);
    }

    #[test]
    fn ignores_extra_trailing_params() {
        let mut params = notify_params();
        params.push(json!("future-field"));
        params.push(json!(42));
        assert!(Job::from_notify_params(&params, &[], 4).is_ok());
    }

    #[test]
    fn rejects_short_params() {
        let params = json!(["job1", "aa"]).as_array().unwrap().clone();
        assert!(Job::from_notify_params(&params, &[], 4).is_err());
    }

    #[test]
    fn merkle_branches_as_array() {
        let mut params = notify_params();
        params[4] = json!([
            "aa".repeat(32),
            "bb".repeat(32),
        ]);
        let job = Job::from_notify_params(&params, &[], 4).unwrap();
        assert_eq!(job.merkle_branches.len(), 2);
        assert_eq!(job.merkle_branches[0], [0xaa; 32]);
        assert_eq!(job.merkle_branches[1], [0xbb; 32]);
    }

    #[test]
    fn merkle_branches_as_concatenated_string() {
        let mut params = notify_params();
        params[4] = json!(format!("{}{}", "cc".repeat(32), "dd".repeat(32)));
        let job = Job::from_notify_params(&params, &[], 4).unwrap();
        assert_eq!(job.merkle_branches.len(), 2);
        assert_eq!(job.merkle_branches[0], [0xcc; 32]);
        assert_eq!(job.merkle_branches[1], [0xdd; 32]);
    }

    #[test]
    fn merkle_branch_bad_length_rejected() {
        let mut params = notify_params();
        params[4] = json!("abcdef");
        assert!(Job::from_notify_params(&params, &[], 4).is_err());
    }

    #[test]
    fn difficulty_one_at_reference_bits() {
        let d = difficulty_from_bits(CompactTarget::from_consensus(0x1d00ffff));
        assert!((d - 1.0).abs() < 1e-9, "difficulty was {d}");
    }

    #[test]
    fn difficulty_known_mainnet_value() {
        // Bits 0x1b0404cb corresponds to difficulty ~16307.42.
        let d = difficulty_from_bits(CompactTarget::from_consensus(0x1b0404cb));
        assert!((d - 16307.420938).abs() / 16307.420938 < 1e-6, "difficulty was {d}");
    }

    #[test]
    fn difficulty_zero_coefficient_is_zero() {
        assert_eq!(difficulty_from_bits(CompactTarget::from_consensus(0x1d000000)), 0.0);
        assert_eq!(difficulty_from_bits(CompactTarget::from_consensus(0x03000000)), 0.0);
    }

    #[test]
    fn difficulty_positive_for_small_exponent() {
        // Exponent <= 3 with a nonzero coefficient divides the
        // coefficient down but stays strictly positive.
        let d = difficulty_from_bits(CompactTarget::from_consensus(0x03000001));
        assert!(d > 0.0);
        let d = difficulty_from_bits(CompactTarget::from_consensus(0x0000ffff));
        assert!(d > 0.0);
    }

    #[test]
    fn header_template_layout() {
        let job = Job::from_notify_params(&notify_params(), &[], 4).unwrap();
        let header = job.header_template();

        // Version 0x20000000 little-endian.
        assert_eq!(&header[0..4], &[0x00, 0x00, 0x00, 0x20]);

        // Previous hash reversed from wire order: wire ends in 0xaa, so
        // the header starts with it.
        assert_eq!(header[4], 0xaa);
        assert_eq!(header[35], 0x00);

        // Merkle placeholder untouched.
        assert_eq!(&header[36..68], &[0u8; 32]);

        // ntime 0x5f000000 little-endian.
        assert_eq!(&header[68..72], &[0x00, 0x00, 0x00, 0x5f]);

        // bits 0x1d00ffff little-endian.
        assert_eq!(&header[72..76], &[0xff, 0xff, 0x00, 0x1d]);
    }

    #[test]
    fn with_extranonce_supersedes_without_mutating() {
        let job = Job::from_notify_params(&notify_params(), &[0x01], 4).unwrap();
        let superseded = job.with_extranonce(vec![0x02, 0x03], 8);

        assert_eq!(job.extranonce1, vec![0x01]);
        assert_eq!(job.extranonce2_size, 4);
        assert_eq!(superseded.extranonce1, vec![0x02, 0x03]);
        assert_eq!(superseded.extranonce2_size, 8);
        assert_eq!(superseded.id, job.id);
    }
}
