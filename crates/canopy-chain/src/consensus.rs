//! Stateless checks we apply to data coming from untrusted peers.
//!
//! There are two kinds of checks here. Proof-of-work is checked for every single header we see
//! and it's the one thing that makes a header worth anything. For data that can't be checked on
//! its own (fee estimates, RPC replies), we ask several peers the same question and only trust
//! an answer that enough of them agree on.

use std::collections::HashMap;
use std::collections::HashSet;
use std::hash::Hash;
use std::time::Duration;
use std::time::Instant;

use bitcoin::hashes::Hash as _;
use bitcoin::BlockHash;
use bitcoin::CompactTarget;
use bitcoin::Target;

use crate::chainparams::ChainParams;
use crate::error::ChainError;
use crate::header::hash_header_bytes;
use crate::header::HEADER_SIZE;

/// Reads the compact target (nBits) stored at bytes [72:76] of a raw header
pub fn header_target(header_bytes: &[u8]) -> Result<Target, ChainError> {
    if header_bytes.len() != HEADER_SIZE {
        return Err(ChainError::MalformedHeader(header_bytes.len()));
    }

    let mut bits = [0_u8; 4];
    bits.copy_from_slice(&header_bytes[72..76]);
    let compact = CompactTarget::from_consensus(u32::from_le_bytes(bits));

    Ok(Target::from_compact(compact))
}

/// Checks that `block_hash`, read as a 256-bit number, is below the target committed to by the
/// header itself.
///
/// This doesn't check whether that target is the right one for this height, only that the
/// header did the work it claims to have done.
pub fn verify_proof_of_work(header_bytes: &[u8], block_hash: &BlockHash) -> Result<(), ChainError> {
    let target = header_target(header_bytes)?;
    let hash = Target::from_le_bytes(block_hash.to_byte_array());

    if hash < target {
        return Ok(());
    }

    Err(ChainError::InvalidPow(*block_hash))
}

/// Full check for a raw header from the network: recomputes the hash from the bytes, checks the
/// work and that the target isn't easier than the network's limit. Returns the hash.
pub fn verify_header(header_bytes: &[u8], params: &ChainParams) -> Result<BlockHash, ChainError> {
    let block_hash = hash_header_bytes(header_bytes);
    verify_proof_of_work(header_bytes, &block_hash)?;

    if header_target(header_bytes)? > params.max_target {
        return Err(ChainError::PowLimitExceeded(block_hash));
    }

    Ok(block_hash)
}

/// Picks the most common value among `responses`, if its share of all responses is at least
/// `agreement`.
///
/// A tie for first place never reaches consensus, no matter how low `agreement` is.
pub fn reach_quorum<T: Clone + Eq + Hash>(responses: &[T], agreement: f64) -> Result<T, ChainError> {
    if !(agreement > 0.0 && agreement <= 1.0) {
        return Err(ChainError::InvalidAgreement(agreement));
    }

    let mut counts: HashMap<&T, usize> = HashMap::new();
    for response in responses {
        *counts.entry(response).or_default() += 1;
    }

    let mut ranked = counts.into_iter().collect::<Vec<_>>();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));

    let (winner, votes) = match ranked.first() {
        Some(first) => *first,
        None => return Err(ChainError::ConsensusNotReached),
    };

    if ranked.get(1).is_some_and(|(_, runner_up)| *runner_up == votes) {
        return Err(ChainError::ConsensusNotReached);
    }

    if (votes as f64) / (responses.len() as f64) < agreement {
        return Err(ChainError::ConsensusNotReached);
    }

    Ok(winner.clone())
}

/// A fee estimate reported by one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSample {
    /// Who told us this. Only the newest sample of each peer is used.
    pub peer: u32,
    /// Fee rate in satoshis per kilo-vbyte
    pub value: u64,
    pub received_at: Instant,
}

/// Agrees on a fee rate from noisy, independent samples.
///
/// Samples older than `max_age` are dropped and only the newest one of each peer is kept. The
/// remaining values are compared against their median, and the ones within `distance_pct`
/// percent of it are considered in agreement. If at least `consensus` peers agree, the median
/// of the agreeing values is returned.
pub fn reach_fee_consensus(
    samples: &[FeeSample],
    now: Instant,
    max_age: Duration,
    distance_pct: u64,
    consensus: usize,
) -> Result<u64, ChainError> {
    let mut newest: HashMap<u32, FeeSample> = HashMap::new();
    for sample in samples {
        let age = now.saturating_duration_since(sample.received_at);
        if age > max_age {
            continue;
        }

        let entry = newest.entry(sample.peer).or_insert(*sample);
        if entry.received_at < sample.received_at {
            *entry = *sample;
        }
    }

    if newest.len() < consensus.max(1) {
        return Err(ChainError::ConsensusNotReached);
    }

    let mut values = newest.values().map(|sample| sample.value).collect::<Vec<_>>();
    let center = median(&mut values);
    let tolerance = center.saturating_mul(distance_pct) / 100;

    let agreeing = newest
        .values()
        .filter(|sample| sample.value.abs_diff(center) <= tolerance)
        .collect::<Vec<_>>();

    let peers = agreeing
        .iter()
        .map(|sample| sample.peer)
        .collect::<HashSet<_>>();

    if peers.len() < consensus.max(1) {
        return Err(ChainError::ConsensusNotReached);
    }

    let mut agreeing = agreeing
        .into_iter()
        .map(|sample| sample.value)
        .collect::<Vec<_>>();

    Ok(median(&mut agreeing))
}

fn median(values: &mut [u64]) -> u64 {
    values.sort_unstable();
    let mid = values.len() / 2;
    match values.len() {
        0 => 0,
        len if len % 2 == 0 => {
            let (low, high) = (values[mid - 1], values[mid]);
            low / 2 + high / 2 + (low % 2 + high % 2) / 2
        }
        _ => values[mid],
    }
}
