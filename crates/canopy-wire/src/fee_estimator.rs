//! Fee estimates from several Electrum servers, reconciled into one.
//!
//! A single server can tell us anything it wants about fees. We ask a few distinct servers,
//! keep what each one said along with when it said it, and only answer once enough of them are
//! close to the median.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use canopy_chain::reach_fee_consensus;
use canopy_chain::FeeSample;
use futures::future::join_all;
use log::debug;

use crate::pool::ConnectionPool;
use crate::transport::PeerRequest;
use crate::transport::PeerResponse;
use crate::SyncConfig;
use crate::WireError;

pub struct FeeEstimator {
    config: SyncConfig,
    pool: Arc<ConnectionPool>,
    /// Samples we got for each confirmation target
    samples: spin::Mutex<HashMap<u16, Vec<FeeSample>>>,
}

impl FeeEstimator {
    pub fn new(config: SyncConfig, pool: Arc<ConnectionPool>) -> Self {
        FeeEstimator {
            config,
            pool,
            samples: spin::Mutex::new(HashMap::new()),
        }
    }

    /// Asks up to `fee_consensus` distinct servers for a fee estimate, returning how many
    /// answered
    pub async fn poll(&self, target: u16) -> Result<usize, WireError> {
        let request = PeerRequest::EstimateFee(target);
        let available = self
            .pool
            .established()
            .iter()
            .filter(|connection| connection.supports(&request))
            .count();
        if available == 0 {
            return Err(WireError::NoServers);
        }

        let connections = self
            .pool
            .pick_connections(available.min(self.config.fee_consensus), |connection| {
                connection.supports(&request)
            })?;

        let request = &request;
        let requests = connections.iter().map(|connection| async move {
            (connection.id(), connection.request(request.clone()).await)
        });
        let answers = join_all(requests).await;

        let now = Instant::now();
        let mut samples = self.samples.lock();
        let target_samples = samples.entry(target).or_default();
        let mut received = 0;

        for (peer, answer) in answers {
            match answer {
                Ok(PeerResponse::FeeRate(value)) => {
                    target_samples.push(FeeSample {
                        peer,
                        value,
                        received_at: now,
                    });
                    received += 1;
                }
                Ok(other) => debug!("unexpected answer to a fee estimate: {other:?}"),
                Err(e) => debug!("fee estimate from {peer} failed: {e}"),
            }
        }

        let max_age = self.config.fee_max_age;
        target_samples.retain(|sample| now.saturating_duration_since(sample.received_at) <= max_age);

        Ok(received)
    }

    /// Fee rate in sat/kvB that enough recent samples agree on, without asking anyone
    pub fn estimate(&self, target: u16) -> Result<u64, WireError> {
        let samples = self.samples.lock();
        let samples = samples.get(&target).map(Vec::as_slice).unwrap_or_default();

        Ok(reach_fee_consensus(
            samples,
            Instant::now(),
            self.config.fee_max_age,
            self.config.fee_distance_pct,
            self.config.fee_consensus,
        )?)
    }

    /// Like [FeeEstimator::estimate], but polls servers first if what we have isn't enough
    pub async fn estimate_fee(&self, target: u16) -> Result<u64, WireError> {
        if let Ok(fee) = self.estimate(target) {
            return Ok(fee);
        }

        self.poll(target).await?;
        self.estimate(target)
    }
}
