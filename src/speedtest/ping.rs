use super::directory::ServerCandidate;
use crate::error::{Result, SpeedTestError};
use futures::future::join_all;
use reqwest::Client;
use std::time::Duration;
use tokio::time::Instant;

pub const ATTEMPTS: usize = 3;
/// Recorded for a server none of whose samples succeeded (3600 s).
pub const FAILED_PING_MS: f64 = 3_600_000.0;
pub const LATENCY_PAYLOAD_PREFIX: &str = "test=test";

const SUSPICIOUS_PING_MS: f64 = 10.0;
const SUSPICIOUS_DISTANCE_KM: f64 = 2.0;
const CLAMPED_PING_MS: f64 = 100.0;

/// Best of the successful samples, or [`FAILED_PING_MS`] when there were none.
pub fn best_ping(samples: &[Option<f64>]) -> f64 {
    samples
        .iter()
        .flatten()
        .copied()
        .fold(FAILED_PING_MS, f64::min)
}

/// A very small ping to a server that is practically on top of the client usually
/// means we measured ourselves; such a result is replaced with a moderate value.
pub fn guard_anomaly(best_ping_ms: f64, distance_km: f64) -> f64 {
    if best_ping_ms < SUSPICIOUS_PING_MS && distance_km < SUSPICIOUS_DISTANCE_KM {
        CLAMPED_PING_MS
    } else {
        best_ping_ms
    }
}

pub struct LatencyProber {
    client: Client,
    timeout: Duration,
}

impl LatencyProber {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Probes up to `sample_count` of the given servers (assumed nearest first) and
    /// returns them sorted by best ping.
    pub async fn probe(
        &self,
        servers: Vec<ServerCandidate>,
        sample_count: usize,
    ) -> Result<Vec<ServerCandidate>> {
        let shortlist: Vec<ServerCandidate> = servers.into_iter().take(sample_count).collect();
        if shortlist.is_empty() {
            return Err(SpeedTestError::NoUsableServer("no servers to probe".into()));
        }

        let mut probed =
            join_all(shortlist.into_iter().map(|server| self.probe_server(server))).await;

        if probed
            .iter()
            .all(|s| s.best_ping_ms.map_or(true, |p| p >= FAILED_PING_MS))
        {
            return Err(SpeedTestError::NoUsableServer(
                "all latency probes failed".into(),
            ));
        }

        probed.sort_by(|a, b| {
            let a = a.best_ping_ms.unwrap_or(FAILED_PING_MS);
            let b = b.best_ping_ms.unwrap_or(FAILED_PING_MS);
            a.total_cmp(&b)
        });
        Ok(probed)
    }

    async fn probe_server(&self, server: ServerCandidate) -> ServerCandidate {
        let url = match server.resource_url("latency.txt") {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(server = %server.id, error = %e, "Cannot probe server");
                return server.with_best_ping(FAILED_PING_MS);
            }
        };

        let mut samples = Vec::with_capacity(ATTEMPTS);
        for _ in 0..ATTEMPTS {
            match self.sample(url.as_str()).await {
                Ok(ms) => samples.push(Some(ms)),
                Err(e) => {
                    tracing::debug!(server = %server.id, error = %e, "Latency sample failed");
                    samples.push(None);
                }
            }
        }

        let best = guard_anomaly(best_ping(&samples), server.distance_km);
        tracing::debug!(server = %server.id, best_ping_ms = best, "Probed server");
        server.with_best_ping(best)
    }

    async fn sample(&self, url: &str) -> Result<f64> {
        let start = Instant::now();
        let fetch = async {
            let response = self.client.get(url).send().await?;
            response.text().await
        };

        let body = match tokio::time::timeout(self.timeout, fetch).await {
            Err(_) => return Err(SpeedTestError::ProbeTimeout { url: url.to_string() }),
            Ok(Err(e)) => {
                return Err(SpeedTestError::ProbeFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                })
            }
            Ok(Ok(body)) => body,
        };
        let elapsed = start.elapsed();

        if !body.starts_with(LATENCY_PAYLOAD_PREFIX) {
            return Err(SpeedTestError::ProbeFailed {
                url: url.to_string(),
                reason: "unexpected latency payload".into(),
            });
        }

        Ok(elapsed.as_secs_f64() * 1000.0)
    }
}
