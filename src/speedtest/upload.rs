use super::directory::ServerCandidate;
use super::progress::Reporter;
use super::throughput::{measure, Direction, Throughput};
use super::TestPhase;
use crate::error::{Result, SpeedTestError};
use bytes::Bytes;
use rand::{RngCore, SeedableRng};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::time::Duration;

const MIB: f64 = 1024.0 * 1024.0;
/// Upload sizes in MiB, smallest first.
pub const SIZES_MIB: [f64; 8] = [0.25, 0.5, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0];
pub const REPEATS: usize = 25;
const FORM_PREFIX: &[u8] = b"content1=";
const FILLER: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

pub fn work_items() -> Vec<usize> {
    SIZES_MIB
        .iter()
        .flat_map(|mib| std::iter::repeat((mib * MIB).round() as usize).take(REPEATS))
        .collect()
}

fn transfer_error(reason: impl ToString) -> SpeedTestError {
    SpeedTestError::Transfer {
        phase: TestPhase::Upload,
        reason: reason.to_string(),
    }
}

/// Form body of `len` bytes: the `content1=` field name followed by filler.
fn form_payload(len: usize) -> Bytes {
    let mut rng = rand::rngs::StdRng::from_entropy();
    let mut filler = vec![0u8; len.saturating_sub(FORM_PREFIX.len())];
    rng.fill_bytes(&mut filler);
    for byte in filler.iter_mut() {
        *byte = FILLER[*byte as usize % FILLER.len()];
    }

    let mut data = Vec::with_capacity(FORM_PREFIX.len() + filler.len());
    data.extend_from_slice(FORM_PREFIX);
    data.extend_from_slice(&filler);
    Bytes::from(data)
}

/// Posts `body` and returns its length once the server has answered.
pub async fn send(client: Client, url: String, body: Bytes) -> Result<u64> {
    let len = body.len() as u64;
    let response = client
        .post(&url)
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(body)
        .send()
        .await
        .map_err(transfer_error)?;

    if !response.status().is_success() {
        return Err(transfer_error(format!("{url}: HTTP {}", response.status())));
    }
    response.bytes().await.map_err(transfer_error)?;

    Ok(len)
}

pub struct UploadTest {
    client: Client,
    max_time: Duration,
    data: Bytes,
}

impl UploadTest {
    /// Builds the largest payload once; every item sends a prefix of it.
    pub fn new(client: Client, max_time: Duration) -> Self {
        let largest = work_items().into_iter().max().unwrap_or_default();
        Self {
            client,
            max_time,
            data: form_payload(largest),
        }
    }

    pub async fn run(
        &self,
        server: &ServerCandidate,
        reporter: &mut Reporter,
    ) -> Result<Throughput> {
        self.run_items(server, work_items(), reporter).await
    }

    pub async fn run_items(
        &self,
        server: &ServerCandidate,
        sizes: Vec<usize>,
        reporter: &mut Reporter,
    ) -> Result<Throughput> {
        tracing::info!(server = %server.host, items = sizes.len(), "Starting upload");

        measure(Direction::Upload, sizes, self.max_time, reporter, |size| {
            let body = self.data.slice(..size.clamp(FORM_PREFIX.len(), self.data.len()));
            send(self.client.clone(), server.url.clone(), body)
        })
        .await
    }
}
