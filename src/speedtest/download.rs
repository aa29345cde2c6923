use super::directory::ServerCandidate;
use super::progress::Reporter;
use super::throughput::{measure, Direction, Throughput};
use super::TestPhase;
use crate::error::{Result, SpeedTestError};
use futures::StreamExt;
use reqwest::{Client, Url};
use std::time::Duration;

/// Edge length in pixels of the test images, smallest first.
pub const IMAGE_SIZES: [u32; 10] = [350, 500, 750, 1000, 1500, 2000, 2500, 3000, 3500, 4000];
pub const REPEATS: usize = 4;

pub fn work_items(server: &ServerCandidate) -> Result<Vec<Url>> {
    let mut urls = Vec::with_capacity(IMAGE_SIZES.len() * REPEATS);
    for size in IMAGE_SIZES {
        let url = server.resource_url(&format!("random{size}x{size}.jpg"))?;
        urls.extend(std::iter::repeat(url).take(REPEATS));
    }
    Ok(urls)
}

fn transfer_error(reason: impl ToString) -> SpeedTestError {
    SpeedTestError::Transfer {
        phase: TestPhase::Download,
        reason: reason.to_string(),
    }
}

/// Fetches `url`, discarding the body, and returns how many bytes arrived.
pub async fn fetch(client: Client, url: Url) -> Result<u64> {
    let response = client.get(url.clone()).send().await.map_err(transfer_error)?;
    if !response.status().is_success() {
        return Err(transfer_error(format!("{url}: HTTP {}", response.status())));
    }

    let mut stream = response.bytes_stream();
    let mut downloaded: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(transfer_error)?;
        downloaded += chunk.len() as u64;
    }

    Ok(downloaded)
}

pub struct DownloadTest {
    client: Client,
    max_time: Duration,
}

impl DownloadTest {
    pub fn new(client: Client, max_time: Duration) -> Self {
        Self { client, max_time }
    }

    pub async fn run(
        &self,
        server: &ServerCandidate,
        reporter: &mut Reporter,
    ) -> Result<Throughput> {
        let items = work_items(server)?;
        tracing::info!(server = %server.host, items = items.len(), "Starting download");

        measure(Direction::Download, items, self.max_time, reporter, |url| {
            fetch(self.client.clone(), url)
        })
        .await
    }
}
