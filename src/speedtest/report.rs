use super::directory::{ClientConfig, ServerCandidate};
use super::distance::km_to_miles;
use super::throughput::Throughput;
use crate::error::{Result, SpeedTestError};
use reqwest::header::REFERER;
use reqwest::Client;
use serde::Serialize;

const HASH_SALT: &str = "297aae72";
const FLASH_REFERER: &str = "http://c.speedtest.net/flash/speedtest.swf";
const RESULT_URL_BASE: &str = "http://www.speedtest.net/result/";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Speeds {
    /// Corrected download speed in Mbps.
    pub download: f64,
    /// Corrected upload speed in Mbps.
    pub upload: f64,
    /// Measured download rate in bytes per second, before correction.
    pub original_download: f64,
    /// Measured upload rate in bytes per second, before correction.
    pub original_upload: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerInfo {
    pub id: String,
    pub host: String,
    pub lat: f64,
    pub lon: f64,
    pub location: String,
    pub country: String,
    pub cc: String,
    pub sponsor: String,
    pub distance: f64,
    pub distance_mi: f64,
    /// Best ping in milliseconds; unset when probing was skipped.
    pub ping: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeedTestData {
    pub speeds: Speeds,
    pub client: ClientConfig,
    pub server: ServerInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

pub fn aggregate(
    client: &ClientConfig,
    server: &ServerCandidate,
    download: &Throughput,
    upload: &Throughput,
) -> SpeedTestData {
    SpeedTestData {
        speeds: Speeds {
            download: download.mbps(),
            upload: upload.mbps(),
            original_download: download.raw_bytes_per_sec,
            original_upload: upload.raw_bytes_per_sec,
        },
        client: client.clone(),
        server: ServerInfo {
            id: server.id.clone(),
            host: server.host.clone(),
            lat: server.lat,
            lon: server.lon,
            location: server.name.clone(),
            country: server.country.clone(),
            cc: server.cc.clone(),
            sponsor: server.sponsor.clone(),
            distance: round_to(server.distance_km, 2),
            distance_mi: round_to(km_to_miles(server.distance_km), 2),
            ping: server.best_ping_ms.map(|p| round_to(p, 1)),
        },
        result_url: None,
    }
}

/// Figures posted to the result service: ping in whole milliseconds, speeds in
/// thousandths of a Mbps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub ping: u64,
    pub upload: u64,
    pub download: u64,
}

impl Submission {
    pub fn from_data(data: &SpeedTestData) -> Self {
        Self {
            ping: data.server.ping.unwrap_or(0.0).round() as u64,
            upload: (data.speeds.upload * 1000.0).round() as u64,
            download: (data.speeds.download * 1000.0).round() as u64,
        }
    }

    pub fn hash(&self) -> String {
        let token = format!("{}-{}-{}-{}", self.ping, self.upload, self.download, HASH_SALT);
        format!("{:x}", md5::compute(token))
    }
}

/// Extracts the id from a `resultid=<digits>` response.
pub fn parse_result_id(body: &str) -> Option<&str> {
    let start = body.find("resultid=")? + "resultid=".len();
    let rest = &body[start..];
    let end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    let id = &rest[..end];
    (!id.is_empty()).then_some(id)
}

pub fn result_url(id: &str) -> String {
    format!("{RESULT_URL_BASE}{id}.png")
}

/// Posts the measured figures and returns the public result URL.
pub async fn submit(client: &Client, report_url: &str, data: &SpeedTestData) -> Result<String> {
    let submission = Submission::from_data(data);
    let server_id = data.server.id.as_str();
    let form = [
        ("download", submission.download.to_string()),
        ("ping", submission.ping.to_string()),
        ("upload", submission.upload.to_string()),
        ("promo", String::new()),
        ("startmode", "pingselect".to_string()),
        ("recommendedserverid", server_id.to_string()),
        ("accuracy", "1".to_string()),
        ("serverid", server_id.to_string()),
        ("hash", submission.hash()),
    ];

    let response = client
        .post(report_url)
        .header(REFERER, FLASH_REFERER)
        .form(&form)
        .send()
        .await
        .map_err(|e| SpeedTestError::ResultSubmission(e.to_string()))?;

    if !response.status().is_success() {
        return Err(SpeedTestError::ResultSubmission(format!("HTTP {}", response.status())));
    }

    let body = response
        .text()
        .await
        .map_err(|e| SpeedTestError::ResultSubmission(e.to_string()))?;

    parse_result_id(&body)
        .map(result_url)
        .ok_or_else(|| SpeedTestError::ResultSubmission(format!("unexpected response: {body}")))
}
