use crate::error::{Result, SpeedTestError};
use std::net::IpAddr;
use std::time::Duration;

pub const CONFIG_URLS: &[&str] = &[
    "http://www.speedtest.net/speedtest-config.php",
    "https://www.speedtest.net/speedtest-config.php",
];

pub const SERVER_LIST_URLS: &[&str] = &[
    "http://www.speedtest.net/speedtest-servers-static.php",
    "http://c.speedtest.net/speedtest-servers-static.php",
    "http://www.speedtest.net/speedtest-servers.php",
    "http://c.speedtest.net/speedtest-servers.php",
    "https://www.speedtest.net/speedtest-servers-static.php",
    "https://c.speedtest.net/speedtest-servers-static.php",
    "https://www.speedtest.net/speedtest-servers.php",
    "https://c.speedtest.net/speedtest-servers.php",
];

pub const REPORT_URL: &str = "http://www.speedtest.net/api/api.php";

#[derive(Debug, Clone)]
pub struct Settings {
    /// Time budget for each of the download and upload phases.
    pub max_time: Duration,
    /// How many of the nearest servers to probe. `None` picks 5, or 1 with a server id.
    pub ping_count: Option<usize>,
    /// How many of the fastest-responding servers to publish as best servers.
    pub max_servers: usize,
    pub server_id: Option<String>,
    /// Upload endpoint of a server to test against directly, skipping discovery of the
    /// server list and latency probing.
    pub server_url: Option<String>,
    pub proxy: Option<String>,
    /// Local address to send from, selecting the network interface under test.
    pub source_ip: Option<IpAddr>,
    pub probe_timeout: Duration,
    pub connect_timeout: Duration,
    pub config_urls: Vec<String>,
    pub server_list_urls: Vec<String>,
    pub submit_results: bool,
    pub report_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_time: Duration::from_secs(10),
            ping_count: None,
            max_servers: 1,
            server_id: None,
            server_url: None,
            proxy: None,
            source_ip: None,
            probe_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            config_urls: CONFIG_URLS.iter().map(|s| s.to_string()).collect(),
            server_list_urls: SERVER_LIST_URLS.iter().map(|s| s.to_string()).collect(),
            submit_results: false,
            report_url: REPORT_URL.to_string(),
        }
    }
}

impl Settings {
    pub fn ping_count(&self) -> usize {
        match (self.ping_count, &self.server_id) {
            (Some(count), _) => count,
            (None, Some(_)) => 1,
            (None, None) => 5,
        }
    }

    pub fn http_client(&self) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .local_address(self.source_ip)
            .user_agent(concat!("speednet/", env!("CARGO_PKG_VERSION")));

        // Proxy comes from settings only, never from the process environment.
        builder = match &self.proxy {
            Some(proxy) => {
                let proxy = reqwest::Proxy::all(proxy).map_err(SpeedTestError::Client)?;
                builder.proxy(proxy)
            }
            None => builder.no_proxy(),
        };

        builder.build().map_err(SpeedTestError::Client)
    }
}
