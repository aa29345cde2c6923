use anyhow::{Context, Result};
use clap::Parser;
use speednet::{run_speed_test, Settings, SpeedTestData, TestUpdate};
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "speednet",
    about = "Measure latency and throughput against the nearest speed test server",
    version
)]
struct Cli {
    /// Time budget per transfer phase, in seconds
    #[arg(long, default_value_t = 10.0)]
    max_time: f64,

    /// Number of nearest servers to probe for latency
    #[arg(long)]
    ping_count: Option<usize>,

    /// Number of best servers to report
    #[arg(long, default_value_t = 1)]
    max_servers: usize,

    /// Test against the listed server with this id
    #[arg(long)]
    server_id: Option<String>,

    /// Test against this upload endpoint directly, skipping server selection
    #[arg(long)]
    server_url: Option<String>,

    /// HTTP proxy for every request
    #[arg(long, env = "HTTPS_PROXY")]
    proxy: Option<String>,

    /// Send from this local address to test a specific network interface
    #[arg(long)]
    source_ip: Option<IpAddr>,

    /// Submit the result and print its public URL
    #[arg(long)]
    share: bool,

    /// Print the final result as JSON
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn settings(&self) -> Result<Settings> {
        let max_time = Duration::try_from_secs_f64(self.max_time).context("invalid --max-time")?;
        Ok(Settings {
            max_time,
            ping_count: self.ping_count,
            max_servers: self.max_servers,
            server_id: self.server_id.clone(),
            server_url: self.server_url.clone(),
            proxy: self.proxy.clone(),
            source_ip: self.source_ip,
            submit_results: self.share,
            ..Settings::default()
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = cli.settings()?;

    let (tx, mut rx) = mpsc::channel(32);
    let cancel = CancellationToken::new();

    let test = tokio::spawn(run_speed_test(tx, cancel.clone(), settings));

    loop {
        tokio::select! {
            update = rx.recv() => match update {
                Some(update) => handle_update(update),
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                tracing::warn!("Interrupted, finishing in-flight transfers");
                cancel.cancel();
            }
        }
    }

    let data = test.await??;
    print_result(&data, cli.json)
}

fn handle_update(update: TestUpdate) {
    match update {
        TestUpdate::Config(config) => {
            tracing::info!(ip = %config.ip, isp = %config.isp, "Client")
        }
        TestUpdate::Servers(servers) => tracing::debug!(count = servers.len(), "Servers"),
        TestUpdate::BestServers(servers) => {
            for server in servers {
                tracing::debug!(
                    id = %server.id,
                    sponsor = %server.sponsor,
                    ping_ms = ?server.best_ping_ms,
                    "Best server"
                );
            }
        }
        TestUpdate::TestServer(server) => tracing::info!(
            host = %server.host,
            sponsor = %server.sponsor,
            name = %server.name,
            "Testing against"
        ),
        TestUpdate::PingProgress(p)
        | TestUpdate::DownloadProgress(p)
        | TestUpdate::UploadProgress(p) => {
            tracing::debug!(phase = %p.phase, percent = p.percent, overall = p.overall, "Progress")
        }
        TestUpdate::DownloadSpeedProgress(mbps) => tracing::trace!(mbps, "Download"),
        TestUpdate::UploadSpeedProgress(mbps) => tracing::trace!(mbps, "Upload"),
        TestUpdate::DownloadSpeed(mbps) => tracing::info!(mbps, "Download speed"),
        TestUpdate::UploadSpeed(mbps) => tracing::info!(mbps, "Upload speed"),
        TestUpdate::Data(_) => {}
        TestUpdate::Result(url) => tracing::info!(%url, "Result"),
        TestUpdate::Done(overall) => tracing::debug!(overall, "Done"),
        TestUpdate::Error(message) => tracing::error!(%message, "Speed test failed"),
    }
}

fn print_result(data: &SpeedTestData, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(data)?);
        return Ok(());
    }

    let ping = data
        .server
        .ping
        .map(|p| format!("{p:.1} ms"))
        .unwrap_or_else(|| "n/a".to_string());
    println!(
        "Server:   {} ({}, {})",
        data.server.sponsor, data.server.location, data.server.host
    );
    println!("Ping:     {ping}");
    println!("Download: {:.3} Mbps", data.speeds.download);
    println!("Upload:   {:.3} Mbps", data.speeds.upload);
    if let Some(url) = &data.result_url {
        println!("Result:   {url}");
    }
    Ok(())
}
