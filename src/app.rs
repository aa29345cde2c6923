use crate::error::{Result, SpeedTestError};
use crate::settings::Settings;
use crate::speedtest::{
    directory::{select_server, ClientConfig, Resolver, ServerCandidate},
    distance::rank_by_distance,
    download::DownloadTest,
    ping::LatencyProber,
    progress::{ProgressEvent, Reporter},
    report::{aggregate, submit, SpeedTestData},
    upload::UploadTest,
    TestPhase,
};
use reqwest::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Everything a run publishes, in the order it happens.
#[derive(Debug, Clone)]
pub enum TestUpdate {
    Config(ClientConfig),
    /// All listed servers, nearest first.
    Servers(Vec<ServerCandidate>),
    /// Probed servers, lowest ping first.
    BestServers(Vec<ServerCandidate>),
    /// Latency phase finished; carries the whole-run progress it accounts for.
    PingProgress(ProgressEvent),
    TestServer(ServerCandidate),
    DownloadProgress(ProgressEvent),
    /// Corrected download speed so far, in Mbps.
    DownloadSpeedProgress(f64),
    DownloadSpeed(f64),
    UploadProgress(ProgressEvent),
    UploadSpeedProgress(f64),
    UploadSpeed(f64),
    Data(SpeedTestData),
    /// Public URL of the submitted result.
    Result(String),
    /// End of a successful run, with the final whole-run progress.
    Done(f64),
    Error(String),
}

impl TestUpdate {
    /// Whole-run progress carried by this update, if any.
    pub fn overall(&self) -> Option<f64> {
        match self {
            TestUpdate::PingProgress(e)
            | TestUpdate::DownloadProgress(e)
            | TestUpdate::UploadProgress(e) => Some(e.overall),
            TestUpdate::Done(overall) => Some(*overall),
            _ => None,
        }
    }
}

/// Runs one complete test, publishing updates on `update_tx`.
///
/// A fatal error is published once as [`TestUpdate::Error`] and returned. After
/// `cancel` fires nothing further is published and the run ends with
/// [`SpeedTestError::Aborted`] at the next checkpoint.
pub async fn run_speed_test(
    update_tx: mpsc::Sender<TestUpdate>,
    cancel: CancellationToken,
    settings: Settings,
) -> Result<SpeedTestData> {
    let mut reporter = Reporter::new(update_tx, cancel);

    match run_phases(&mut reporter, &settings).await {
        Ok(data) => Ok(data),
        Err(e) => {
            if reporter.is_cancelled() {
                tracing::info!("Speed test aborted");
                return Err(SpeedTestError::Aborted);
            }
            tracing::error!(error = %e, "Speed test failed");
            reporter.emit(TestUpdate::Error(e.to_string())).await;
            Err(e)
        }
    }
}

async fn run_phases(reporter: &mut Reporter, settings: &Settings) -> Result<SpeedTestData> {
    let client = settings.http_client()?;
    let resolver = Resolver::new(
        client.clone(),
        settings.config_urls.clone(),
        settings.server_list_urls.clone(),
    );

    let config = resolver.fetch_config().await?;
    reporter.checkpoint()?;
    tracing::info!(ip = %config.ip, isp = %config.isp, "Fetched client configuration");
    reporter.emit(TestUpdate::Config(config.clone())).await;

    let server = match &settings.server_url {
        Some(url) => {
            tracing::info!(%url, "Using server override, skipping latency probe");
            ServerCandidate::from_url(url)?
        }
        None => select_test_server(reporter, settings, &resolver, &client, &config).await?,
    };

    let overall = reporter.advance(TestPhase::Ping, 1.0);
    reporter
        .emit(TestUpdate::PingProgress(ProgressEvent::finished(TestPhase::Ping, overall)))
        .await;
    reporter.emit(TestUpdate::TestServer(server.clone())).await;

    let download = DownloadTest::new(client.clone(), settings.max_time)
        .run(&server, reporter)
        .await?;
    reporter.emit(TestUpdate::DownloadSpeed(download.mbps())).await;

    let upload = UploadTest::new(client.clone(), settings.max_time)
        .run(&server, reporter)
        .await?;
    reporter.emit(TestUpdate::UploadSpeed(upload.mbps())).await;

    let mut data = aggregate(&config, &server, &download, &upload);
    reporter.checkpoint()?;
    let finished = reporter.advance(TestPhase::Done, 1.0);
    reporter.emit(TestUpdate::Data(data.clone())).await;

    if settings.submit_results {
        match submit(&client, &settings.report_url, &data).await {
            Ok(url) => {
                tracing::info!(%url, "Submitted result");
                data.result_url = Some(url.clone());
                reporter.emit(TestUpdate::Result(url)).await;
            }
            Err(e) => tracing::warn!(error = %e, "Result submission failed"),
        }
    }

    reporter.checkpoint()?;
    reporter.emit(TestUpdate::Done(finished)).await;
    Ok(data)
}

async fn select_test_server(
    reporter: &mut Reporter,
    settings: &Settings,
    resolver: &Resolver,
    client: &Client,
    config: &ClientConfig,
) -> Result<ServerCandidate> {
    let servers = resolver.fetch_servers().await?;
    reporter.checkpoint()?;

    let servers = rank_by_distance(config, servers);
    tracing::info!(count = servers.len(), "Ranked servers by distance");
    reporter.emit(TestUpdate::Servers(servers.clone())).await;

    let candidates = match &settings.server_id {
        Some(id) => select_server(servers, id)?,
        None => servers,
    };

    let prober = LatencyProber::new(client.clone(), settings.probe_timeout);
    let mut best = prober.probe(candidates, settings.ping_count()).await?;
    reporter.checkpoint()?;

    best.truncate(settings.max_servers.max(1));
    reporter.emit(TestUpdate::BestServers(best.clone())).await;

    let server = best
        .into_iter()
        .next()
        .ok_or_else(|| SpeedTestError::NoUsableServer("no server survived probing".into()))?;
    tracing::info!(
        server = %server.id,
        host = %server.host,
        ping_ms = ?server.best_ping_ms,
        distance_km = server.distance_km,
        "Selected test server"
    );
    Ok(server)
}
