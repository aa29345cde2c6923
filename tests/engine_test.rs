use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, Form, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use speednet::speedtest::directory::{Resolver, ServerCandidate};
use speednet::speedtest::distance::{distance_km, rank_by_distance, Coordinates};
use speednet::speedtest::ping::{LatencyProber, FAILED_PING_MS};
use speednet::{run_speed_test, Settings, SpeedTestData, SpeedTestError, TestUpdate};

const DEAD_URL: &str = "http://127.0.0.1:1/unreachable";

// Roughly 5, 50, 500, 1000 and 2000 km north of the client at (0, 0).
const SERVERS: &[(&str, f64)] = &[
    ("near", 0.045),
    ("mid", 0.45),
    ("bad", 4.5),
    ("hang", 9.0),
    ("broken", 18.0),
];

async fn config() -> &'static str {
    r#"<?xml version="1.0" encoding="UTF-8"?>
<settings>
<client ip="192.0.2.10" lat="0" lon="0" isp="Loopback ISP" isprating="3.0" rating="0" ispdlavg="0" ispulavg="0" loggedin="0" country="ZZ" />
</settings>"#
}

async fn servers(State(addr): State<SocketAddr>) -> String {
    let entries: String = SERVERS
        .iter()
        .enumerate()
        .map(|(i, (name, lat))| {
            format!(
                r#"<server url="http://{addr}/{name}/upload.php" lat="{lat}" lon="0" name="{name}" country="Testland" cc="TL" sponsor="Sponsor {name}" id="{id}" host="{addr}" />"#,
                id = 100 + i
            )
        })
        .collect();
    format!("<settings><servers>{entries}</servers></settings>")
}

fn image_edge(file: &str) -> Option<usize> {
    let rest = file.strip_prefix("random")?.strip_suffix(".jpg")?;
    let (w, h) = rest.split_once('x')?;
    (w == h).then(|| w.parse().ok()).flatten()
}

async fn resource(Path((server, file)): Path<(String, String)>) -> Response {
    if file == "latency.txt" {
        let delay = match server.as_str() {
            "near" => 30,
            "mid" => 120,
            "hang" => 2_000,
            _ => 0,
        };
        tokio::time::sleep(Duration::from_millis(delay)).await;
        return if server == "bad" {
            "not a latency file".into_response()
        } else {
            "test=test".into_response()
        };
    }

    match image_edge(&file) {
        Some(_) if server == "broken" => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        Some(edge) => vec![0u8; edge * 10].into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn upload(body: axum::body::Bytes) -> String {
    format!("size={}", body.len())
}

async fn report(Form(form): Form<std::collections::HashMap<String, String>>) -> Response {
    match form.get("serverid").map(String::as_str) {
        Some("100") if form.contains_key("hash") => "resultid=4242&date=today".into_response(),
        _ => StatusCode::BAD_REQUEST.into_response(),
    }
}

async fn spawn_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let app = Router::new()
        .route("/config.php", get(config))
        .route("/servers.php", get(servers))
        .route("/api.php", post(report))
        .route("/{server}/{file}", get(resource).post(upload))
        .layer(DefaultBodyLimit::disable())
        .with_state(addr);

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn http_client() -> reqwest::Client {
    Settings::default().http_client().unwrap()
}

fn settings(addr: SocketAddr) -> Settings {
    Settings {
        max_time: Duration::from_millis(300),
        ping_count: Some(3),
        max_servers: 3,
        probe_timeout: Duration::from_secs(1),
        config_urls: vec![DEAD_URL.to_string(), format!("http://{addr}/config.php")],
        server_list_urls: vec![DEAD_URL.to_string(), format!("http://{addr}/servers.php")],
        report_url: format!("http://{addr}/api.php"),
        ..Settings::default()
    }
}

type RunOutcome = (Result<SpeedTestData, SpeedTestError>, Vec<TestUpdate>);

async fn run(settings: Settings) -> RunOutcome {
    run_with_cancel(settings, CancellationToken::new()).await
}

async fn run_with_cancel(settings: Settings, cancel: CancellationToken) -> RunOutcome {
    let (tx, mut rx) = mpsc::channel(32);
    let collector = tokio::spawn(async move {
        let mut updates = Vec::new();
        while let Some(update) = rx.recv().await {
            updates.push(update);
        }
        updates
    });

    let result = run_speed_test(tx, cancel, settings).await;
    (result, collector.await.unwrap())
}

fn kind(update: &TestUpdate) -> &'static str {
    match update {
        TestUpdate::Config(_) => "config",
        TestUpdate::Servers(_) => "servers",
        TestUpdate::BestServers(_) => "bestservers",
        TestUpdate::PingProgress(_) => "pingprogress",
        TestUpdate::TestServer(_) => "testserver",
        TestUpdate::DownloadProgress(_) => "downloadprogress",
        TestUpdate::DownloadSpeedProgress(_) => "downloadspeedprogress",
        TestUpdate::DownloadSpeed(_) => "downloadspeed",
        TestUpdate::UploadProgress(_) => "uploadprogress",
        TestUpdate::UploadSpeedProgress(_) => "uploadspeedprogress",
        TestUpdate::UploadSpeed(_) => "uploadspeed",
        TestUpdate::Data(_) => "data",
        TestUpdate::Result(_) => "result",
        TestUpdate::Done(_) => "done",
        TestUpdate::Error(_) => "error",
    }
}

fn server(name: &str, lat: f64, url_base: &str) -> ServerCandidate {
    let url = format!("{url_base}/{name}/upload.php");
    let mut candidate = ServerCandidate::from_url(&url).unwrap();
    candidate.id = name.to_string();
    candidate.lat = lat;
    candidate
}

#[tokio::test]
async fn probing_orders_by_latency_and_sinks_failures() {
    let addr = spawn_server().await;
    let base = format!("http://{addr}");
    let client_config = speednet::speedtest::directory::ClientConfig::default();

    // Listed out of order on purpose.
    let listed = vec![
        server("bad", 4.5, &base),
        server("near", 0.045, &base),
        server("mid", 0.45, &base),
    ];
    let ranked = rank_by_distance(&client_config, listed);
    let names: Vec<&str> = ranked.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(names, ["near", "mid", "bad"]);
    assert!((ranked[0].distance_km - 5.0).abs() < 0.1);

    let prober = LatencyProber::new(http_client(), Duration::from_secs(1));
    let probed = prober.probe(ranked, 3).await.unwrap();
    let names: Vec<&str> = probed.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(names, ["near", "mid", "bad"]);

    let near = probed[0].best_ping_ms.unwrap();
    let mid = probed[1].best_ping_ms.unwrap();
    assert!((30.0..120.0).contains(&near), "near ping {near}");
    assert!(mid >= 120.0 && mid < FAILED_PING_MS, "mid ping {mid}");
    assert_eq!(probed[2].best_ping_ms, Some(FAILED_PING_MS));
}

#[tokio::test]
async fn probe_timeout_counts_as_failed_sample() {
    let addr = spawn_server().await;
    let base = format!("http://{addr}");

    let prober = LatencyProber::new(http_client(), Duration::from_millis(200));
    let probed = prober
        .probe(vec![server("hang", 9.0, &base), server("near", 0.045, &base)], 2)
        .await
        .unwrap();

    assert_eq!(probed[0].id, "near");
    assert_eq!(probed[1].id, "hang");
    assert_eq!(probed[1].best_ping_ms, Some(FAILED_PING_MS));

    let err = prober
        .probe(vec![server("hang", 9.0, &base), server("bad", 4.5, &base)], 2)
        .await
        .unwrap_err();
    assert!(matches!(err, SpeedTestError::NoUsableServer(_)));
}

#[tokio::test]
async fn co_located_fast_server_is_clamped() {
    let addr = spawn_server().await;
    let base = format!("http://{addr}");
    let client_config = speednet::speedtest::directory::ClientConfig::default();

    // Same coordinates as the client and no artificial delay.
    let ranked = rank_by_distance(&client_config, vec![server("local", 0.0, &base)]);
    let prober = LatencyProber::new(http_client(), Duration::from_secs(1));
    let probed = prober.probe(ranked, 1).await.unwrap();
    assert_eq!(probed[0].best_ping_ms, Some(100.0));
}

#[tokio::test]
async fn resolver_falls_back_past_dead_mirrors() {
    let addr = spawn_server().await;
    let s = settings(addr);
    let resolver = Resolver::new(http_client(), s.config_urls.clone(), s.server_list_urls.clone());

    let (client, servers) = resolver.resolve().await.unwrap();
    assert_eq!(client.isp, "Loopback ISP");
    assert_eq!(servers.len(), SERVERS.len());
    assert!(servers.iter().all(|s| s.best_ping_ms.is_none()));
}

#[tokio::test]
async fn full_run_publishes_phases_in_order() {
    let addr = spawn_server().await;
    let (result, updates) = run(settings(addr)).await;
    let data = result.unwrap();

    let kinds: Vec<&str> = updates.iter().map(kind).collect();
    let mut milestones: Vec<&str> = kinds
        .iter()
        .copied()
        .filter(|k| !k.ends_with("progress"))
        .collect();
    milestones.dedup();
    assert_eq!(
        milestones,
        [
            "config",
            "servers",
            "bestservers",
            "testserver",
            "downloadspeed",
            "uploadspeed",
            "data",
            "done"
        ]
    );

    let download_at = kinds.iter().position(|k| *k == "downloadspeed").unwrap();
    assert!(kinds[..download_at].contains(&"downloadprogress"));
    assert!(kinds[download_at..].contains(&"uploadprogress"));
    assert!(!kinds[download_at..].contains(&"downloadprogress"));

    let overall: Vec<f64> = updates.iter().filter_map(TestUpdate::overall).collect();
    assert!(overall.windows(2).all(|w| w[0] <= w[1]), "{overall:?}");
    assert!(overall.iter().all(|p| (0.0..=1.0).contains(p)));
    assert_eq!(overall.first().copied(), Some(2.0 / 23.0));
    assert_eq!(overall.last().copied(), Some(1.0));

    let ping_at = kinds.iter().position(|k| *k == "pingprogress").unwrap();
    assert_eq!(kinds[ping_at - 1], "bestservers");
    assert_eq!(kinds[ping_at + 1], "testserver");

    let best: Vec<String> = updates
        .iter()
        .find_map(|u| match u {
            TestUpdate::BestServers(servers) => {
                Some(servers.iter().map(|s| s.name.clone()).collect())
            }
            _ => None,
        })
        .unwrap();
    assert_eq!(best, ["near", "mid", "bad"]);

    assert_eq!(data.server.location, "near");
    assert_eq!(data.server.id, "100");
    assert!(data.server.ping.unwrap() >= 30.0);
    assert!(data.speeds.download > 0.0);
    assert!(data.speeds.upload > 0.0);
    assert!(data.speeds.original_download > 0.0);
    assert_eq!(data.client.ip, "192.0.2.10");
    assert!(data.result_url.is_none());
    assert!((data.server.distance - 5.0).abs() < 0.1);
}

#[tokio::test]
async fn exhausted_mirrors_fail_discovery() {
    let mut s = settings(spawn_server().await);
    s.config_urls = vec![DEAD_URL.to_string()];
    s.server_list_urls = (0..8).map(|i| format!("http://127.0.0.1:1/mirror{i}")).collect();

    let (result, updates) = run(s).await;
    assert!(matches!(result, Err(SpeedTestError::Discovery { attempts: 1, .. })));
    assert_eq!(updates.len(), 1);
    assert!(matches!(updates[0], TestUpdate::Error(_)));
}

#[tokio::test]
async fn exhausted_server_mirrors_fail_after_config() {
    let mut s = settings(spawn_server().await);
    s.server_list_urls = (0..8).map(|i| format!("http://127.0.0.1:1/mirror{i}")).collect();

    let (result, updates) = run(s).await;
    assert!(matches!(result, Err(SpeedTestError::Discovery { attempts: 8, .. })));
    let kinds: Vec<&str> = updates.iter().map(kind).collect();
    assert_eq!(kinds, ["config", "error"]);
}

#[tokio::test]
async fn server_id_selects_one_server() {
    let mut s = settings(spawn_server().await);
    s.server_id = Some("101".into());
    s.ping_count = None;

    let (result, updates) = run(s).await;
    let data = result.unwrap();
    assert_eq!(data.server.location, "mid");

    let best = updates
        .iter()
        .find_map(|u| match u {
            TestUpdate::BestServers(servers) => Some(servers.len()),
            _ => None,
        })
        .unwrap();
    assert_eq!(best, 1);
}

#[tokio::test]
async fn unknown_server_id_is_not_usable() {
    let mut s = settings(spawn_server().await);
    s.server_id = Some("999".into());

    let (result, _) = run(s).await;
    assert!(matches!(result, Err(SpeedTestError::NoUsableServer(_))));
}

#[tokio::test]
async fn server_url_override_skips_probing() {
    let addr = spawn_server().await;
    let mut s = settings(addr);
    s.server_url = Some(format!("http://{addr}/near/upload.php"));
    s.server_list_urls = Vec::new();

    let (result, updates) = run(s).await;
    let data = result.unwrap();
    assert!(data.server.ping.is_none());
    assert!(updates
        .iter()
        .all(|u| !matches!(u, TestUpdate::Servers(_) | TestUpdate::BestServers(_))));
    assert!(matches!(updates.last(), Some(TestUpdate::Done(overall)) if *overall == 1.0));
}

#[tokio::test]
async fn failing_download_aborts_the_run() {
    let mut s = settings(spawn_server().await);
    s.server_id = Some("104".into());

    let (result, updates) = run(s).await;
    match result {
        Err(SpeedTestError::Transfer { phase, .. }) => {
            assert_eq!(phase, speednet::TestPhase::Download)
        }
        other => panic!("expected transfer error, got {other:?}"),
    }
    assert!(matches!(updates.last(), Some(TestUpdate::Error(_))));
    assert!(updates.iter().all(|u| !matches!(u, TestUpdate::UploadProgress(_))));
}

#[tokio::test]
async fn submitted_result_yields_public_url() {
    let mut s = settings(spawn_server().await);
    s.submit_results = true;

    let (result, updates) = run(s).await;
    let data = result.unwrap();
    assert_eq!(data.result_url.as_deref(), Some("http://www.speedtest.net/result/4242.png"));

    let kinds: Vec<&str> = updates.iter().map(kind).collect();
    assert_eq!(&kinds[kinds.len() - 3..], ["data", "result", "done"]);
}

#[tokio::test]
async fn failed_submission_keeps_the_measurement() {
    let mut s = settings(spawn_server().await);
    s.submit_results = true;
    s.server_id = Some("101".into());

    let (result, updates) = run(s).await;
    let data = result.unwrap();
    assert!(data.result_url.is_none());
    assert!(data.speeds.download > 0.0);
    assert!(updates.iter().all(|u| !matches!(u, TestUpdate::Result(_) | TestUpdate::Error(_))));
}

#[tokio::test]
async fn run_from_a_chosen_source_address() {
    let mut s = settings(spawn_server().await);
    s.source_ip = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));

    let (result, updates) = run(s).await;
    let data = result.unwrap();
    assert_eq!(data.server.location, "near");
    assert!(data.speeds.download > 0.0);
    assert!(matches!(updates.last(), Some(TestUpdate::Done(_))));
}

#[tokio::test]
async fn cancelled_run_is_aborted_silently() {
    let cancel = CancellationToken::new();
    cancel.cancel();

    let (result, updates) = run_with_cancel(settings(spawn_server().await), cancel).await;
    assert!(matches!(result, Err(SpeedTestError::Aborted)));
    assert!(updates.is_empty());
}

#[test]
fn fixture_servers_sit_at_expected_distances() {
    let origin = Coordinates::new(0.0, 0.0);
    let km: Vec<f64> = [0.045, 0.45, 4.5]
        .iter()
        .map(|lat| distance_km(origin, Coordinates::new(*lat, 0.0)))
        .collect();
    assert!((km[0] - 5.0).abs() < 0.1);
    assert!((km[1] - 50.0).abs() < 0.5);
    assert!((km[2] - 500.0).abs() < 5.0);
}
