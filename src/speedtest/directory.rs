//! Client configuration and server list discovery.
//!
//! Both documents are XML: the configuration carries a single `<client .../>` element,
//! the server list a sequence of `<server .../>` elements. Every value arrives as an
//! attribute string and is coerced here.

use super::distance::Coordinates;
use crate::error::{Result, SpeedTestError};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use reqwest::{Client, Url};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

/// Why a single discovery endpoint was passed over.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("HTTP {0}")]
    Status(reqwest::StatusCode),

    #[error("malformed document: {0}")]
    Markup(#[from] quick_xml::Error),

    #[error("config has no client element")]
    MissingClient,

    #[error("server list is empty")]
    EmptyServerList,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClientConfig {
    pub ip: String,
    pub lat: f64,
    pub lon: f64,
    pub isp: String,
    pub isp_rating: f64,
    pub rating: f64,
    pub isp_dl_avg: f64,
    pub isp_ul_avg: f64,
    pub country: String,
}

impl ClientConfig {
    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.lat, self.lon)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerCandidate {
    pub id: String,
    /// Upload endpoint; latency and download resources live next to it.
    pub url: String,
    pub host: String,
    pub lat: f64,
    pub lon: f64,
    pub name: String,
    pub country: String,
    pub cc: String,
    pub sponsor: String,
    pub distance_km: f64,
    pub best_ping_ms: Option<f64>,
}

impl ServerCandidate {
    /// A candidate for a caller-supplied endpoint that never came from a listing.
    pub fn from_url(url: &str) -> Result<Self> {
        let parsed = Url::parse(url)
            .map_err(|e| SpeedTestError::NoUsableServer(format!("invalid server url {url}: {e}")))?;
        let host = match (parsed.host_str(), parsed.port()) {
            (Some(h), Some(p)) => format!("{h}:{p}"),
            (Some(h), None) => h.to_string(),
            (None, _) => String::new(),
        };

        Ok(Self {
            id: String::new(),
            url: url.to_string(),
            host,
            lat: 0.0,
            lon: 0.0,
            name: String::new(),
            country: String::new(),
            cc: String::new(),
            sponsor: String::new(),
            distance_km: 0.0,
            best_ping_ms: None,
        })
    }

    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.lat, self.lon)
    }

    pub fn with_distance(self, distance_km: f64) -> Self {
        Self { distance_km, ..self }
    }

    pub fn with_best_ping(self, best_ping_ms: f64) -> Self {
        Self {
            best_ping_ms: Some(best_ping_ms),
            ..self
        }
    }

    /// Resolves a file name relative to the server's upload endpoint,
    /// e.g. `latency.txt` or `random350x350.jpg`.
    pub fn resource_url(&self, name: &str) -> Result<Url> {
        Url::parse(&self.url)
            .and_then(|base| base.join(name))
            .map_err(|e| {
                SpeedTestError::NoUsableServer(format!("invalid server url {}: {e}", self.url))
            })
    }

    #[cfg(test)]
    pub(crate) fn test_fixture(id: &str, lat: f64, lon: f64) -> Self {
        Self {
            id: id.to_string(),
            url: format!("http://{id}.example.net:8080/speedtest/upload.php"),
            host: format!("{id}.example.net:8080"),
            lat,
            lon,
            name: id.to_string(),
            country: "Testland".to_string(),
            cc: "TL".to_string(),
            sponsor: "Test".to_string(),
            distance_km: 0.0,
            best_ping_ms: None,
        }
    }
}

type Attributes = HashMap<String, String>;

fn attributes(element: &BytesStart<'_>) -> std::result::Result<Attributes, quick_xml::Error> {
    let mut attrs = HashMap::new();
    for attr in element.attributes() {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        attrs.insert(key, value);
    }
    Ok(attrs)
}

/// Collects the attributes of every element named `tag`, in document order.
fn elements(xml: &str, tag: &str) -> std::result::Result<Vec<Attributes>, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    let mut found = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() == tag.as_bytes() => {
                found.push(attributes(&e)?);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(found)
}

fn text(attrs: &Attributes, key: &str) -> String {
    attrs.get(key).cloned().unwrap_or_default()
}

fn number(attrs: &Attributes, key: &str) -> f64 {
    attrs
        .get(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0.0)
}

pub fn parse_client_config(xml: &str) -> std::result::Result<ClientConfig, EndpointError> {
    let attrs = elements(xml, "client")?
        .into_iter()
        .next()
        .ok_or(EndpointError::MissingClient)?;

    Ok(ClientConfig {
        ip: text(&attrs, "ip"),
        lat: number(&attrs, "lat"),
        lon: number(&attrs, "lon"),
        isp: text(&attrs, "isp"),
        isp_rating: number(&attrs, "isprating"),
        rating: number(&attrs, "rating"),
        isp_dl_avg: number(&attrs, "ispdlavg"),
        isp_ul_avg: number(&attrs, "ispulavg"),
        country: text(&attrs, "country"),
    })
}

fn server_from_attributes(attrs: &Attributes) -> Option<ServerCandidate> {
    let url = attrs.get("url")?;
    Url::parse(url).ok()?;
    let lat: f64 = attrs.get("lat")?.trim().parse().ok()?;
    let lon: f64 = attrs.get("lon")?.trim().parse().ok()?;

    Some(ServerCandidate {
        id: text(attrs, "id"),
        url: url.clone(),
        host: text(attrs, "host"),
        lat,
        lon,
        name: text(attrs, "name"),
        country: text(attrs, "country"),
        cc: text(attrs, "cc"),
        sponsor: text(attrs, "sponsor"),
        distance_km: 0.0,
        best_ping_ms: None,
    })
}

/// Parses a server listing. An empty listing is an error so the caller moves on to the
/// next mirror.
pub fn parse_server_list(xml: &str) -> std::result::Result<Vec<ServerCandidate>, EndpointError> {
    let entries = elements(xml, "server")?;
    let total = entries.len();
    let servers: Vec<ServerCandidate> = entries
        .iter()
        .filter_map(server_from_attributes)
        .collect();

    if servers.len() < total {
        tracing::debug!(skipped = total - servers.len(), "Skipped unusable server entries");
    }
    if servers.is_empty() {
        return Err(EndpointError::EmptyServerList);
    }
    Ok(servers)
}

pub struct Resolver {
    client: Client,
    config_urls: Vec<String>,
    server_list_urls: Vec<String>,
}

impl Resolver {
    pub fn new(client: Client, config_urls: Vec<String>, server_list_urls: Vec<String>) -> Self {
        Self {
            client,
            config_urls,
            server_list_urls,
        }
    }

    pub async fn resolve(&self) -> Result<(ClientConfig, Vec<ServerCandidate>)> {
        let config = self.fetch_config().await?;
        let servers = self.fetch_servers().await?;
        Ok((config, servers))
    }

    pub async fn fetch_config(&self) -> Result<ClientConfig> {
        self.first_success(&self.config_urls, parse_client_config).await
    }

    pub async fn fetch_servers(&self) -> Result<Vec<ServerCandidate>> {
        self.first_success(&self.server_list_urls, parse_server_list).await
    }

    async fn fetch_text(&self, url: &str) -> std::result::Result<String, EndpointError> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(EndpointError::Status(response.status()));
        }
        Ok(response.text().await?)
    }

    async fn first_success<T>(
        &self,
        urls: &[String],
        parse: fn(&str) -> std::result::Result<T, EndpointError>,
    ) -> Result<T> {
        let mut last_error = String::from("no endpoints configured");

        for url in urls {
            let outcome = match self.fetch_text(url).await {
                Ok(body) => parse(&body),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(value) => {
                    tracing::debug!(%url, "Discovery endpoint answered");
                    return Ok(value);
                }
                Err(e) => {
                    tracing::warn!(%url, error = %e, "Discovery endpoint failed, trying next");
                    last_error = format!("{url}: {e}");
                }
            }
        }

        Err(SpeedTestError::Discovery {
            attempts: urls.len(),
            last_error,
        })
    }
}

/// Narrows a listing to the server with the given id.
pub fn select_server(servers: Vec<ServerCandidate>, id: &str) -> Result<Vec<ServerCandidate>> {
    let selected: Vec<ServerCandidate> =
        servers.into_iter().filter(|s| s.id == id).take(1).collect();
    if selected.is_empty() {
        return Err(SpeedTestError::NoUsableServer(format!("server id {id} not found")));
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<settings>
<client ip="203.0.113.7" lat="52.3740" lon="4.8897" isp="Example Telecom &amp; Co" isprating="3.7" rating="0" ispdlavg="0" ispulavg="n/a" loggedin="0" country="NL" />
<server-config threadcount="4" ignoreids="1,2" />
</settings>"#;

    const SERVERS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<settings>
<servers>
<server url="http://speed.example.nl:8080/speedtest/upload.php" lat="52.3667" lon="4.9000" name="Amsterdam" country="Netherlands" cc="NL" sponsor="Example" id="1001" host="speed.example.nl:8080" />
<server url="http://broken.example.nl/upload.php" lat="north" lon="4.9" name="Broken" country="Netherlands" cc="NL" sponsor="Broken" id="1002" host="broken.example.nl" />
<server url="http://speed.example.de/speedtest/upload.php" lat="52.5200" lon="13.4050" name="Berlin" country="Germany" cc="DE" sponsor="Beispiel" id="2001" host="speed.example.de" />
</servers>
</settings>"#;

    #[test]
    fn parses_client_and_coerces_numbers() {
        let client = parse_client_config(CONFIG).unwrap();
        assert_eq!(client.ip, "203.0.113.7");
        assert_eq!(client.isp, "Example Telecom & Co");
        assert!((client.lat - 52.374).abs() < 1e-9);
        assert!((client.isp_rating - 3.7).abs() < 1e-9);
        assert_eq!(client.isp_ul_avg, 0.0);
        assert_eq!(client.country, "NL");
    }

    #[test]
    fn config_without_client_is_rejected() {
        assert!(matches!(
            parse_client_config("<settings></settings>"),
            Err(EndpointError::MissingClient)
        ));
        assert!(parse_client_config("this is not xml <<<").is_err());
    }

    #[test]
    fn parses_servers_and_skips_bad_coordinates() {
        let servers = parse_server_list(SERVERS).unwrap();
        let ids: Vec<&str> = servers.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["1001", "2001"]);
        assert_eq!(servers[0].host, "speed.example.nl:8080");
        assert!(servers.iter().all(|s| s.best_ping_ms.is_none()));
    }

    #[test]
    fn empty_server_list_is_an_error() {
        assert!(matches!(
            parse_server_list("<settings><servers></servers></settings>"),
            Err(EndpointError::EmptyServerList)
        ));
    }

    #[test]
    fn resource_urls_resolve_next_to_upload_endpoint() {
        let server = ServerCandidate::test_fixture("srv", 0.0, 0.0);
        assert_eq!(
            server.resource_url("latency.txt").unwrap().as_str(),
            "http://srv.example.net:8080/speedtest/latency.txt"
        );
        assert_eq!(
            server.resource_url("random350x350.jpg").unwrap().as_str(),
            "http://srv.example.net:8080/speedtest/random350x350.jpg"
        );
    }

    #[test]
    fn select_server_by_id() {
        let servers = parse_server_list(SERVERS).unwrap();
        let picked = select_server(servers.clone(), "2001").unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].name, "Berlin");

        assert!(matches!(
            select_server(servers, "9999"),
            Err(SpeedTestError::NoUsableServer(_))
        ));
    }

    #[test]
    fn server_from_override_url() {
        let server =
            ServerCandidate::from_url("http://10.0.0.5:8080/speedtest/upload.php").unwrap();
        assert_eq!(server.host, "10.0.0.5:8080");
        assert!(server.best_ping_ms.is_none());
        assert!(ServerCandidate::from_url("not a url").is_err());
    }
}
