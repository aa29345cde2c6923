use super::directory::{ClientConfig, ServerCandidate};

pub const EARTH_RADIUS_KM: f64 = 6371.0;
const MILES_PER_KM: f64 = 0.621371;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Great-circle distance in kilometres between two points given in degrees.
pub fn distance_km(a: Coordinates, b: Coordinates) -> f64 {
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().min(1.0).asin();
    EARTH_RADIUS_KM * c
}

pub fn km_to_miles(km: f64) -> f64 {
    km * MILES_PER_KM
}

/// Annotates each server with its distance from the client and sorts nearest first.
/// The sort is stable, so equidistant servers keep their listing order.
pub fn rank_by_distance(
    client: &ClientConfig,
    servers: Vec<ServerCandidate>,
) -> Vec<ServerCandidate> {
    let origin = client.coordinates();
    let mut ranked: Vec<ServerCandidate> = servers
        .into_iter()
        .map(|server| {
            let km = distance_km(origin, server.coordinates());
            server.with_distance(km)
        })
        .collect();

    ranked.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
    ranked
}
