//! Checkpoint location.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

/// IP geolocation endpoint queried when the location is `auto`.
pub const GEOLOCATION_URL: &str = "http://ip-api.com/json/";

/// A `(lat, lon)` pair, written as `"<lat>,<lon>"`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

impl Location {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn latitude(&self) -> String {
        self.lat.to_string()
    }

    pub fn longitude(&self) -> String {
        self.lon.to_string()
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.lat, self.lon)
    }
}

impl FromStr for Location {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (lat, lon) = s
            .split_once(',')
            .ok_or_else(|| anyhow!("location '{}' is not '<lat>,<lon>'", s))?;
        let lat: f64 = lat
            .trim()
            .parse()
            .with_context(|| format!("invalid latitude in '{}'", s))?;
        let lon: f64 = lon
            .trim()
            .parse()
            .with_context(|| format!("invalid longitude in '{}'", s))?;
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return Err(anyhow!("location '{}' is out of range", s));
        }
        Ok(Self { lat, lon })
    }
}

/// Configured location: a fixed pair or `auto`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LocationSetting {
    Auto,
    Fixed(Location),
}

impl FromStr for LocationSetting {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().eq_ignore_ascii_case("auto") {
            Ok(LocationSetting::Auto)
        } else {
            Ok(LocationSetting::Fixed(s.parse()?))
        }
    }
}

#[derive(Deserialize)]
struct GeoResponse {
    status: String,
    lat: Option<f64>,
    lon: Option<f64>,
}

/// Resolve the setting once at startup. `auto` falls back to `0,0` on any
/// lookup failure.
pub fn resolve(setting: LocationSetting, timeout: Duration) -> Location {
    match setting {
        LocationSetting::Fixed(location) => location,
        LocationSetting::Auto => match lookup(GEOLOCATION_URL, timeout) {
            Ok(location) => {
                log::info!("location: resolved {} via ip geolocation", location);
                location
            }
            Err(err) => {
                log::warn!("location: lookup failed, using 0,0: {:#}", err);
                Location::default()
            }
        },
    }
}

fn lookup(endpoint: &str, timeout: Duration) -> Result<Location> {
    let agent = ureq::AgentBuilder::new().timeout(timeout).build();
    let body: GeoResponse = agent
        .get(endpoint)
        .call()
        .with_context(|| format!("request {}", endpoint))?
        .into_json()
        .context("decode geolocation response")?;
    parse_geo(body)
}

fn parse_geo(body: GeoResponse) -> Result<Location> {
    if body.status != "success" {
        return Err(anyhow!("geolocation status '{}'", body.status));
    }
    match (body.lat, body.lon) {
        (Some(lat), Some(lon)) => Ok(Location::new(lat, lon)),
        _ => Err(anyhow!("geolocation response without coordinates")),
    }
}
