//! Caller address to approximate location.

use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;
use serde::Serialize;

use sightings_core::config::GeoIpConfig;

/// Location reported for a caller address.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeoRecord {
    pub ip: String,
    pub city: String,
    pub lat: f64,
    pub lon: f64,
    pub timezone: String,
}

impl GeoRecord {
    /// Answer for addresses the locator knows nothing about.
    pub fn not_found(ip: String) -> Self {
        GeoRecord {
            ip,
            city: "Not Found".into(),
            lat: 0.0,
            lon: 0.0,
            timezone: "Etc/GMT".into(),
        }
    }
}

/// A located address, without the address itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub city: String,
    pub lat: f64,
    pub lon: f64,
    pub timezone: String,
}

pub trait GeoLocator: Send + Sync {
    fn locate(&self, ip: IpAddr) -> Option<Location>;
}

/// Answers every public address with one configured location.
pub struct FixedLocator {
    location: Option<Location>,
}

impl FixedLocator {
    pub fn new(location: Option<Location>) -> Self {
        FixedLocator { location }
    }

    /// Built from the `[geoip]` section; needs both coordinates to answer.
    pub fn from_config(config: &GeoIpConfig) -> Self {
        let location = match (config.lat, config.lon) {
            (Some(lat), Some(lon)) => Some(Location {
                city: config.city.clone().unwrap_or_else(|| "Unknown".into()),
                lat,
                lon,
                timezone: config.timezone.clone().unwrap_or_else(|| "Etc/GMT".into()),
            }),
            _ => None,
        };
        FixedLocator { location }
    }
}

impl GeoLocator for FixedLocator {
    fn locate(&self, ip: IpAddr) -> Option<Location> {
        if !is_public(ip) {
            return None;
        }
        self.location.clone()
    }
}

fn is_public(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => !(v6.is_loopback() || v6.is_unspecified()),
    }
}

/// Resolve `ip` through `locator`, falling back to the "Not Found" record.
pub fn lookup(locator: &dyn GeoLocator, ip: Option<IpAddr>) -> GeoRecord {
    let shown = ip.map(|ip| ip.to_string()).unwrap_or_default();
    match ip.and_then(|ip| locator.locate(ip)) {
        Some(loc) => GeoRecord {
            ip: shown,
            city: loc.city,
            lat: loc.lat,
            lon: loc.lon,
            timezone: loc.timezone,
        },
        None => GeoRecord::not_found(shown),
    }
}

/// Caller address: first `X-Forwarded-For` hop, then `X-Real-IP`, then the
/// socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
    let forwarded: Option<IpAddr> = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok());

    forwarded
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok())
        })
        .or_else(|| peer.map(|p| p.ip()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn london() -> FixedLocator {
        FixedLocator::from_config(&GeoIpConfig {
            lat: Some(51.5072),
            lon: Some(-0.1276),
            city: Some("London".into()),
            timezone: Some("Europe/London".into()),
        })
    }

    #[test]
    fn test_public_address_located() {
        let rec = lookup(&london(), Some("81.2.69.160".parse().unwrap()));
        assert_eq!(rec.city, "London");
        assert_eq!(rec.ip, "81.2.69.160");
        assert_eq!(rec.timezone, "Europe/London");
    }

    #[test]
    fn test_private_and_missing_addresses_not_found() {
        for ip in ["127.0.0.1", "10.1.2.3", "192.168.0.7", "::1"] {
            let rec = lookup(&london(), Some(ip.parse().unwrap()));
            assert_eq!(rec, GeoRecord::not_found(ip.to_string()));
        }
        let rec = lookup(&london(), None);
        assert_eq!(rec.city, "Not Found");
        assert_eq!(rec.lat, 0.0);
    }

    #[test]
    fn test_unconfigured_locator() {
        let locator = FixedLocator::from_config(&GeoIpConfig::default());
        let rec = lookup(&locator, Some("81.2.69.160".parse().unwrap()));
        assert_eq!(rec.timezone, "Etc/GMT");
        assert_eq!(rec.city, "Not Found");
    }

    #[test]
    fn test_client_ip_precedence() {
        let peer: SocketAddr = "203.0.113.9:5000".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, Some(peer)), Some(peer.ip()));
        assert_eq!(client_ip(&headers, None), None);

        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.4"));
        assert_eq!(
            client_ip(&headers, Some(peer)),
            Some("198.51.100.4".parse().unwrap())
        );

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("81.2.69.160, 10.0.0.1"),
        );
        assert_eq!(
            client_ip(&headers, Some(peer)),
            Some("81.2.69.160".parse().unwrap())
        );
    }
}
