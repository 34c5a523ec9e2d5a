//! Nearest observation point lookup.
//!
//! A linear scan is fine: there are tens to a few hundred instrumented
//! locations, and the index is built once at startup.

use serde::Serialize;

use crate::geo::haversine_km;
use crate::types::{ObservationPoint, Result, SightingError};

/// The nearest point to a query coordinate.
#[derive(Debug, Clone, Serialize)]
pub struct NearestMarker {
    #[serde(flatten)]
    pub point: ObservationPoint,
    /// Distance from the query coordinate in km.
    pub dist: f64,
}

/// Immutable set of observation points.
#[derive(Debug, Clone)]
pub struct MarkerIndex {
    points: Vec<ObservationPoint>,
}

impl MarkerIndex {
    /// Build the index. An empty point set is a configuration error.
    pub fn new(mut points: Vec<ObservationPoint>) -> Result<Self> {
        if points.is_empty() {
            return Err(SightingError::Config(
                "no observation points loaded (run `sightings load-markers` first)".into(),
            ));
        }
        // Scanning in id order makes "first minimum wins" the id tie-break.
        points.sort_by_key(|p| p.id);
        Ok(MarkerIndex { points })
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn get(&self, id: i64) -> Option<&ObservationPoint> {
        self.points
            .binary_search_by_key(&id, |p| p.id)
            .ok()
            .map(|i| &self.points[i])
    }

    pub fn points(&self) -> &[ObservationPoint] {
        &self.points
    }

    /// Nearest point by great-circle distance; ties go to the smallest id.
    pub fn nearest(&self, lat: f64, lon: f64) -> NearestMarker {
        let mut best = &self.points[0];
        let mut best_dist = haversine_km(lat, lon, best.lat, best.lon);

        for p in &self.points[1..] {
            let d = haversine_km(lat, lon, p.lat, p.lon);
            if d < best_dist {
                best = p;
                best_dist = d;
            }
        }

        NearestMarker {
            point: best.clone(),
            dist: best_dist,
        }
    }
}
