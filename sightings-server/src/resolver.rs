//! "How long until the next visible pass" for a coordinate.
//!
//! Nearest marker, then its feed (loaded if missing), then the earliest
//! persisted sighting after now. With no future sighting the answer is
//! predicted from the orbital elements, and with no elements either it is
//! the explicit "none" answer. Feed failures never reach the caller.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use sightings_core::marker::{MarkerIndex, NearestMarker};
use sightings_core::types::{NextPass, Pass, PassSource, Result, SightingError, SightingRecord};

use crate::cache::FeedCache;
use crate::db::SqliteStore;
use crate::orbit::ElementStore;

/// Observer height used for predicted passes, metres.
pub const OBSERVER_ALT_M: f64 = 100.0;

/// Passes requested from the predictor when the feed has nothing.
pub const PREDICTION_COUNT: usize = 10;

fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 3_600_000.0
}

pub struct Resolver {
    markers: MarkerIndex,
    store: SqliteStore,
    cache: FeedCache,
    elements: Arc<ElementStore>,
}

impl Resolver {
    pub fn new(
        markers: MarkerIndex,
        store: SqliteStore,
        cache: FeedCache,
        elements: Arc<ElementStore>,
    ) -> Self {
        Resolver {
            markers,
            store,
            cache,
            elements,
        }
    }

    #[cfg(test)]
    pub fn markers(&self) -> &MarkerIndex {
        &self.markers
    }

    pub fn cache(&self) -> &FeedCache {
        &self.cache
    }

    pub fn elements(&self) -> &ElementStore {
        &self.elements
    }

    pub fn nearest(&self, lat: f64, lon: f64) -> NearestMarker {
        self.markers.nearest(lat, lon)
    }

    pub async fn next_pass_hours(&self, lat: f64, lon: f64) -> NextPass {
        self.next_pass_hours_at(lat, lon, Utc::now()).await
    }

    pub async fn next_pass_hours_at(&self, lat: f64, lon: f64, now: DateTime<Utc>) -> NextPass {
        let nearest = self.nearest(lat, lon);
        let marker = &nearest.point;

        if let Err(e) = self.cache.ensure_fresh(marker).await {
            debug!(marker = marker.id, "continuing without feed: {e}");
        }

        match self.store.next_sighting(marker.id, now).await {
            Ok(Some(rec)) => {
                return NextPass {
                    hours: hours_between(now, rec.datetime),
                    source: PassSource::Feed,
                }
            }
            Ok(None) => {}
            Err(e) => warn!(marker = marker.id, "sighting lookup failed: {e}"),
        }

        match self
            .predict(lat, lon, OBSERVER_ALT_M, PREDICTION_COUNT, now)
            .await
        {
            Ok(passes) => {
                if let Some(pass) = passes.first() {
                    return NextPass {
                        hours: hours_between(now, pass.rise),
                        source: PassSource::Predicted,
                    };
                }
            }
            Err(SightingError::NoElementSet) => debug!("no element set for prediction"),
            Err(e) => warn!("pass prediction failed: {e}"),
        }

        NextPass::none()
    }

    /// Nearest marker and all of its persisted sightings.
    ///
    /// A failed feed load is logged; whatever is persisted is returned.
    pub async fn sightings(
        &self,
        lat: f64,
        lon: f64,
    ) -> Result<(NearestMarker, Vec<SightingRecord>)> {
        let nearest = self.nearest(lat, lon);
        if let Err(e) = self.cache.ensure_fresh(&nearest.point).await {
            warn!(marker = nearest.point.id, "feed load failed: {e}");
        }
        let records = self.store.get_sightings(nearest.point.id).await?;
        Ok((nearest, records))
    }

    /// Predict passes off the async workers.
    pub async fn predict(
        &self,
        lat: f64,
        lon: f64,
        alt_m: f64,
        count: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Pass>> {
        let elements = self.elements.clone();
        tokio::task::spawn_blocking(move || elements.predict_passes(lat, lon, alt_m, count, now))
            .await
            .map_err(|e| SightingError::Elements(format!("prediction task failed: {e}")))?
    }
}
