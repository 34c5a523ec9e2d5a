//! Single-flight feed cache.
//!
//! A marker's feed is fetched, parsed and persisted at most once at a time.
//! The first caller for a marker registers a completion handle in the
//! in-flight map and spawns the load; later callers for the same marker
//! wait on that handle and receive the same outcome, including the same
//! `Arc`'d error. The entry is removed when the load settles, whatever the
//! result, so a failed load is retried by the next caller.
//!
//! The load runs on its own task: a caller going away does not cancel it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use sightings_core::feed::{feed_url, parse_feed};
use sightings_core::types::{ObservationPoint, Result, SightingError};

use crate::db::SqliteStore;
use crate::fetch::Fetcher;

/// Shared result of one load cycle.
pub type Outcome = std::result::Result<(), Arc<SightingError>>;

type InFlight = Arc<Mutex<HashMap<i64, watch::Receiver<Option<Outcome>>>>>;

fn lock(map: &InFlight) -> MutexGuard<'_, HashMap<i64, watch::Receiver<Option<Outcome>>>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct FeedCache {
    store: SqliteStore,
    fetcher: Arc<dyn Fetcher>,
    url_template: Arc<str>,
    in_flight: InFlight,
}

impl FeedCache {
    pub fn new(store: SqliteStore, fetcher: Arc<dyn Fetcher>, url_template: &str) -> Self {
        FeedCache {
            store,
            fetcher,
            url_template: Arc::from(url_template),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Make sure `point` has a persisted feed, loading it if absent.
    ///
    /// Freshness is presence: an existing feed is never refetched here.
    pub async fn ensure_fresh(&self, point: &ObservationPoint) -> Outcome {
        match self.store.has_feed(point.id).await {
            Ok(true) => Ok(()),
            Ok(false) => self.join_or_start(point, false).await,
            Err(e) => Err(Arc::new(e)),
        }
    }

    /// Refetch `point`'s feed even if one is present.
    ///
    /// Shares an in-flight load if there is one.
    pub async fn refresh(&self, point: &ObservationPoint) -> Outcome {
        self.join_or_start(point, true).await
    }

    /// Number of markers with a load in progress.
    #[cfg(test)]
    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    #[cfg(test)]
    pub fn is_in_flight(&self, marker_id: i64) -> bool {
        lock(&self.in_flight).contains_key(&marker_id)
    }

    async fn join_or_start(&self, point: &ObservationPoint, force: bool) -> Outcome {
        let rx = {
            let mut map = lock(&self.in_flight);
            match map.get(&point.id) {
                Some(rx) => {
                    debug!(marker = point.id, "joining in-flight feed load");
                    rx.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    map.insert(point.id, rx.clone());
                    info!(
                        marker = point.id,
                        name = %point.name,
                        in_flight = ?map.keys().collect::<Vec<_>>(),
                        "loading feed"
                    );

                    let load = FeedLoad {
                        store: self.store.clone(),
                        fetcher: self.fetcher.clone(),
                        url_template: self.url_template.clone(),
                        point: point.clone(),
                        force,
                    };
                    let guard = InFlightGuard {
                        map: self.in_flight.clone(),
                        marker_id: point.id,
                    };
                    tokio::spawn(load.run(guard, tx));
                    rx
                }
            }
        };

        wait(rx).await
    }
}

async fn wait(mut rx: watch::Receiver<Option<Outcome>>) -> Outcome {
    match rx.wait_for(Option::is_some).await {
        Ok(outcome) => outcome
            .clone()
            .unwrap_or_else(|| Err(Arc::new(aborted()))),
        Err(_) => Err(Arc::new(aborted())),
    }
}

fn aborted() -> SightingError {
    SightingError::Fetch("feed load aborted before completion".into())
}

/// Removes the in-flight entry when dropped, including on panic.
struct InFlightGuard {
    map: InFlight,
    marker_id: i64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut map = lock(&self.map);
        map.remove(&self.marker_id);
        debug!(
            marker = self.marker_id,
            in_flight = ?map.keys().collect::<Vec<_>>(),
            "feed load settled"
        );
    }
}

/// One fetch/parse/persist cycle.
struct FeedLoad {
    store: SqliteStore,
    fetcher: Arc<dyn Fetcher>,
    url_template: Arc<str>,
    point: ObservationPoint,
    force: bool,
}

impl FeedLoad {
    async fn run(self, guard: InFlightGuard, tx: watch::Sender<Option<Outcome>>) {
        let outcome = self.load().await.map_err(Arc::new);
        if let Err(e) = &outcome {
            warn!(marker = self.point.id, name = %self.point.name, "feed load failed: {e}");
        }
        drop(guard);
        tx.send_replace(Some(outcome));
    }

    async fn load(&self) -> Result<()> {
        let id = self.point.id;

        // Another load may have committed between the caller's check and
        // the registration.
        if !self.force && self.store.has_feed(id).await? {
            debug!(marker = id, "feed already present");
            return Ok(());
        }

        let url = feed_url(&self.url_template, &self.point.name);
        let body = self.fetcher.fetch(&url).await?;
        let parsed = parse_feed(&body, &self.point.timezone)?;
        let count = parsed.records.len();
        let published = parsed.document.published;

        self.store.replace_feed(id, parsed).await?;
        info!(marker = id, sightings = count, %published, "feed stored");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
