//! Process-wide orbital element set and its periodic refresher.
//!
//! The set lives in a single-writer cell. Readers take a cheap `Arc`
//! snapshot, so a refresh swaps the whole set at once and never exposes a
//! half-updated one. Only one refresh runs at a time; a refresh that fails
//! leaves the previous set in place.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use sightings_core::elements::{current_element_set, ElementSet};
use sightings_core::predict::{Observer, Predictor, SubPoint};
use sightings_core::types::{Pass, Result, SightingError};

use crate::fetch::Fetcher;

pub struct ElementStore {
    current: RwLock<Option<Arc<ElementSet>>>,
    refreshing: tokio::sync::Mutex<()>,
    fetcher: Arc<dyn Fetcher>,
    url: String,
}

impl ElementStore {
    pub fn new(fetcher: Arc<dyn Fetcher>, url: &str) -> Self {
        ElementStore {
            current: RwLock::new(None),
            refreshing: tokio::sync::Mutex::new(()),
            fetcher,
            url: url.to_string(),
        }
    }

    /// Snapshot of the current set, if one was ever loaded.
    pub fn current(&self) -> Option<Arc<ElementSet>> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the current set.
    pub fn install(&self, set: ElementSet) -> Arc<ElementSet> {
        let set = Arc::new(set);
        match self.current.write() {
            Ok(mut guard) => *guard = Some(set.clone()),
            Err(poisoned) => *poisoned.into_inner() = Some(set.clone()),
        }
        set
    }

    /// Fetch the element page and install the set valid now.
    ///
    /// Returns `Ok(None)` without fetching when another refresh is running.
    pub async fn refresh(&self) -> Result<Option<Arc<ElementSet>>> {
        let Ok(_running) = self.refreshing.try_lock() else {
            debug!("element refresh already running");
            return Ok(None);
        };

        let page = self.fetcher.fetch(&self.url).await?;
        let set = current_element_set(&page, Utc::now())?;
        // Reject lines SGP4 cannot use before they replace a working set.
        Predictor::new(&set)?;

        let set = self.install(set);
        info!(
            name = %set.name,
            valid_from = %set.valid_from,
            "orbital elements updated"
        );
        Ok(Some(set))
    }

    fn predictor(&self) -> Result<Predictor> {
        let set = self.current().ok_or(SightingError::NoElementSet)?;
        Predictor::new(&set)
    }

    /// Up to `count` passes over the given location rising after `now`.
    pub fn predict_passes(
        &self,
        lat: f64,
        lon: f64,
        alt_m: f64,
        count: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Pass>> {
        self.predictor()?.passes(&Observer { lat, lon, alt_m }, now, count)
    }

    /// Sub-satellite point at `at`.
    #[cfg(test)]
    pub fn subpoint(&self, at: DateTime<Utc>) -> Result<SubPoint> {
        self.predictor()?.subpoint(at)
    }

    /// `len` sub-satellite points ending at `now`, `step` apart, oldest first.
    pub fn trail(
        &self,
        now: DateTime<Utc>,
        len: usize,
        step: chrono::Duration,
    ) -> Result<Vec<SubPoint>> {
        let predictor = self.predictor()?;
        (0..len)
            .rev()
            .map(|i| predictor.subpoint(now - step * i as i32))
            .collect()
    }

    /// Refresh now and then every `every`, until the handle is aborted.
    pub fn start_refresher(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        info!("Starting element refresher (interval: {}h)", every.as_secs() / 3600);

        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                // The first tick completes immediately.
                ticker.tick().await;
                match self.refresh().await {
                    Ok(Some(_)) => {}
                    Ok(None) => debug!("scheduled element refresh skipped"),
                    Err(e) => error!("Element refresh failed, keeping previous set: {e}"),
                }
            }
        })
    }
}
