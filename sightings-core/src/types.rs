//! Shared types and the error enum for sightings-core.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors produced by the sighting pipeline.
#[derive(Debug, Error)]
pub enum SightingError {
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("parse failed: {0}")]
    Parse(String),
    #[error("no orbital element set has been loaded")]
    NoElementSet,
    #[error("config error: {0}")]
    Config(String),
    #[error("orbital elements rejected: {0}")]
    Elements(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SightingError>;

// ---------------------------------------------------------------------------
// Reference data
// ---------------------------------------------------------------------------

/// A fixed location for which a sighting feed is published.
///
/// Loaded once at startup and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationPoint {
    pub id: i64,
    /// Feed name, e.g. `United_Kingdom_England_London`.
    pub name: String,
    /// Human readable label.
    pub label: String,
    pub lat: f64,
    pub lon: f64,
    /// IANA zone the feed's local times are written in.
    pub timezone: String,
}

// ---------------------------------------------------------------------------
// Feed data
// ---------------------------------------------------------------------------

/// One fetched feed document, keyed 1:1 by observation point.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedDocument {
    pub published: DateTime<Utc>,
    pub body: String,
}

/// One parsed sighting from a feed item.
///
/// `info` holds the description fields as published (`date`, `time`,
/// `duration`, `maximum_elevation`, `approach`, `departure`, ...).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SightingRecord {
    pub datetime: DateTime<Utc>,
    pub info: BTreeMap<String, String>,
}

/// A fully parsed feed: the document and the complete record set it yields.
#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub document: FeedDocument,
    pub records: Vec<SightingRecord>,
}

// ---------------------------------------------------------------------------
// Prediction output
// ---------------------------------------------------------------------------

/// A predicted visible pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Pass {
    pub rise: DateTime<Utc>,
    pub transit: DateTime<Utc>,
    pub set: DateTime<Utc>,
    /// Peak elevation in degrees.
    pub max_elevation_deg: f64,
}

impl Pass {
    /// Visible duration in whole seconds.
    pub fn duration_secs(&self) -> i64 {
        (self.set - self.rise).num_seconds()
    }
}

/// Where an answer to "hours until next pass" came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PassSource {
    Feed,
    Predicted,
    None,
}

impl PassSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassSource::Feed => "feed",
            PassSource::Predicted => "predicted",
            PassSource::None => "none",
        }
    }
}

/// Answer to "how long until the next visible pass".
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NextPass {
    #[serde(rename = "h")]
    pub hours: f64,
    pub source: PassSource,
}

impl NextPass {
    /// The explicit "no data" answer.
    pub fn none() -> Self {
        NextPass {
            hours: 0.0,
            source: PassSource::None,
        }
    }
}
