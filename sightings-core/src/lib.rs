//! sightings-core: Pure algorithms for the satellite next-pass service.
//!
//! No async, no network, no database. Geodesy, the marker index, feed and
//! element-page parsing and SGP4 pass prediction live here and are shared
//! by `sightings-server` (web server + CLI).

pub mod config;
pub mod elements;
pub mod feed;
pub mod geo;
pub mod marker;
pub mod predict;
pub mod types;

// Re-export commonly used types at crate root
pub use elements::ElementSet;
pub use feed::parse_feed;
pub use marker::{MarkerIndex, NearestMarker};
pub use predict::{predict_passes, Observer, Predictor};
pub use types::*;
