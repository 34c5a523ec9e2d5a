//! SGP4 pass prediction from a two-line element set.
//!
//! Positions come out of SGP4 in the TEME frame; they are rotated into an
//! Earth-fixed frame by Greenwich mean sidereal time and compared against an
//! observer on the WGS84 ellipsoid. Rise and set are the crossings of a fixed
//! 10° horizon with no atmospheric refraction.
//!
//! Search strategy: step forward in coarse increments until the elevation
//! crosses the horizon, then bisect the crossing down to about a second.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::elements::ElementSet;
use crate::types::{Pass, Result, SightingError};

/// Minimum elevation counted as visible.
pub const HORIZON_DEG: f64 = 10.0;

/// Passes this short or shorter are discarded.
pub const MIN_PASS_SECS: i64 = 60;

/// How far ahead a search may look before giving up.
pub const SEARCH_WINDOW_DAYS: i64 = 14;

const COARSE_STEP_SECS: i64 = 30;
const BISECT_RESOLUTION_MS: i64 = 1_000;

// WGS84
const WGS84_A_KM: f64 = 6378.137;
const WGS84_F: f64 = 1.0 / 298.257_223_563;

// Greenwich mean sidereal time, degrees
const J2000_UNIX_SECS: f64 = 946_728_000.0;
const SECONDS_PER_DAY: f64 = 86_400.0;
const DAYS_PER_JULIAN_CENTURY: f64 = 36_525.0;
const GMST_BASE_DEG: f64 = 280.460_618_37;
const GMST_ROTATION_PER_DAY: f64 = 360.985_647_366_29;
const GMST_CORRECTION: f64 = 0.000_387_933;

/// A ground observer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observer {
    pub lat: f64,
    pub lon: f64,
    /// Height above the ellipsoid in metres.
    pub alt_m: f64,
}

/// Point on the ground directly below the satellite.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SubPoint {
    pub lat: f64,
    pub lon: f64,
}

/// Initialised SGP4 propagator for one element set.
pub struct Predictor {
    constants: sgp4::Constants,
    epoch: DateTime<Utc>,
}

impl Predictor {
    pub fn new(set: &ElementSet) -> Result<Self> {
        let elements = sgp4::Elements::from_tle(
            Some(set.name.clone()),
            set.line1.as_bytes(),
            set.line2.as_bytes(),
        )
        .map_err(|e| SightingError::Elements(e.to_string()))?;
        let constants = sgp4::Constants::from_elements(&elements)
            .map_err(|e| SightingError::Elements(e.to_string()))?;
        let epoch = elements.datetime.and_utc();
        Ok(Predictor { constants, epoch })
    }

    /// Epoch of the element set.
    pub fn epoch(&self) -> DateTime<Utc> {
        self.epoch
    }

    /// TEME position in km.
    fn position_teme(&self, at: DateTime<Utc>) -> Result<[f64; 3]> {
        let minutes = (at - self.epoch).num_milliseconds() as f64 / 60_000.0;
        let prediction = self
            .constants
            .propagate(sgp4::MinutesSinceEpoch(minutes))
            .map_err(|e| SightingError::Elements(e.to_string()))?;
        Ok(prediction.position)
    }

    /// Earth-fixed position in km.
    fn position_ecef(&self, at: DateTime<Utc>) -> Result<[f64; 3]> {
        let [x, y, z] = self.position_teme(at)?;
        let theta = gmst_radians(at);
        let (s, c) = theta.sin_cos();
        Ok([c * x + s * y, -s * x + c * y, z])
    }

    /// Geodetic sub-satellite point.
    pub fn subpoint(&self, at: DateTime<Utc>) -> Result<SubPoint> {
        let [x, y, z] = self.position_ecef(at)?;
        let lon = y.atan2(x);
        let p = (x * x + y * y).sqrt();
        let e2 = WGS84_F * (2.0 - WGS84_F);

        let mut lat = z.atan2(p * (1.0 - e2));
        for _ in 0..5 {
            let n = WGS84_A_KM / (1.0 - e2 * lat.sin().powi(2)).sqrt();
            lat = (z + e2 * n * lat.sin()).atan2(p);
        }

        Ok(SubPoint {
            lat: lat.to_degrees(),
            lon: lon.to_degrees(),
        })
    }

    /// Elevation of the satellite above the observer's horizon plane, degrees.
    pub fn elevation_deg(&self, observer: &Observer, at: DateTime<Utc>) -> Result<f64> {
        let sat = self.position_ecef(at)?;
        let (site, up) = observer_frame(observer);
        let range = [sat[0] - site[0], sat[1] - site[1], sat[2] - site[2]];
        let dist = (range[0].powi(2) + range[1].powi(2) + range[2].powi(2)).sqrt();
        let sin_el = (range[0] * up[0] + range[1] * up[1] + range[2] * up[2]) / dist;
        Ok(sin_el.clamp(-1.0, 1.0).asin().to_degrees())
    }

    /// Up to `count` passes longer than [`MIN_PASS_SECS`] rising after `from`.
    ///
    /// A pass already in progress at `from` is skipped. Fewer than `count`
    /// passes come back if the search window runs out.
    pub fn passes(
        &self,
        observer: &Observer,
        from: DateTime<Utc>,
        count: usize,
    ) -> Result<Vec<Pass>> {
        let end = from + Duration::days(SEARCH_WINDOW_DAYS);
        let mut t = from;

        if self.elevation_deg(observer, t)? >= HORIZON_DEG {
            match self.scan_set(observer, t, end)? {
                Some((set, _, _)) => t = set,
                None => return Ok(Vec::new()),
            }
        }

        collect_passes(t, count, |from| self.next_pass(observer, from, end))
    }

    /// The next complete pass rising after `from`, of any length.
    fn next_pass(
        &self,
        observer: &Observer,
        from: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<Pass>> {
        let Some(rise) = self.scan_rise(observer, from, end)? else {
            return Ok(None);
        };
        let Some((set, transit, max_elevation_deg)) = self.scan_set(observer, rise, end)? else {
            return Ok(None);
        };
        Ok(Some(Pass {
            rise,
            transit,
            set,
            max_elevation_deg,
        }))
    }

    /// First time after `from` the satellite is at or above the horizon.
    fn scan_rise(
        &self,
        observer: &Observer,
        from: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let step = Duration::seconds(COARSE_STEP_SECS);
        let mut lo = from;
        while lo < end {
            let hi = lo + step;
            if self.elevation_deg(observer, hi)? >= HORIZON_DEG {
                return self.bisect(observer, lo, hi, true).map(Some);
            }
            lo = hi;
        }
        Ok(None)
    }

    /// Set time after `from`, plus the highest sampled point of the pass.
    fn scan_set(
        &self,
        observer: &Observer,
        from: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>, f64)>> {
        let step = Duration::seconds(COARSE_STEP_SECS);
        let mut transit = from;
        let mut max_el = self.elevation_deg(observer, from)?;
        let mut lo = from;

        while lo < end {
            let hi = lo + step;
            let el = self.elevation_deg(observer, hi)?;
            if el < HORIZON_DEG {
                let set = self.bisect(observer, lo, hi, false)?;
                return Ok(Some((set, transit, max_el)));
            }
            if el > max_el {
                max_el = el;
                transit = hi;
            }
            lo = hi;
        }
        Ok(None)
    }

    /// Narrow a horizon crossing between `lo` and `hi`.
    ///
    /// Returns the first bracketed time on the far side of the crossing:
    /// above the horizon for a rise, below it for a set.
    fn bisect(
        &self,
        observer: &Observer,
        mut lo: DateTime<Utc>,
        mut hi: DateTime<Utc>,
        rising: bool,
    ) -> Result<DateTime<Utc>> {
        while (hi - lo).num_milliseconds() > BISECT_RESOLUTION_MS {
            let mid = lo + (hi - lo) / 2;
            let above = self.elevation_deg(observer, mid)? >= HORIZON_DEG;
            if above == rising {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        Ok(hi)
    }
}

/// Predict up to `count` passes over `(lat, lon, alt_m)` starting at `now`.
pub fn predict_passes(
    set: &ElementSet,
    lat: f64,
    lon: f64,
    alt_m: f64,
    count: usize,
    now: DateTime<Utc>,
) -> Result<Vec<Pass>> {
    let predictor = Predictor::new(set)?;
    predictor.passes(&Observer { lat, lon, alt_m }, now, count)
}

/// Pull passes from `next_pass` until `count` longer than [`MIN_PASS_SECS`]
/// are kept. Short passes are dropped without counting, and the search
/// resumes just after each pass's set.
fn collect_passes<F>(from: DateTime<Utc>, count: usize, mut next_pass: F) -> Result<Vec<Pass>>
where
    F: FnMut(DateTime<Utc>) -> Result<Option<Pass>>,
{
    let mut passes = Vec::with_capacity(count);
    let mut t = from;

    while passes.len() < count {
        let Some(pass) = next_pass(t)? else {
            break;
        };
        if pass.duration_secs() > MIN_PASS_SECS {
            passes.push(pass);
        }
        t = pass.set + Duration::seconds(1);
    }

    Ok(passes)
}

fn gmst_radians(at: DateTime<Utc>) -> f64 {
    let unix = at.timestamp_millis() as f64 / 1000.0;
    let days = (unix - J2000_UNIX_SECS) / SECONDS_PER_DAY;
    let centuries = days / DAYS_PER_JULIAN_CENTURY;
    let deg = GMST_BASE_DEG
        + GMST_ROTATION_PER_DAY * days
        + GMST_CORRECTION * centuries * centuries
        - centuries * centuries * centuries / 38_710_000.0;
    deg.rem_euclid(360.0).to_radians()
}

/// Observer position (km, Earth-fixed) and local up unit vector.
fn observer_frame(observer: &Observer) -> ([f64; 3], [f64; 3]) {
    let lat = observer.lat.to_radians();
    let lon = observer.lon.to_radians();
    let h = observer.alt_m / 1000.0;
    let e2 = WGS84_F * (2.0 - WGS84_F);
    let (sin_lat, cos_lat) = lat.sin_cos();
    let (sin_lon, cos_lon) = lon.sin_cos();
    let n = WGS84_A_KM / (1.0 - e2 * sin_lat * sin_lat).sqrt();

    let site = [
        (n + h) * cos_lat * cos_lon,
        (n + h) * cos_lat * sin_lon,
        (n * (1.0 - e2) + h) * sin_lat,
    ];
    let up = [cos_lat * cos_lon, cos_lat * sin_lon, sin_lat];
    (site, up)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elements::tests::{ISS_LINE1, ISS_LINE2, ISS_NAME};
    use chrono::TimeZone;

    fn iss() -> ElementSet {
        let epoch = Utc.with_ymd_and_hms(2008, 9, 20, 12, 25, 40).unwrap();
        ElementSet {
            name: ISS_NAME.into(),
            line1: ISS_LINE1.into(),
            line2: ISS_LINE2.into(),
            valid_from: epoch,
            refreshed_at: epoch,
        }
    }

    fn london() -> Observer {
        Observer {
            lat: 51.5072,
            lon: -0.1276,
            alt_m: 100.0,
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2008, 9, 20, 13, 0, 0).unwrap()
    }

    #[test]
    fn test_epoch_from_elements() {
        let p = Predictor::new(&iss()).unwrap();
        let expected = Utc.with_ymd_and_hms(2008, 9, 20, 12, 25, 40).unwrap();
        assert!((p.epoch() - expected).num_seconds().abs() <= 1);
    }

    #[test]
    fn test_bad_elements() {
        let mut set = iss();
        set.line1 = "1 garbage".into();
        assert!(matches!(Predictor::new(&set), Err(SightingError::Elements(_))));
    }

    #[test]
    fn test_subpoint_within_inclination() {
        let p = Predictor::new(&iss()).unwrap();
        for m in (0..180).step_by(7) {
            let sp = p.subpoint(start() + Duration::minutes(m)).unwrap();
            assert!(sp.lat.abs() <= 52.5, "latitude {} beyond orbit inclination", sp.lat);
            assert!((-180.0..=180.0).contains(&sp.lon));
        }
    }

    #[test]
    fn test_gmst_at_j2000() {
        let j2000 = Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap();
        assert!((gmst_radians(j2000).to_degrees() - GMST_BASE_DEG).abs() < 1e-6);
    }

    #[test]
    fn test_passes_properties() {
        let p = Predictor::new(&iss()).unwrap();
        let obs = london();
        let now = start();
        let passes = p.passes(&obs, now, 10).unwrap();
        assert_eq!(passes.len(), 10);

        let mut prev = now;
        for pass in &passes {
            assert!(pass.rise > prev, "rise times must be after now and increasing");
            assert!(pass.set > pass.rise);
            assert!(pass.duration_secs() > MIN_PASS_SECS);
            assert!(pass.transit >= pass.rise && pass.transit <= pass.set);
            assert!(pass.max_elevation_deg >= HORIZON_DEG);
            prev = pass.rise;
        }
    }

    #[test]
    fn test_rise_is_horizon_crossing() {
        let p = Predictor::new(&iss()).unwrap();
        let obs = london();
        let pass = p.passes(&obs, start(), 1).unwrap()[0];
        assert!(p.elevation_deg(&obs, pass.rise).unwrap() >= HORIZON_DEG);
        assert!(p.elevation_deg(&obs, pass.rise - Duration::seconds(2)).unwrap() < HORIZON_DEG);
        assert!(p.elevation_deg(&obs, pass.transit).unwrap() >= HORIZON_DEG);
    }

    #[test]
    fn test_pass_in_progress_is_skipped() {
        let p = Predictor::new(&iss()).unwrap();
        let obs = london();
        let first = p.passes(&obs, start(), 1).unwrap()[0];
        let mid = first.rise + (first.set - first.rise) / 2;

        let next = p.passes(&obs, mid, 1).unwrap()[0];
        assert!(next.rise > first.set);
    }

    fn pass_at(rise: DateTime<Utc>, secs: i64) -> Pass {
        Pass {
            rise,
            transit: rise + Duration::seconds(secs / 2),
            set: rise + Duration::seconds(secs),
            max_elevation_deg: 12.0,
        }
    }

    #[test]
    fn test_short_passes_not_counted() {
        let t0 = start();
        let schedule = [
            pass_at(t0 + Duration::minutes(10), 45),
            pass_at(t0 + Duration::minutes(100), 300),
            pass_at(t0 + Duration::minutes(200), 60),
            pass_at(t0 + Duration::minutes(300), 61),
            pass_at(t0 + Duration::minutes(400), 240),
            pass_at(t0 + Duration::minutes(500), 400),
        ];
        let mut asked = Vec::new();

        let kept = collect_passes(t0, 3, |from| {
            asked.push(from);
            Ok(schedule.iter().copied().find(|p| p.rise >= from))
        })
        .unwrap();

        assert_eq!(kept, vec![schedule[1], schedule[3], schedule[4]]);
        // Each search resumed just past the previous set, short ones included.
        assert_eq!(asked.len(), 5);
        assert_eq!(asked[1], schedule[0].set + Duration::seconds(1));
        assert_eq!(asked[3], schedule[2].set + Duration::seconds(1));
    }

    #[test]
    fn test_short_passes_only_runs_out() {
        let t0 = start();
        let schedule = [
            pass_at(t0 + Duration::minutes(10), 30),
            pass_at(t0 + Duration::minutes(90), 60),
        ];
        let kept = collect_passes(t0, 5, |from| {
            Ok(schedule.iter().copied().find(|p| p.rise >= from))
        })
        .unwrap();
        assert!(kept.is_empty());
    }

    #[test]
    fn test_count_limits_results() {
        let p = Predictor::new(&iss()).unwrap();
        assert_eq!(p.passes(&london(), start(), 3).unwrap().len(), 3);
        assert!(p.passes(&london(), start(), 0).unwrap().is_empty());
    }

    #[test]
    fn test_predict_passes_helper() {
        let obs = london();
        let passes = predict_passes(&iss(), obs.lat, obs.lon, obs.alt_m, 2, start()).unwrap();
        assert_eq!(passes.len(), 2);
    }
}
