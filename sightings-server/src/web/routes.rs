//! REST API route handlers.
//!
//! Coordinates arrive as `lat`/`lon` query parameters. Unparsable values are
//! rejected by the `Query` extractor with 400. Missing, non-finite or
//! out-of-range ones are a 400 where the endpoint needs them. `/hours` falls back to the caller's address.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use sightings_core::types::SightingError;

use crate::geoip::{client_ip, lookup};
use crate::orbit::ElementStore;
use crate::resolver::{Resolver, OBSERVER_ALT_M};
use crate::web::AppState;

const TRAIL_LEN: usize = 200;
const TRAIL_STEP_SECS: i64 = 10;
const DEFAULT_PASSES: i64 = 5;

// ---------------------------------------------------------------------------
// Query param types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct CoordParams {
    lat: Option<f64>,
    lon: Option<f64>,
}

#[derive(Deserialize)]
pub struct PassParams {
    lat: Option<f64>,
    lon: Option<f64>,
    alt: Option<f64>,
    n: Option<i64>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn clamp_i64(val: i64, min: i64, max: i64) -> i64 {
    val.max(min).min(max)
}

fn error(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (status, Json(json!({ "error": message.to_string() }))).into_response()
}

fn check_coords(lat: f64, lon: f64) -> Result<(f64, f64), Response> {
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(error(
            StatusCode::BAD_REQUEST,
            format!("coordinates out of range: lat={lat}, lon={lon}"),
        ));
    }
    Ok((lat, lon))
}

fn require_coords(lat: Option<f64>, lon: Option<f64>) -> Result<(f64, f64), Response> {
    match (lat, lon) {
        (Some(lat), Some(lon)) => check_coords(lat, lon),
        _ => Err(error(
            StatusCode::BAD_REQUEST,
            "lat and lon query parameters are required",
        )),
    }
}

fn prediction_error(e: SightingError) -> Response {
    match e {
        SightingError::NoElementSet => error(StatusCode::SERVICE_UNAVAILABLE, e),
        other => error(StatusCode::INTERNAL_SERVER_ERROR, other),
    }
}

// ---------------------------------------------------------------------------
// Marker + sightings
// ---------------------------------------------------------------------------

/// GET /marker: nearest observation point and its distance in km.
pub async fn api_marker(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CoordParams>,
) -> Response {
    let (lat, lon) = match require_coords(params.lat, params.lon) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    Json(state.resolver.nearest(lat, lon)).into_response()
}

/// GET /sightings: all persisted sightings of the nearest marker.
pub async fn api_sightings(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CoordParams>,
) -> Response {
    let (lat, lon) = match require_coords(params.lat, params.lon) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    match state.resolver.sightings(lat, lon).await {
        Ok((marker, sightings)) => Json(json!({
            "marker": marker,
            "sightings": sightings,
        }))
        .into_response(),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

// ---------------------------------------------------------------------------
// Next pass
// ---------------------------------------------------------------------------

/// GET /hours: hours until the next visible pass, `{h, source}`.
pub async fn api_hours(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    Query(params): Query<CoordParams>,
) -> Response {
    let (lat, lon) = match (params.lat, params.lon) {
        (Some(lat), Some(lon)) => match check_coords(lat, lon) {
            Ok(c) => c,
            Err(resp) => return resp,
        },
        _ => {
            let ip = client_ip(&headers, peer.map(|ConnectInfo(addr)| addr));
            let rec = lookup(state.geo.as_ref(), ip);
            (rec.lat, rec.lon)
        }
    };

    Json(state.resolver.next_pass_hours(lat, lon).await).into_response()
}

/// GET /geoip: approximate location of the caller.
pub async fn api_geoip(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> impl IntoResponse {
    let ip = client_ip(&headers, peer.map(|ConnectInfo(addr)| addr));
    Json(lookup(state.geo.as_ref(), ip))
}

// ---------------------------------------------------------------------------
// Satellite position + passes
// ---------------------------------------------------------------------------

/// Current sub-satellite point plus the trail leading up to it.
pub fn iss_position(elements: &ElementStore, now: DateTime<Utc>) -> Result<Value, SightingError> {
    let trail = elements.trail(now, TRAIL_LEN, chrono::Duration::seconds(TRAIL_STEP_SECS))?;
    let current = trail.last().copied().ok_or(SightingError::NoElementSet)?;

    Ok(json!({
        "timestamp": now.to_rfc3339(),
        "lat": current.lat,
        "lon": current.lon,
        "trail": trail,
    }))
}

/// GET /iss: where the satellite is now.
pub async fn api_iss(State(state): State<Arc<AppState>>) -> Response {
    match iss_position(state.resolver.elements(), Utc::now()) {
        Ok(body) => Json(body).into_response(),
        Err(e) => prediction_error(e),
    }
}

/// Pass listing in the request/response envelope clients expect.
pub async fn pass_listing(
    resolver: &Resolver,
    lat: f64,
    lon: f64,
    alt: f64,
    n: i64,
    now: DateTime<Utc>,
) -> Result<Value, SightingError> {
    let passes = resolver.predict(lat, lon, alt, n as usize, now).await?;
    let response: Vec<Value> = passes
        .iter()
        .map(|p| json!({"risetime": p.rise.timestamp(), "duration": p.duration_secs()}))
        .collect();

    Ok(json!({
        "request": {
            "datetime": now.timestamp(),
            "latitude": lat,
            "longitude": lon,
            "altitude": alt,
            "passes": n,
        },
        "response": response,
    }))
}

/// GET /passes: upcoming predicted passes.
pub async fn api_passes(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PassParams>,
) -> Response {
    let (lat, lon) = match require_coords(params.lat, params.lon) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let alt = params.alt.unwrap_or(OBSERVER_ALT_M);
    if !alt.is_finite() {
        return error(StatusCode::BAD_REQUEST, format!("bad altitude: {alt}"));
    }
    let n = clamp_i64(params.n.unwrap_or(DEFAULT_PASSES), 1, 100);

    match pass_listing(&state.resolver, lat, lon, alt, n, Utc::now()).await {
        Ok(body) => Json(body).into_response(),
        Err(e) => prediction_error(e),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
