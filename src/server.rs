//! Code to support server mode.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::QueryRejection, Query},
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tracing::{debug, error, info};

use crate::{
    cities::CountryCode,
    resolver::{PlaceLabel, ResolveError, Resolver},
};

/// The name we report from `/health`.
const SERVICE_NAME: &str = "reverse-geocoder";

/// An error message to serialize as JSON on error.
#[derive(Serialize)]
struct ErrorResponse {
    /// A human-readable error.
    error: String,
}

/// An error response, with the status code to send it with.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request<S: Into<String>>(message: S) -> ApiError {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<ResolveError> for ApiError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::InvalidRequest(message) => ApiError::bad_request(message),
            err @ ResolveError::Load(_) => {
                error!("lookup failed: {}", err);
                ApiError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: err.to_string(),
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

struct State {
    resolver: Arc<Resolver>,
    metrics: Option<PrometheusHandle>,
}

/// Build our HTTP routes.
pub fn router(resolver: Arc<Resolver>, metrics: Option<PrometheusHandle>) -> Router {
    let state = Arc::new(State { resolver, metrics });
    Router::new()
        .route("/api/reverse-geocode", get(handle_get_reverse_geocode))
        .route("/health", get(handle_get_health))
        .route("/metrics", get(handle_get_metrics))
        .fallback(handle_not_found)
        .layer(Extension(state))
}

// Run the server. Should not return.
pub async fn run_server(
    listen_addr: &str,
    resolver: Arc<Resolver>,
    metrics: Option<PrometheusHandle>,
) -> Result<()> {
    let app = router(resolver, metrics);

    let listen_addr = listen_addr.parse().with_context(|| {
        format!("could not parse listen address: {:?}", listen_addr)
    })?;

    info!("listening on {}", listen_addr);
    axum::Server::bind(&listen_addr)
        .serve(app.into_make_service())
        .await
        .context("web server failed to start")
}

/// Lookup methods. These are only here so older clients keep working. They
/// both use the same local gazetteer.
#[derive(Clone, Copy, Debug, Default, Display, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "snake_case")]
enum LookupMethod {
    #[default]
    Geonames,
    Hybrid,
}

/// Our /api/reverse-geocode query parameters.
///
/// We accept everything as strings so that we can report bad values
/// ourselves, in our own error format.
#[derive(Debug, Default, Deserialize)]
struct ReverseGeocodeParams {
    lat: Option<String>,
    lon: Option<String>,
    method: Option<String>,
    /// Comma-separated country codes to search instead of our defaults.
    countries: Option<String>,
    max_radius_km: Option<String>,
}

/// A validated /api/reverse-geocode request.
#[derive(Debug)]
struct ReverseGeocodeRequest {
    latitude: f64,
    longitude: f64,
    method: LookupMethod,
    countries: Option<Vec<CountryCode>>,
    max_radius_km: Option<f64>,
}

impl TryFrom<ReverseGeocodeParams> for ReverseGeocodeRequest {
    type Error = ApiError;

    fn try_from(params: ReverseGeocodeParams) -> Result<Self, ApiError> {
        let latitude = required_number("lat", params.lat.as_deref())?;
        let longitude = required_number("lon", params.lon.as_deref())?;
        let method = match params.method.as_deref() {
            None | Some("") => LookupMethod::default(),
            Some(method) => method.parse().map_err(|_| {
                ApiError::bad_request(format!(
                    "Invalid method {:?}: expected \"geonames\" or \"hybrid\"",
                    method
                ))
            })?,
        };
        let countries = match params.countries.as_deref() {
            None => None,
            Some(countries) => Some(
                CountryCode::parse_list(countries)
                    .map_err(|err| ApiError::bad_request(err.to_string()))?,
            ),
        };
        let max_radius_km = match params.max_radius_km.as_deref() {
            None => None,
            Some(radius) => Some(parse_number("max_radius_km", radius)?),
        };
        Ok(ReverseGeocodeRequest {
            latitude,
            longitude,
            method,
            countries,
            max_radius_km,
        })
    }
}

fn required_number(name: &str, value: Option<&str>) -> Result<f64, ApiError> {
    match value {
        Some(value) if !value.trim().is_empty() => parse_number(name, value),
        _ => Err(ApiError::bad_request(format!(
            "Missing required parameter: {}",
            name
        ))),
    }
}

fn parse_number(name: &str, value: &str) -> Result<f64, ApiError> {
    match value.trim().parse::<f64>() {
        Ok(number) if number.is_finite() => Ok(number),
        _ => Err(ApiError::bad_request(format!(
            "Invalid value for {}: {:?} is not a number",
            name, value
        ))),
    }
}

/// Our /api/reverse-geocode response format.
#[derive(Debug, Serialize)]
struct ReverseGeocodeResponse {
    /// `"<Name>, <CC>"`, or `"Unknown"`.
    location: String,
    /// The lookup method the caller asked for.
    method: String,
    /// The coordinates we were asked about.
    coordinates: Coordinates,
}

#[derive(Debug, Serialize)]
struct Coordinates {
    latitude: f64,
    longitude: f64,
}

/// Round to 6 decimal places, which is about 10cm.
fn round6(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

/// GET /api/reverse-geocode
async fn handle_get_reverse_geocode(
    Extension(state): Extension<Arc<State>>,
    params: Result<Query<ReverseGeocodeParams>, QueryRejection>,
) -> Result<Json<ReverseGeocodeResponse>, ApiError> {
    let Query(params) = params.map_err(|err| ApiError::bad_request(err.body_text()))?;
    let request = ReverseGeocodeRequest::try_from(params)?;

    let label = state
        .resolver
        .resolve(
            request.latitude,
            request.longitude,
            request.countries.as_deref(),
            request.max_radius_km,
        )
        .await?;
    if let PlaceLabel::Found { distance_km, .. } = &label {
        debug!("{:?} resolved to {} ({:.1} km)", request, label, distance_km);
    }

    Ok(Json(ReverseGeocodeResponse {
        location: label.to_string(),
        method: request.method.to_string(),
        coordinates: Coordinates {
            latitude: round6(request.latitude),
            longitude: round6(request.longitude),
        },
    }))
}

/// Our /health response format.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    timestamp: String,
}

/// GET /health
async fn handle_get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: SERVICE_NAME,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// GET /metrics
async fn handle_get_metrics(Extension(state): Extension<Arc<State>>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Anything else.
async fn handle_not_found(uri: Uri) -> Response {
    if uri.path().starts_with("/api/") {
        ApiError {
            status: StatusCode::NOT_FOUND,
            message: "Endpoint not found".to_owned(),
        }
        .into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

#[cfg(test)]
use crate::country_cache::{CountingSource, CountryCache};

#[cfg(test)]
fn test_router(default_countries: &str) -> Router {
    let cache = CountryCache::new(Box::new(CountingSource::default()));
    let default_countries = CountryCode::parse_list(default_countries).unwrap();
    let resolver = Resolver::new(cache, default_countries, 100.0);
    router(Arc::new(resolver), None)
}

/// Send a GET request to a router searching Germany by default, and return
/// the status and body.
#[cfg(test)]
async fn get_json(uri: &str) -> (StatusCode, serde_json::Value) {
    get_json_from(test_router("DE"), uri).await
}

#[cfg(test)]
async fn get_json_from(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    use tower::ServiceExt;

    let request = axum::http::Request::get(uri)
        .body(axum::body::Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

#[tokio::test]
async fn reverse_geocode_defaults_to_geonames() {
    let (status, body) = get_json("/api/reverse-geocode?lat=52.52&lon=13.405").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        serde_json::json!({
            "location": "Berlin, DE",
            "method": "geonames",
            "coordinates": { "latitude": 52.52, "longitude": 13.405 },
        })
    );
}

#[tokio::test]
async fn reverse_geocode_echoes_method() {
    let (status, body) =
        get_json("/api/reverse-geocode?lat=52.52&lon=13.405&method=hybrid").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["method"], "hybrid");
    assert_eq!(body["location"], "Berlin, DE");

    let (status, body) =
        get_json("/api/reverse-geocode?lat=52.52&lon=13.405&method=google").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn reverse_geocode_rounds_coordinates() {
    let (status, body) =
        get_json("/api/reverse-geocode?lat=52.123456789&lon=13.987654321").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["coordinates"]["latitude"], 52.123457);
    assert_eq!(body["coordinates"]["longitude"], 13.987654);
}

#[tokio::test]
async fn reverse_geocode_accepts_country_override() {
    let (status, body) =
        get_json("/api/reverse-geocode?lat=48.8566&lon=2.3522&countries=fr").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["location"], "Paris, FR");

    let (status, body) =
        get_json("/api/reverse-geocode?lat=48.8566&lon=2.3522&countries=France").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn reverse_geocode_reports_misses_as_unknown() {
    let (status, body) = get_json("/api/reverse-geocode?lat=30&lon=-40").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["location"], "Unknown");

    let (status, body) =
        get_json("/api/reverse-geocode?lat=52.0&lon=13.0&max_radius_km=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["location"], "Unknown");
}

#[tokio::test]
async fn reverse_geocode_rejects_bad_coordinates() {
    for uri in [
        "/api/reverse-geocode?lon=2.3522",
        "/api/reverse-geocode?lat=48.8566",
        "/api/reverse-geocode?lat=&lon=2.3522",
        "/api/reverse-geocode?lat=north&lon=2.3522",
        "/api/reverse-geocode?lat=NaN&lon=2.3522",
        "/api/reverse-geocode?lat=95&lon=2.3522",
        "/api/reverse-geocode?lat=48.8566&lon=2.3522&max_radius_km=far",
        "/api/reverse-geocode",
    ] {
        let (status, body) = get_json(uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
        assert!(body["error"].is_string(), "{}", uri);
    }
}

#[tokio::test]
async fn reverse_geocode_rejects_countries_without_data() {
    let (status, body) =
        get_json("/api/reverse-geocode?lat=52.52&lon=13.405&countries=ZZ").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("ZZ"));
}

#[tokio::test]
async fn reverse_geocode_reports_missing_default_data() {
    let (status, body) = get_json_from(
        test_router("ZZ"),
        "/api/reverse-geocode?lat=52.52&lon=13.405",
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("ZZ"));
}

#[tokio::test]
async fn health_reports_service_name() {
    let (status, body) = get_json("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "reverse-geocoder");
    let timestamp = body["timestamp"].as_str().unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
}

#[tokio::test]
async fn unknown_paths_are_not_found() {
    let (status, body) = get_json("/api/forward-geocode").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, serde_json::json!({ "error": "Endpoint not found" }));

    let (status, _) = get_json("/favicon.ico").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // We don't have a metrics recorder in tests.
    let (status, _) = get_json("/metrics").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
