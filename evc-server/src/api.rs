//! HTTP API
//!
//! Every route is reachable with and without a trailing slash. Failures are
//! returned as `{"detail": "<reason>"}` with a status derived from the
//! error's [`ErrorKind`].

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, MethodRouter},
    Json, Router,
};
use serde::Serialize;
use tracing::warn;

use evc_core::{CarId, ChargerId, ErrorKind, MessageBus, ReservationId, StationId};

use crate::admission::{
    ActivateRequest, ActivateResponse, AdmissionConfig, AdmissionController, AdmissionError,
};
use crate::clock::Clock;
use crate::model::*;
use crate::registry::Registry;
use crate::reservation::{ReservationError, ReservationRequest, ReservationScheduler};
use crate::store::{Store, StoreError};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub scheduler: Arc<ReservationScheduler>,
    pub admission: Arc<AdmissionController>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        bus: MessageBus,
        clock: Arc<dyn Clock>,
        config: AdmissionConfig,
    ) -> Self {
        Self {
            registry: Arc::new(Registry::new(store.clone())),
            scheduler: Arc::new(ReservationScheduler::new(store.clone(), clock.clone())),
            admission: Arc::new(AdmissionController::new(store, bus, clock).with_config(config)),
        }
    }
}

/// Error response
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    detail: &'a str,
}

impl ApiError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            status: status_for(kind),
            detail: detail.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Connectivity => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!("API: {} {}", self.status.as_u16(), self.detail);
        (self.status, Json(ErrorBody { detail: &self.detail })).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<AdmissionError> for ApiError {
    fn from(e: AdmissionError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<ReservationError> for ApiError {
    fn from(e: ReservationError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::new(ErrorKind::Validation, e.body_text())
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Build the router over the given state
pub fn router(state: AppState) -> Router {
    let routes = [
        ("/hello", get(hello)),
        ("/cars", post(create_car)),
        ("/cars/:id", get(get_car)),
        ("/stations", post(create_station)),
        ("/stations/:id", get(get_station)),
        ("/chargers", post(create_charger)),
        ("/chargers/:id", get(get_charger).patch(update_charger)),
        ("/chargers/:id/activate", post(activate)),
        ("/chargers/:id/deactivate", post(deactivate)),
        ("/reservations", post(create_reservation)),
        ("/reservations/:id", get(get_reservation)),
    ];

    routes
        .into_iter()
        .fold(Router::new(), |router, (path, handler)| with_slash(router, path, handler))
        .with_state(state)
}

fn with_slash(
    router: Router<AppState>,
    path: &str,
    handler: MethodRouter<AppState>,
) -> Router<AppState> {
    router
        .route(&format!("{}/", path), handler.clone())
        .route(path, handler)
}

async fn hello() -> Json<&'static str> {
    Json("hello")
}

async fn create_car(
    State(state): State<AppState>,
    body: Result<Json<NewCar>, JsonRejection>,
) -> ApiResult<CarView> {
    let Json(car) = body?;
    Ok(Json(state.registry.create_car(car)?))
}

async fn get_car(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<CarView> {
    Ok(Json(state.registry.car(&CarId(id))?))
}

async fn create_station(State(state): State<AppState>) -> Json<StationView> {
    Json(state.registry.create_station())
}

async fn get_station(
    State(state): State<AppState>,
    Path(id): Path<u32>,
) -> ApiResult<StationView> {
    Ok(Json(state.registry.station(StationId(id))?))
}

async fn create_charger(
    State(state): State<AppState>,
    body: Result<Json<NewCharger>, JsonRejection>,
) -> ApiResult<ChargerView> {
    let Json(charger) = body?;
    Ok(Json(state.registry.create_charger(charger)?))
}

async fn get_charger(
    State(state): State<AppState>,
    Path(id): Path<u32>,
) -> ApiResult<ChargerView> {
    Ok(Json(state.registry.charger(ChargerId(id))?))
}

async fn update_charger(
    State(state): State<AppState>,
    Path(id): Path<u32>,
    body: Result<Json<ChargerUpdate>, JsonRejection>,
) -> ApiResult<ChargerView> {
    let Json(update) = body?;
    Ok(Json(state.registry.update_charger(ChargerId(id), update)?))
}

async fn activate(
    State(state): State<AppState>,
    Path(id): Path<u32>,
    body: Result<Json<ActivateRequest>, JsonRejection>,
) -> ApiResult<ActivateResponse> {
    let Json(request) = body?;
    Ok(Json(state.admission.activate(ChargerId(id), request)?))
}

async fn deactivate(
    State(state): State<AppState>,
    Path(id): Path<u32>,
) -> Result<StatusCode, ApiError> {
    state.admission.deactivate(ChargerId(id))?;
    Ok(StatusCode::OK)
}

async fn create_reservation(
    State(state): State<AppState>,
    body: Result<Json<ReservationRequest>, JsonRejection>,
) -> ApiResult<Reservation> {
    let Json(request) = body?;
    Ok(Json(state.scheduler.create(request)?))
}

async fn get_reservation(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Reservation> {
    Ok(Json(state.scheduler.get(ReservationId(id))?))
}
