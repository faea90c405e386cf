use axum::http::StatusCode;
use axum::{Json, Router, routing::{get, post, put}};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};

use crate::itinerary::{ItinerarySession, SessionState, SessionStatus};
use crate::models::{NewTrip, NewUser, Trip, User};
use crate::render::strip_markdown;
use crate::storage::TripRepository;

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn TripRepository>,
    pub session: Arc<ItinerarySession>,
    pub prometheus: Option<PrometheusHandle>,
}

type ApiError = (StatusCode, String);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn internal(err: anyhow::Error) -> ApiError {
    tracing::error!(error = %err, "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".into())
}

fn not_found() -> ApiError {
    (StatusCode::NOT_FOUND, "not found".into())
}

// the change feeds only close when the server is shutting down
fn shutting_down() -> ApiError {
    (StatusCode::SERVICE_UNAVAILABLE, "shutting down".into())
}

/// Session state as exposed to clients: trip identity and history length
/// rather than the full conversation.
#[derive(Debug, Serialize)]
pub struct SessionView {
    pub status: SessionStatus,
    pub display_text: String,
    pub trip_id: Option<i64>,
    pub destination: Option<String>,
    pub history_len: usize,
    pub draft: String,
}

impl From<SessionState> for SessionView {
    fn from(state: SessionState) -> Self {
        Self {
            status: state.status,
            trip_id: state.active_trip.as_ref().map(|t| t.id),
            destination: state.active_trip.map(|t| t.destination),
            history_len: state.history.len(),
            display_text: state.display_text,
            draft: state.pending_user_message,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RegisterUserBody {
    name: String,
    email: String,
    password: String,
}

async fn register_user(
    axum::extract::State(state): axum::extract::State<AppState>,
    Json(body): Json<RegisterUserBody>,
) -> ApiResult<User> {
    let new_user = NewUser { name: body.name, email: body.email, password: body.password };
    new_user
        .validate()
        .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
    if state
        .repo
        .find_user_by_email(&new_user.email)
        .await
        .map_err(internal)?
        .is_some()
    {
        return Err((StatusCode::CONFLICT, "email already registered".into()));
    }
    let user = state.repo.insert_user(new_user).await.map_err(internal)?;
    Ok(Json(user))
}

async fn list_users(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> ApiResult<Vec<User>> {
    Ok(Json(state.repo.list_users().await.map_err(internal)?))
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    email: String,
    password: String,
}

async fn login(
    axum::extract::State(state): axum::extract::State<AppState>,
    Json(body): Json<LoginBody>,
) -> ApiResult<User> {
    let user = state
        .repo
        .find_user_by_email(&body.email)
        .await
        .map_err(internal)?;
    match user {
        Some(u) if u.password == body.password => Ok(Json(u)),
        _ => Err((StatusCode::UNAUTHORIZED, "invalid credentials".into())),
    }
}

async fn list_trips(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> ApiResult<Vec<Trip>> {
    Ok(Json(state.repo.list_trips().await.map_err(internal)?))
}

async fn create_trip(
    axum::extract::State(state): axum::extract::State<AppState>,
    Json(body): Json<NewTrip>,
) -> ApiResult<Trip> {
    body.validate()
        .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
    let trip = state.repo.insert_trip(body).await.map_err(internal)?;
    Ok(Json(trip))
}

async fn get_trip(
    axum::extract::State(state): axum::extract::State<AppState>,
    axum::extract::Path(id): axum::extract::Path<i64>,
) -> ApiResult<Trip> {
    state
        .repo
        .get_trip_by_id(id)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or_else(not_found)
}

async fn update_trip(
    axum::extract::State(state): axum::extract::State<AppState>,
    axum::extract::Path(id): axum::extract::Path<i64>,
    Json(body): Json<NewTrip>,
) -> ApiResult<Trip> {
    body.validate()
        .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
    let trip = Trip {
        id,
        destination: body.destination,
        category: body.category,
        start_date: body.start_date,
        end_date: body.end_date,
        budget: body.budget,
    };
    if state.repo.update_trip(&trip).await.map_err(internal)? {
        Ok(Json(trip))
    } else {
        Err(not_found())
    }
}

async fn delete_trip(
    axum::extract::State(state): axum::extract::State<AppState>,
    axum::extract::Path(id): axum::extract::Path<i64>,
) -> Result<StatusCode, ApiError> {
    if state.repo.delete_trip(id).await.map_err(internal)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found())
    }
}

/// Long-poll: answers with the trip list after the next store mutation.
async fn wait_trips_change(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> ApiResult<Vec<Trip>> {
    let mut rx = state.repo.watch_changes();
    rx.changed().await.map_err(|_| shutting_down())?;
    Ok(Json(state.repo.list_trips().await.map_err(internal)?))
}

async fn get_session(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Json<SessionView> {
    Json(state.session.snapshot().into())
}

/// Long-poll: answers with the session view after the next transition.
async fn wait_session_change(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<Json<SessionView>, ApiError> {
    let mut rx = state.session.subscribe();
    rx.changed().await.map_err(|_| shutting_down())?;
    let view: SessionView = rx.borrow().clone().into();
    Ok(Json(view))
}

async fn start_itinerary(
    axum::extract::State(state): axum::extract::State<AppState>,
    axum::extract::Path(id): axum::extract::Path<i64>,
) -> ApiResult<SessionView> {
    let trip = state
        .repo
        .get_trip_by_id(id)
        .await
        .map_err(internal)?
        .ok_or_else(not_found)?;
    state.session.start_for_trip(trip).await;
    Ok(Json(state.session.snapshot().into()))
}

async fn retry_itinerary(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Json<SessionView> {
    state.session.retry().await;
    Json(state.session.snapshot().into())
}

#[derive(Debug, Deserialize)]
struct DraftBody {
    text: String,
}

async fn update_draft(
    axum::extract::State(state): axum::extract::State<AppState>,
    Json(body): Json<DraftBody>,
) -> Json<SessionView> {
    state.session.update_draft_message(body.text);
    Json(state.session.snapshot().into())
}

async fn send_message(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Json<SessionView> {
    state.session.send_draft_message().await;
    Json(state.session.snapshot().into())
}

async fn reset_session(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Json<SessionView> {
    state.session.reset();
    Json(state.session.snapshot().into())
}

async fn export_itinerary(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<String, ApiError> {
    let snapshot = state.session.snapshot();
    if snapshot.status != SessionStatus::Ready {
        return Err((StatusCode::CONFLICT, "no itinerary ready to export".into()));
    }
    Ok(strip_markdown(&snapshot.display_text))
}

async fn metrics_endpoint(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<String, ApiError> {
    match state.prometheus {
        Some(handle) => Ok(handle.render()),
        None => Err((StatusCode::NOT_FOUND, "metrics disabled".into())),
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/users", post(register_user).get(list_users))
        .route("/v1/login", post(login))
        .route("/v1/trips", get(list_trips).post(create_trip))
        .route("/v1/trips/next", get(wait_trips_change))
        .route("/v1/trips/:id", get(get_trip).put(update_trip).delete(delete_trip))
        .route("/v1/trips/:id/itinerary", post(start_itinerary))
        .route("/v1/itinerary", get(get_session).delete(reset_session))
        .route("/v1/itinerary/next", get(wait_session_change))
        .route("/v1/itinerary/retry", post(retry_itinerary))
        .route("/v1/itinerary/draft", put(update_draft))
        .route("/v1/itinerary/message", post(send_message))
        .route("/v1/itinerary/export", get(export_itinerary))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
