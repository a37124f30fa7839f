use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE, COOKIE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::Deserialize;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::commands::{
    dispatch, ActionRequest, ActionResponse, Caller, ServiceHealth, ServiceStatus,
    FETCH_REVIEWS_NONCE, LOOKUP_PLACE_NONCE, SAVE_SETTINGS_NONCE,
};
use crate::errors::AppError;
use crate::settings::UpdateSettingsPayload;
use crate::telemetry::ActivityEvent;
use crate::views::{self, SettingsView};
use crate::AppState;

pub const ADMIN_COOKIE: &str = "review_mirror_admin";
const REVIEW_LIST_LIMIT: usize = 200;
const ADMIN_SCRIPT: &str = include_str!("../assets/admin.js");

type SharedState = Arc<AppState>;

pub fn router(state: SharedState) -> Router {
    let media = ServeDir::new(state.images().media_dir());
    Router::new()
        .route("/health", get(health))
        .route("/admin", get(settings_page))
        .route("/admin/settings", post(save_settings))
        .route("/admin/ajax", post(run_action))
        .route("/admin/reviews", get(review_list))
        .route("/admin/reviews/{id}", get(review_details))
        .route("/admin/assets/admin.js", get(admin_script))
        .nest_service("/media", media)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub fn status_for(err: &AppError) -> StatusCode {
    match err {
        AppError::Authorization(_) => StatusCode::FORBIDDEN,
        AppError::Throttled(_) => StatusCode::TOO_MANY_REQUESTS,
        AppError::Transport(_) | AppError::UpstreamData(_) | AppError::ImageImport(_) => {
            StatusCode::BAD_GATEWAY
        }
        AppError::EmptyResult(_) => StatusCode::NOT_FOUND,
        AppError::Validation(_) => StatusCode::BAD_REQUEST,
        AppError::Config(_) => StatusCode::PRECONDITION_FAILED,
        AppError::Path(_)
        | AppError::Io(_)
        | AppError::Database(_)
        | AppError::Keychain(_)
        | AppError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Admin token from `Authorization: Bearer …` or the admin cookie.
pub fn presented_token(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string());
    if bearer.is_some() {
        return bearer;
    }
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == ADMIN_COOKIE)
        .map(|(_, token)| token.trim().to_string())
}

fn caller(state: &AppState, headers: &HeaderMap) -> Caller {
    Caller::from_token(state, presented_token(headers).as_deref())
}

/// HTML-side failure; JSON endpoints build their envelope instead.
struct PageError(AppError);

impl From<AppError> for PageError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl IntoResponse for PageError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!(target: "admin", error = %self.0, "admin page failed");
        }
        let title = status.canonical_reason().unwrap_or("Error");
        (status, Html(views::error_page(title, &self.0.public_message()))).into_response()
    }
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), PageError> {
    if caller(state, headers).is_admin() {
        Ok(())
    } else {
        Err(AppError::Authorization("Unauthorized access".into()).into())
    }
}

#[derive(Debug, Default, Deserialize)]
struct PageQuery {
    #[serde(default)]
    updated: Option<String>,
}

async fn settings_page(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Result<Html<String>, PageError> {
    require_admin(&state, &headers)?;
    let settings = state.settings().load()?.public_profile();
    let nonces = state.nonces();
    Ok(Html(views::settings_page(&SettingsView {
        settings: &settings,
        next_run: state.schedule().next_run(),
        save_nonce: nonces.create(SAVE_SETTINGS_NONCE),
        fetch_nonce: nonces.create(FETCH_REVIEWS_NONCE),
        lookup_nonce: nonces.create(LOOKUP_PLACE_NONCE),
        notice: query.updated.as_ref().map(|_| "Settings saved."),
    })))
}

#[derive(Debug, Default, Deserialize)]
struct SettingsForm {
    #[serde(default)]
    nonce: String,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    place_id: Option<String>,
    #[serde(default)]
    update_frequency_days: Option<String>,
}

async fn save_settings(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Form(form): Form<SettingsForm>,
) -> Result<Redirect, PageError> {
    if !state.nonces().verify(SAVE_SETTINGS_NONCE, &form.nonce) {
        return Err(AppError::Authorization("Security check failed".into()).into());
    }
    require_admin(&state, &headers)?;

    let api_key_changed = form
        .api_key
        .as_deref()
        .map(|key| !key.trim().is_empty())
        .unwrap_or(false);
    state.settings().apply(UpdateSettingsPayload {
        api_key: form.api_key,
        place_id: form.place_id,
        update_frequency_days: form.update_frequency_days,
    })?;
    state
        .telemetry()
        .note(ActivityEvent::SettingsSaved { api_key_changed });
    state.schedule().reschedule();
    info!(target: "admin", api_key_changed, "settings saved from admin form");
    Ok(Redirect::to("/admin?updated=1"))
}

async fn run_action(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Form(request): Form<ActionRequest>,
) -> (StatusCode, Json<ActionResponse>) {
    let who = caller(&state, &headers);
    match dispatch(&state, who, &request).await {
        Ok(data) => (StatusCode::OK, Json(ActionResponse::success(data))),
        Err(err) => {
            let status = status_for(&err);
            if status.is_server_error() && !matches!(status, StatusCode::BAD_GATEWAY) {
                error!(target: "admin", action = %request.action, error = %err, "action failed");
            }
            (status, Json(ActionResponse::failure(&err)))
        }
    }
}

async fn review_list(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Html<String>, PageError> {
    require_admin(&state, &headers)?;
    let reviews = state.reviews().list(REVIEW_LIST_LIMIT)?;
    let total = state.reviews().count()?;
    Ok(Html(views::reviews_page(&reviews, total)))
}

async fn review_details(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Html<String>, PageError> {
    require_admin(&state, &headers)?;
    let review = state
        .reviews()
        .get(id)?
        .ok_or_else(|| AppError::EmptyResult(format!("Review {id} not found")))?;
    let photo = match review.featured_media_id {
        Some(media_id) => state.images().asset(media_id)?,
        None => None,
    };
    Ok(Html(views::review_details(&review, photo.as_ref())))
}

async fn admin_script() -> impl IntoResponse {
    (
        [
            (CONTENT_TYPE, "application/javascript; charset=utf-8"),
            (CACHE_CONTROL, "no-cache"),
        ],
        ADMIN_SCRIPT,
    )
}

async fn health(State(state): State<SharedState>, headers: HeaderMap) -> Result<Response, PageError> {
    if !caller(&state, &headers).is_admin() {
        return Ok(Json(ServiceStatus::current()).into_response());
    }
    Ok(Json(ServiceHealth::collect(&state)?).into_response())
}
