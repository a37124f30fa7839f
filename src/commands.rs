use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::PublicAppConfig;
use crate::errors::{AppError, AppResult};
use crate::pipeline::FetchTrigger;
use crate::AppState;

pub const FETCH_REVIEWS_ACTION: &str = "fetch_google_reviews";
pub const LOOKUP_PLACE_ACTION: &str = "grf_lookup_place";
pub const FETCH_REVIEWS_NONCE: &str = "fetch_google_reviews_nonce";
pub const LOOKUP_PLACE_NONCE: &str = "grf_place_lookup_nonce";
pub const SAVE_SETTINGS_NONCE: &str = "save_settings";

/// Who is asking. Only `Admin` may run actions or change settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    Admin,
    Anonymous,
}

impl Caller {
    /// Compares digests rather than raw strings so the comparison time does
    /// not depend on how much of the token matched.
    pub fn from_token(state: &AppState, presented: Option<&str>) -> Self {
        let (Some(expected), Some(presented)) = (state.config().admin_token.as_ref(), presented)
        else {
            return Caller::Anonymous;
        };
        let expected = Sha256::digest(expected.expose_secret().as_bytes());
        let presented = Sha256::digest(presented.trim().as_bytes());
        if expected == presented {
            Caller::Admin
        } else {
            Caller::Anonymous
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Caller::Admin)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionRequest {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub place_id: Option<String>,
}

/// The `{ success, data }` envelope every action answers with.
#[derive(Debug, Clone, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    pub data: Value,
}

impl ActionResponse {
    pub fn success(data: Value) -> Self {
        Self {
            success: true,
            data,
        }
    }

    pub fn failure(err: &AppError) -> Self {
        Self {
            success: false,
            data: Value::String(err.public_message()),
        }
    }
}

pub type ActionHandler = for<'a> fn(&'a AppState, &'a ActionRequest) -> BoxFuture<'a, AppResult<Value>>;

pub struct ActionSpec {
    pub name: &'static str,
    pub nonce_action: &'static str,
    pub handler: ActionHandler,
}

pub const ACTIONS: &[ActionSpec] = &[
    ActionSpec {
        name: FETCH_REVIEWS_ACTION,
        nonce_action: FETCH_REVIEWS_NONCE,
        handler: fetch_reviews,
    },
    ActionSpec {
        name: LOOKUP_PLACE_ACTION,
        nonce_action: LOOKUP_PLACE_NONCE,
        handler: lookup_place,
    },
];

pub fn find_action(name: &str) -> Option<&'static ActionSpec> {
    ACTIONS.iter().find(|spec| spec.name == name)
}

/// Runs a named action after the anti-forgery and capability checks.
pub async fn dispatch(state: &AppState, caller: Caller, request: &ActionRequest) -> AppResult<Value> {
    let spec = find_action(request.action.trim())
        .ok_or_else(|| AppError::Validation(format!("Unknown action: {}", request.action.trim())))?;

    if !state.nonces().verify(spec.nonce_action, &request.nonce) {
        warn!(target: "commands", action = spec.name, "nonce check failed");
        return Err(AppError::Authorization("Security check failed".into()));
    }
    if !caller.is_admin() {
        warn!(target: "commands", action = spec.name, "caller lacks admin capability");
        return Err(AppError::Authorization("Unauthorized access".into()));
    }

    debug!(target: "commands", action = spec.name, "dispatching action");
    (spec.handler)(state, request).await
}

fn fetch_reviews<'a>(state: &'a AppState, _request: &'a ActionRequest) -> BoxFuture<'a, AppResult<Value>> {
    async move {
        let summary = state.pipeline().run(FetchTrigger::Manual).await?;
        Ok(Value::String(summary.message()))
    }
    .boxed()
}

fn lookup_place<'a>(state: &'a AppState, request: &'a ActionRequest) -> BoxFuture<'a, AppResult<Value>> {
    async move {
        let place_id = request.place_id.as_deref().unwrap_or_default();
        let place = state.lookup().lookup(place_id).await?;
        Ok(json!({ "name": place.name }))
    }
    .boxed()
}

/// Liveness answer for callers without the admin token.
#[derive(Debug, Serialize)]
pub struct ServiceStatus {
    pub status: &'static str,
    pub version: &'static str,
}

impl ServiceStatus {
    pub fn current() -> Self {
        Self {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Full operational profile. Carries filesystem paths, so only admins get it.
#[derive(Debug, Serialize)]
pub struct ServiceHealth {
    pub status: &'static str,
    pub version: &'static str,
    pub db_path: String,
    pub media_dir: String,
    pub telemetry_buffer_path: String,
    pub telemetry_queue_depth: usize,
    pub telemetry_enabled: bool,
    pub review_count: i64,
    pub has_api_key: bool,
    pub place_configured: bool,
    pub last_fetch_at: Option<String>,
    pub next_scheduled_fetch: Option<String>,
    pub nonce_salt_lifecycle: String,
    pub config: PublicAppConfig,
}

impl ServiceHealth {
    pub fn collect(state: &AppState) -> AppResult<Self> {
        let settings = state.settings().load()?;
        Ok(Self {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            db_path: state.db_path().to_string_lossy().to_string(),
            media_dir: state.images().media_dir().to_string_lossy().to_string(),
            telemetry_buffer_path: state
                .telemetry()
                .buffer_path()
                .to_string_lossy()
                .to_string(),
            telemetry_queue_depth: state.telemetry().queue_depth(),
            telemetry_enabled: state.telemetry().is_enabled(),
            review_count: state.reviews().count()?,
            has_api_key: settings.api_key.is_some(),
            place_configured: !settings.place_id.is_empty(),
            last_fetch_at: settings.last_fetch_at().map(|at| at.to_rfc3339()),
            next_scheduled_fetch: state.schedule().next_run().map(|at| at.to_rfc3339()),
            nonce_salt_lifecycle: state.nonce_salt_lifecycle().as_str().to_string(),
            config: state.config().public_profile(),
        })
    }
}
