pub mod admin;
pub mod commands;
pub mod config;
pub mod db;
pub mod errors;
pub mod lookup;
pub mod media;
pub mod nonce;
pub mod pipeline;
pub mod places;
pub mod reviews;
pub mod sanitize;
pub mod scheduler;
pub mod secrets;
pub mod settings;
pub mod telemetry;
pub mod views;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use secrecy::ExposeSecret;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::AppConfig;
use crate::db::{bootstrap, DatabaseContext};
use crate::errors::AppResult;
use crate::lookup::PlaceLookup;
use crate::media::ImageImporter;
use crate::nonce::NonceIssuer;
use crate::pipeline::{FetchPipeline, FetchPipelineOptions};
use crate::places::{HttpPlacesClient, PlaceDetailsSource};
use crate::reviews::ReviewRepository;
use crate::scheduler::ScheduleHandle;
use crate::secrets::{SecretLifecycle, SecretVault};
use crate::settings::SettingsStore;
use crate::telemetry::TelemetryClient;

pub use crate::commands::{dispatch, ActionRequest, ActionResponse, Caller, ServiceHealth};
pub use crate::errors::AppError;
pub use crate::pipeline::{FetchSummary, FetchTrigger};

const VAULT_SERVICE_NAME: &str = "ReviewMirror";

/// Tracing targets the service modules log under, raised to `debug` by default.
const SERVICE_LOG_TARGETS: &[&str] = &[
    "admin",
    "bootstrap",
    "commands",
    "database_bootstrap",
    "fetch",
    "lookup",
    "media",
    "places",
    "scheduler",
    "secret_vault",
    "settings",
    "telemetry",
];

/// Every long-lived service object, built once at startup and shared by the
/// router and the scheduler.
pub struct AppState {
    db_path: PathBuf,
    config: AppConfig,
    settings: SettingsStore,
    reviews: ReviewRepository,
    images: ImageImporter,
    pipeline: FetchPipeline,
    lookup: PlaceLookup,
    nonces: NonceIssuer,
    telemetry: TelemetryClient,
    schedule: ScheduleHandle,
    nonce_salt_lifecycle: SecretLifecycle,
}

impl AppState {
    pub fn initialize() -> AppResult<Self> {
        init_tracing();
        let config = AppConfig::from_env();
        let vault = SecretVault::for_backend(config.secret_backend, VAULT_SERVICE_NAME);
        Self::build(config, vault)
    }

    pub fn build(config: AppConfig, vault: SecretVault) -> AppResult<Self> {
        let places = HttpPlacesClient::shared(&config)?;
        Self::build_with_source(config, vault, places)
    }

    pub fn build_with_source(
        config: AppConfig,
        vault: SecretVault,
        places: Arc<dyn PlaceDetailsSource>,
    ) -> AppResult<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let DatabaseContext { connection, path } =
            bootstrap(&config.data_dir, &config.database_file_name)?;
        let db = Arc::new(Mutex::new(connection));

        let telemetry = TelemetryClient::new(&config.data_dir, &config)?;
        let settings = SettingsStore::new(Arc::clone(&db), vault.clone());
        if let Some(seed) = &config.google_places_api_key {
            if settings.load()?.api_key.is_none() && !seed.expose_secret().trim().is_empty() {
                settings.store_api_key(seed)?;
                info!(target: "bootstrap", "seeded places API key from environment");
            }
        }

        let (nonces, nonce_salt_lifecycle) = NonceIssuer::from_vault(&vault)?;

        let reviews = ReviewRepository::new(Arc::clone(&db));
        let images = ImageImporter::new(&config, Arc::clone(&db), reviews.clone())?;
        let pipeline = FetchPipeline::new(
            settings.clone(),
            Arc::clone(&places),
            reviews.clone(),
            images.clone(),
            telemetry.clone(),
            FetchPipelineOptions {
                min_interval: Duration::from_secs(config.min_fetch_interval_secs),
                photo_delay: Duration::from_millis(config.photo_import_delay_ms),
            },
        );
        let lookup = PlaceLookup::new(settings.clone(), places, telemetry.clone());

        info!(
            target: "bootstrap",
            db = %path.display(),
            media = %images.media_dir().display(),
            nonce_salt = nonce_salt_lifecycle.as_str(),
            "service state ready"
        );

        Ok(Self {
            db_path: path,
            config,
            settings,
            reviews,
            images,
            pipeline,
            lookup,
            nonces,
            telemetry,
            schedule: ScheduleHandle::default(),
            nonce_salt_lifecycle,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn reviews(&self) -> &ReviewRepository {
        &self.reviews
    }

    pub fn images(&self) -> &ImageImporter {
        &self.images
    }

    pub fn pipeline(&self) -> &FetchPipeline {
        &self.pipeline
    }

    pub fn lookup(&self) -> &PlaceLookup {
        &self.lookup
    }

    pub fn nonces(&self) -> &NonceIssuer {
        &self.nonces
    }

    pub fn telemetry(&self) -> &TelemetryClient {
        &self.telemetry
    }

    pub fn schedule(&self) -> &ScheduleHandle {
        &self.schedule
    }

    pub fn nonce_salt_lifecycle(&self) -> SecretLifecycle {
        self.nonce_salt_lifecycle
    }

    /// Starts the background fetch loop when enabled in configuration.
    pub fn spawn_scheduler(&self) -> Option<tokio::task::JoinHandle<()>> {
        if !self.config.scheduler_enabled {
            warn!(target: "scheduler", "scheduler disabled by configuration");
            return None;
        }
        Some(scheduler::spawn(
            self.pipeline.clone(),
            self.settings.clone(),
            self.schedule.clone(),
        ))
    }

    pub fn spawn_telemetry_flush(&self) -> tokio::task::JoinHandle<()> {
        self.telemetry
            .spawn_flusher(Duration::from_secs(self.config.telemetry_flush_interval_secs))
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_log_filter()));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}

fn default_log_filter() -> String {
    let mut directives = vec![
        "info".to_string(),
        "review_mirror=debug".to_string(),
        "review_mirror_lib=debug".to_string(),
    ];
    directives.extend(SERVICE_LOG_TARGETS.iter().map(|target| format!("{target}=debug")));
    directives.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_raises_service_targets() {
        let filter = default_log_filter();
        for target in ["fetch", "media", "lookup", "places", "commands"] {
            assert!(filter.contains(&format!("{target}=debug")), "{target} missing");
        }
        assert!(EnvFilter::try_new(&filter).is_ok());
    }
}
