use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};
use crate::media::ImageImporter;
use crate::places::{PlaceDetailsSource, PlaceField, ReviewPayload};
use crate::reviews::{NewReview, ReviewRepository};
use crate::settings::SettingsStore;
use crate::telemetry::{ActivityEvent, TelemetryClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchTrigger {
    Manual,
    Scheduled,
}

impl FetchTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchTrigger::Manual => "manual",
            FetchTrigger::Scheduled => "scheduled",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchSummary {
    pub trigger: FetchTrigger,
    pub added: usize,
    pub skipped: usize,
    pub failed: usize,
    pub photos_attached: usize,
    pub photo_failures: usize,
}

impl FetchSummary {
    fn new(trigger: FetchTrigger) -> Self {
        Self {
            trigger,
            added: 0,
            skipped: 0,
            failed: 0,
            photos_attached: 0,
            photo_failures: 0,
        }
    }

    pub fn message(&self) -> String {
        format!("Successfully added {} new reviews", self.added)
    }
}

pub struct FetchPipelineOptions {
    pub min_interval: Duration,
    pub photo_delay: Duration,
}

/// Pulls reviews for the configured place and mirrors the unseen ones.
///
/// Runs are serialized: a second trigger waits for the first to finish and
/// then sees its `last_fetch_timestamp`, so it is throttled rather than
/// importing the same batch twice.
#[derive(Clone)]
pub struct FetchPipeline {
    settings: SettingsStore,
    places: Arc<dyn PlaceDetailsSource>,
    reviews: ReviewRepository,
    images: ImageImporter,
    telemetry: TelemetryClient,
    options: Arc<FetchPipelineOptions>,
    guard: Arc<AsyncMutex<()>>,
}

impl FetchPipeline {
    pub fn new(
        settings: SettingsStore,
        places: Arc<dyn PlaceDetailsSource>,
        reviews: ReviewRepository,
        images: ImageImporter,
        telemetry: TelemetryClient,
        options: FetchPipelineOptions,
    ) -> Self {
        Self {
            settings,
            places,
            reviews,
            images,
            telemetry,
            options: Arc::new(options),
            guard: Arc::new(AsyncMutex::new(())),
        }
    }

    pub async fn run(&self, trigger: FetchTrigger) -> AppResult<FetchSummary> {
        let _running = self.guard.lock().await;
        let outcome = self.run_locked(trigger).await;
        match &outcome {
            Ok(summary) => {
                info!(
                    target: "fetch",
                    trigger = trigger.as_str(),
                    added = summary.added,
                    skipped = summary.skipped,
                    failed = summary.failed,
                    photos = summary.photos_attached,
                    "review fetch completed"
                );
                self.telemetry.note(ActivityEvent::FetchCompleted {
                    trigger: trigger.as_str(),
                    added: summary.added,
                    skipped: summary.skipped,
                    failed: summary.failed,
                    photos_attached: summary.photos_attached,
                });
            }
            Err(err) => {
                warn!(target: "fetch", trigger = trigger.as_str(), kind = err.kind(), error = %err, "review fetch failed");
                self.telemetry.note(ActivityEvent::FetchFailed {
                    trigger: trigger.as_str(),
                    kind: err.kind(),
                    message: err.public_message(),
                });
            }
        }
        outcome
    }

    async fn run_locked(&self, trigger: FetchTrigger) -> AppResult<FetchSummary> {
        let settings = self.settings.load()?;

        if let Some(last) = settings.last_fetch_at() {
            let elapsed = Utc::now().signed_duration_since(last);
            if elapsed.num_seconds() < self.options.min_interval.as_secs() as i64 {
                return Err(AppError::Throttled(
                    "Please wait before fetching reviews again".into(),
                ));
            }
        }

        let api_key = match &settings.api_key {
            Some(key) if settings.has_credentials() => key,
            _ => return Err(AppError::Config("API credentials not configured".into())),
        };

        let envelope = self
            .places
            .place_details(&settings.place_id, PlaceField::Reviews, api_key)
            .await
            .map_err(|err| match err {
                AppError::Transport(message) => {
                    AppError::Transport(format!("Failed to fetch reviews: {message}"))
                }
                other => other,
            })?;

        if !envelope.is_ok() {
            warn!(
                target: "fetch",
                status = envelope.status.as_deref().unwrap_or("<missing>"),
                detail = envelope.error_message.as_deref().unwrap_or(""),
                "places API rejected the request"
            );
            return Err(AppError::UpstreamData("Invalid API response".into()));
        }

        let payloads = envelope.reviews().ok_or_else(|| {
            AppError::EmptyResult("No reviews found in the API response".into())
        })?;

        let mut summary = FetchSummary::new(trigger);
        for payload in &payloads {
            self.import_one(payload, &mut summary).await?;
        }

        self.settings.record_fetch(Utc::now())?;
        Ok(summary)
    }

    async fn import_one(&self, payload: &ReviewPayload, summary: &mut FetchSummary) -> AppResult<()> {
        let review = NewReview::from_payload(payload);
        if self.reviews.exists(&review.hash)? {
            debug!(target: "fetch", hash = %review.hash, "review already imported");
            summary.skipped += 1;
            return Ok(());
        }

        let review_id = match self.reviews.insert(&review) {
            Ok(Some(id)) => id,
            Ok(None) => {
                summary.skipped += 1;
                return Ok(());
            }
            Err(err) => {
                warn!(target: "fetch", hash = %review.hash, error = %err, "failed to store review");
                summary.failed += 1;
                return Ok(());
            }
        };
        summary.added += 1;

        let photo_url = payload
            .profile_photo_url
            .as_deref()
            .map(str::trim)
            .unwrap_or_default();
        if photo_url.is_empty() {
            return Ok(());
        }

        if !self.options.photo_delay.is_zero() {
            tokio::time::sleep(self.options.photo_delay).await;
        }
        match self.images.import_featured_image(review_id, photo_url).await {
            Ok(_) => summary.photos_attached += 1,
            Err(err) => {
                warn!(target: "fetch", review_id, error = %err, "profile photo import failed");
                summary.photo_failures += 1;
                self.telemetry.note(ActivityEvent::PhotoImportFailed {
                    review_id,
                    message: err.to_string(),
                });
            }
        }
        Ok(())
    }
}
