use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::errors::{AppError, AppResult};
use crate::places::{PlaceDetailsSource, PlaceField};
use crate::sanitize;
use crate::settings::SettingsStore;
use crate::telemetry::{ActivityEvent, TelemetryClient};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaceName {
    pub name: String,
}

/// Resolves a place id to its display name and caches the result in settings.
#[derive(Clone)]
pub struct PlaceLookup {
    settings: SettingsStore,
    places: Arc<dyn PlaceDetailsSource>,
    telemetry: TelemetryClient,
}

impl PlaceLookup {
    pub fn new(
        settings: SettingsStore,
        places: Arc<dyn PlaceDetailsSource>,
        telemetry: TelemetryClient,
    ) -> Self {
        Self {
            settings,
            places,
            telemetry,
        }
    }

    pub async fn lookup(&self, raw_place_id: &str) -> AppResult<PlaceName> {
        let place_id = sanitize::plain_text(raw_place_id);
        if place_id.is_empty() {
            return Err(AppError::Validation("Place ID is required".into()));
        }
        let api_key = self
            .settings
            .load()?
            .api_key
            .ok_or_else(|| AppError::Config("API key not configured".into()))?;

        let envelope = self
            .places
            .place_details(&place_id, PlaceField::Name, &api_key)
            .await
            .map_err(|err| match err {
                AppError::Transport(message) => {
                    AppError::Transport(format!("Failed to lookup place: {message}"))
                }
                AppError::UpstreamData(_) => invalid_place(),
                other => other,
            });

        let resolved = envelope.and_then(|envelope| {
            if !envelope.is_ok() {
                warn!(
                    target: "lookup",
                    status = envelope.status.as_deref().unwrap_or("<missing>"),
                    "place lookup rejected"
                );
                return Err(invalid_place());
            }
            envelope.place_name().ok_or_else(invalid_place)
        });

        self.telemetry.note(ActivityEvent::PlaceLookup {
            place_id: place_id.clone(),
            resolved: resolved.is_ok(),
        });
        let name = sanitize::plain_text(&resolved?);
        self.settings.cache_place_name(&name)?;
        info!(target: "lookup", place_id = %place_id, name = %name, "place name resolved");
        Ok(PlaceName { name })
    }
}

fn invalid_place() -> AppError {
    AppError::UpstreamData("Invalid place ID or API response".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db::bootstrap;
    use crate::places::PlaceDetailsEnvelope;
    use crate::secrets::SecretVault;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use secrecy::SecretString;
    use serde_json::{json, Value};
    use tempfile::{tempdir, TempDir};

    struct CannedSource(Value);

    #[async_trait]
    impl PlaceDetailsSource for CannedSource {
        async fn place_details(
            &self,
            place_id: &str,
            field: PlaceField,
            _api_key: &SecretString,
        ) -> AppResult<PlaceDetailsEnvelope> {
            assert_eq!(field, PlaceField::Name);
            assert_eq!(place_id, "ChIJ1");
            Ok(serde_json::from_value(self.0.clone())?)
        }
    }

    fn lookup_with(body: Value, with_key: bool) -> (TempDir, PlaceLookup, SettingsStore) {
        let dir = tempdir().unwrap();
        let ctx = bootstrap(dir.path(), "lookup.db").unwrap();
        let settings = SettingsStore::new(
            Arc::new(Mutex::new(ctx.connection)),
            SecretVault::in_memory(),
        );
        if with_key {
            settings
                .store_api_key(&SecretString::new("key".into()))
                .unwrap();
        }
        let telemetry = TelemetryClient::new(dir.path(), &AppConfig::default()).unwrap();
        let lookup = PlaceLookup::new(settings.clone(), Arc::new(CannedSource(body)), telemetry);
        (dir, lookup, settings)
    }

    #[tokio::test]
    async fn resolves_and_caches_name() {
        let (_dir, lookup, settings) =
            lookup_with(json!({ "status": "OK", "result": { "name": "Corner <b>Cafe</b>" } }), true);
        let place = lookup.lookup(" ChIJ1 ").await.unwrap();
        assert_eq!(place.name, "Corner Cafe");
        assert_eq!(
            settings.load().unwrap().cached_place_name.as_deref(),
            Some("Corner Cafe")
        );
    }

    #[tokio::test]
    async fn rejects_empty_id_and_missing_key() {
        let (_dir, lookup, _) = lookup_with(json!({}), false);
        let err = lookup.lookup("  <i></i> ").await.unwrap_err();
        assert_eq!(err.to_string(), "Place ID is required");
        let err = lookup.lookup("ChIJ1").await.unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[tokio::test]
    async fn non_ok_or_nameless_response_is_invalid() {
        for body in [
            json!({ "status": "INVALID_REQUEST" }),
            json!({ "status": "OK", "result": {} }),
        ] {
            let (_dir, lookup, settings) = lookup_with(body, true);
            let err = lookup.lookup("ChIJ1").await.unwrap_err();
            assert_eq!(err.to_string(), "Invalid place ID or API response");
            assert!(settings.load().unwrap().cached_place_name.is_none());
        }
    }
}
