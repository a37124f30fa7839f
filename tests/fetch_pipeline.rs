use chrono::{Duration, Utc};
use httptest::matchers::{all_of, contains, request, url_decoded};
use httptest::responders::{json_encoded, status_code};
use httptest::{Expectation, Server};
use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};

use review_mirror_lib::config::{AppConfig, SecretBackendKind};
use review_mirror_lib::secrets::SecretVault;
use review_mirror_lib::settings::UpdateSettingsPayload;
use review_mirror_lib::{AppError, AppState, FetchTrigger};

const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR\x00\x00\x00\x01\x00\x00\x00\x01";

fn state_for(server: &Server) -> (TempDir, AppState) {
    let dir = tempdir().unwrap();
    let config = AppConfig {
        data_dir: dir.path().to_path_buf(),
        places_api_base: server.url_str("/maps/api/place"),
        photo_import_delay_ms: 0,
        scheduler_enabled: false,
        secret_backend: SecretBackendKind::Memory,
        ..AppConfig::default()
    };
    let state = AppState::build(config, SecretVault::in_memory()).unwrap();
    state
        .settings()
        .apply(UpdateSettingsPayload {
            api_key: Some("test-key".into()),
            place_id: Some("ChIJ1".into()),
            update_frequency_days: None,
        })
        .unwrap();
    (dir, state)
}

macro_rules! details_request {
    () => {
        all_of![
            request::method_path("GET", "/maps/api/place/details/json"),
            request::query(url_decoded(contains(("fields", "reviews")))),
            request::query(url_decoded(contains(("place_id", "ChIJ1")))),
            request::query(url_decoded(contains(("key", "test-key")))),
        ]
    };
}

fn reviews_body(server: &Server) -> Value {
    json!({
        "status": "OK",
        "result": {
            "reviews": [
                {
                    "author_name": "Alice",
                    "author_url": "https://maps.google.com/alice",
                    "language": "en",
                    "profile_photo_url": server.url_str("/photos/alice.png"),
                    "rating": 5,
                    "relative_time_description": "a week ago",
                    "text": "<p>Great <b>coffee</b></p><script>x()</script>",
                    "time": 1_600_000_000
                },
                {
                    "author_name": "Bob",
                    "profile_photo_url": server.url_str("/photos/missing.png"),
                    "rating": 3.7,
                    "text": "Fine.",
                    "time": 1_600_000_500
                }
            ]
        }
    })
}

#[tokio::test]
async fn imports_two_reviews_then_deduplicates() {
    let server = Server::run();
    server.expect(
        Expectation::matching(details_request!())
            .times(2)
            .respond_with(json_encoded(reviews_body(&server))),
    );
    server.expect(
        Expectation::matching(request::method_path("GET", "/photos/alice.png"))
            .respond_with(status_code(200).body(PNG_BYTES)),
    );
    server.expect(
        Expectation::matching(request::method_path("GET", "/photos/missing.png"))
            .respond_with(status_code(404)),
    );

    let (_dir, state) = state_for(&server);
    let summary = state.pipeline().run(FetchTrigger::Manual).await.unwrap();
    assert_eq!(summary.added, 2);
    assert_eq!(summary.photos_attached, 1);
    assert_eq!(summary.photo_failures, 1);
    assert_eq!(summary.message(), "Successfully added 2 new reviews");

    let listed = state.reviews().list(10).unwrap();
    assert_eq!(listed.len(), 2);
    let alice = listed.iter().find(|r| r.title == "Alice").unwrap();
    let record = state.reviews().get(alice.id).unwrap().unwrap();
    assert_eq!(record.body, "<p>Great <b>coffee</b></p>");
    assert_eq!(record.meta_value("rating_stars"), "★★★★★");
    assert_eq!(record.meta_value("review_date"), "2020-09-13 12:26:40");
    let asset = state
        .images()
        .asset(record.featured_media_id.unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(asset.mime_type, "image/png");
    assert!(state.images().media_dir().join(&asset.file_name).exists());

    let bob = listed.iter().find(|r| r.title == "Bob").unwrap();
    assert!(bob.featured_media_id.is_none());
    assert_eq!(bob.rating_stars, "★★★☆☆");

    let err = state.pipeline().run(FetchTrigger::Manual).await.unwrap_err();
    assert!(matches!(err, AppError::Throttled(_)));

    state
        .settings()
        .record_fetch(Utc::now() - Duration::minutes(10))
        .unwrap();
    let summary = state.pipeline().run(FetchTrigger::Scheduled).await.unwrap();
    assert_eq!(summary.added, 0);
    assert_eq!(summary.skipped, 2);
    assert_eq!(state.reviews().count().unwrap(), 2);
}

#[tokio::test]
async fn denied_request_creates_nothing() {
    let server = Server::run();
    server.expect(
        Expectation::matching(details_request!()).respond_with(json_encoded(json!({
            "status": "REQUEST_DENIED",
            "error_message": "The provided API key is invalid."
        }))),
    );

    let (_dir, state) = state_for(&server);
    let err = state.pipeline().run(FetchTrigger::Manual).await.unwrap_err();
    assert!(matches!(err, AppError::UpstreamData(_)));
    assert_eq!(err.to_string(), "Invalid API response");
    assert_eq!(state.reviews().count().unwrap(), 0);
    assert_eq!(state.settings().load().unwrap().last_fetch_timestamp, 0);
}

#[tokio::test]
async fn malformed_photo_url_still_creates_record() {
    let server = Server::run();
    server.expect(
        Expectation::matching(details_request!()).respond_with(json_encoded(json!({
            "status": "OK",
            "result": {
                "reviews": [
                    { "author_name": "Cara", "profile_photo_url": "javascript:alert(1)", "rating": 4, "time": 1_650_000_000 }
                ]
            }
        }))),
    );

    let (_dir, state) = state_for(&server);
    let summary = state.pipeline().run(FetchTrigger::Manual).await.unwrap();
    assert_eq!(summary.added, 1);
    assert_eq!(summary.photo_failures, 1);

    let listed = state.reviews().list(10).unwrap();
    let record = state.reviews().get(listed[0].id).unwrap().unwrap();
    assert!(record.featured_media_id.is_none());
    assert_eq!(record.meta_value("profile_photo_url"), "");
}

#[tokio::test]
async fn transport_failure_is_reported() {
    let server = Server::run();
    server.expect(
        Expectation::matching(details_request!()).respond_with(status_code(200).body("not json")),
    );

    let (_dir, state) = state_for(&server);
    let err = state.pipeline().run(FetchTrigger::Manual).await.unwrap_err();
    assert!(matches!(err, AppError::UpstreamData(_)));

    let dir = tempdir().unwrap();
    let config = AppConfig {
        data_dir: dir.path().to_path_buf(),
        places_api_base: "http://127.0.0.1:9/maps/api/place".into(),
        http_timeout_secs: 2,
        secret_backend: SecretBackendKind::Memory,
        ..AppConfig::default()
    };
    let offline = AppState::build(config, SecretVault::in_memory()).unwrap();
    offline
        .settings()
        .apply(UpdateSettingsPayload {
            api_key: Some("k".into()),
            place_id: Some("p".into()),
            update_frequency_days: None,
        })
        .unwrap();
    let err = offline.pipeline().run(FetchTrigger::Manual).await.unwrap_err();
    assert!(matches!(err, AppError::Transport(_)));
    assert!(err.to_string().starts_with("Failed to fetch reviews: "));
}

#[tokio::test]
async fn missing_credentials_fail_before_network() {
    let server = Server::run();
    let dir = tempdir().unwrap();
    let config = AppConfig {
        data_dir: dir.path().to_path_buf(),
        places_api_base: server.url_str("/maps/api/place"),
        secret_backend: SecretBackendKind::Memory,
        ..AppConfig::default()
    };
    let state = AppState::build(config, SecretVault::in_memory()).unwrap();
    let err = state.pipeline().run(FetchTrigger::Manual).await.unwrap_err();
    assert_eq!(err.to_string(), "API credentials not configured");
}

#[tokio::test]
async fn hostile_markup_is_neutralised_and_plain_text_kept() {
    let server = Server::run();
    server.expect(
        Expectation::matching(details_request!()).respond_with(json_encoded(json!({
            "status": "OK",
            "result": {
                "reviews": [
                    {
                        "author_name": "Mallory",
                        "rating": "4",
                        "text": "Nice place <img src=x onerror=alert(document.cookie)//\"> really",
                        "time": 1_700_000_000
                    },
                    {
                        "author_name": null,
                        "rating": 5,
                        "text": "Best coffee in town <3",
                        "time": 1_700_000_100
                    }
                ]
            }
        }))),
    );

    let (_dir, state) = state_for(&server);
    let summary = state.pipeline().run(FetchTrigger::Manual).await.unwrap();
    assert_eq!(summary.added, 2);

    let listed = state.reviews().list(10).unwrap();
    let mallory = listed.iter().find(|r| r.title == "Mallory").unwrap();
    let record = state.reviews().get(mallory.id).unwrap().unwrap();
    assert!(!record.body.contains("onerror"));
    assert!(record.body.ends_with("really"));
    assert_eq!(record.meta_value("rating"), "4");

    let anonymous = listed.iter().find(|r| r.title.is_empty()).unwrap();
    let record = state.reviews().get(anonymous.id).unwrap().unwrap();
    assert_eq!(record.body, "Best coffee in town &lt;3");
}
