use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

pub const STATUS_OK: &str = "OK";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceField {
    Reviews,
    Name,
}

impl PlaceField {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaceField::Reviews => "reviews",
            PlaceField::Name => "name",
        }
    }
}

/// Top level of a place details response. Everything is optional because
/// error responses omit `result` and malformed ones may omit `status`.
#[derive(Debug, Default, Deserialize)]
pub struct PlaceDetailsEnvelope {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub result: Option<PlaceResult>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PlaceResult {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub reviews: Option<Vec<Value>>,
}

/// One review as the API sent it. Fields tolerate `null` and ratings may
/// arrive as numeric strings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReviewPayload {
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub author_url: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub profile_photo_url: Option<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub rating: Option<f64>,
    #[serde(default)]
    pub relative_time_description: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub time: i64,
}

fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(raw)) => raw.trim().parse::<f64>().ok(),
        _ => None,
    })
}

impl ReviewPayload {
    pub fn author(&self) -> &str {
        self.author_name.as_deref().unwrap_or_default()
    }
}

impl PlaceDetailsEnvelope {
    pub fn is_ok(&self) -> bool {
        self.status.as_deref() == Some(STATUS_OK)
    }

    /// Decodes each review independently so one odd entry does not sink the
    /// whole batch. Returns `None` when the response has no reviews array.
    pub fn reviews(&self) -> Option<Vec<ReviewPayload>> {
        let raw = self.result.as_ref()?.reviews.as_ref()?;
        let parsed = raw
            .iter()
            .enumerate()
            .filter_map(|(idx, value)| {
                match serde_json::from_value::<ReviewPayload>(value.clone()) {
                    Ok(review) => Some(review),
                    Err(err) => {
                        warn!(target: "places", index = idx, error = %err, "skipping malformed review entry");
                        None
                    }
                }
            })
            .collect();
        Some(parsed)
    }

    pub fn place_name(&self) -> Option<String> {
        self.result
            .as_ref()
            .and_then(|result| result.name.clone())
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
    }
}

#[async_trait]
pub trait PlaceDetailsSource: Send + Sync {
    /// Transport and decoding failures are errors; a non-OK `status` is not,
    /// callers decide what that means for them.
    async fn place_details(
        &self,
        place_id: &str,
        field: PlaceField,
        api_key: &SecretString,
    ) -> AppResult<PlaceDetailsEnvelope>;
}

pub struct HttpPlacesClient {
    http: Client,
    base_url: String,
}

impl HttpPlacesClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(concat!("review-mirror/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .https_only(config.places_api_base.starts_with("https://"))
            .build()?;
        Ok(Self {
            http,
            base_url: config.places_api_base.trim_end_matches('/').to_string(),
        })
    }

    pub fn shared(config: &AppConfig) -> AppResult<Arc<dyn PlaceDetailsSource>> {
        Ok(Arc::new(Self::new(config)?))
    }

    fn details_url(&self, place_id: &str, field: PlaceField, api_key: &SecretString) -> AppResult<Url> {
        let mut url = Url::parse(&format!("{}/details/json", self.base_url))
            .map_err(|err| AppError::Config(format!("invalid places API base URL: {err}")))?;
        url.query_pairs_mut()
            .append_pair("place_id", place_id)
            .append_pair("fields", field.as_str())
            .append_pair("key", api_key.expose_secret());
        Ok(url)
    }
}

#[async_trait]
impl PlaceDetailsSource for HttpPlacesClient {
    async fn place_details(
        &self,
        place_id: &str,
        field: PlaceField,
        api_key: &SecretString,
    ) -> AppResult<PlaceDetailsEnvelope> {
        let url = self.details_url(place_id, field, api_key)?;
        let response = self.http.get(url).send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        debug!(
            target: "places",
            http_status = status.as_u16(),
            bytes = body.len(),
            field = field.as_str(),
            "place details response received"
        );

        serde_json::from_slice::<PlaceDetailsEnvelope>(&body).map_err(|err| {
            warn!(target: "places", error = %err, "place details body is not valid JSON");
            AppError::UpstreamData("Invalid API response".into())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httptest::matchers::{all_of, contains, request, url_decoded};
    use httptest::responders::{json_encoded, status_code};
    use httptest::{Expectation, Server};
    use serde_json::json;

    fn client_for(server: &Server) -> HttpPlacesClient {
        let config = AppConfig {
            places_api_base: server.url_str("/maps/api/place"),
            ..AppConfig::default()
        };
        HttpPlacesClient::new(&config).unwrap()
    }

    #[tokio::test]
    async fn sends_place_field_and_key() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/maps/api/place/details/json"),
                request::query(url_decoded(contains(("place_id", "ChIJ1")))),
                request::query(url_decoded(contains(("fields", "name")))),
                request::query(url_decoded(contains(("key", "k")))),
            ])
            .respond_with(json_encoded(json!({
                "status": "OK",
                "result": { "name": "  Corner Cafe " }
            }))),
        );

        let envelope = client_for(&server)
            .place_details("ChIJ1", PlaceField::Name, &SecretString::new("k".into()))
            .await
            .unwrap();
        assert!(envelope.is_ok());
        assert_eq!(envelope.place_name().as_deref(), Some("Corner Cafe"));
    }

    #[tokio::test]
    async fn undecodable_body_is_upstream_error() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/maps/api/place/details/json"))
                .respond_with(status_code(200).body("<html>oops</html>")),
        );

        let err = client_for(&server)
            .place_details("x", PlaceField::Reviews, &SecretString::new("k".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UpstreamData(_)));
        assert_eq!(err.to_string(), "Invalid API response");
    }

    #[test]
    fn skips_malformed_review_entries() {
        let envelope: PlaceDetailsEnvelope = serde_json::from_value(json!({
            "status": "OK",
            "result": {
                "reviews": [
                    { "author_name": "A", "time": 1, "rating": 5 },
                    { "author_name": "B", "time": "not-a-number" },
                    { "author_name": "C", "time": 3, "rating": 4.6 }
                ]
            }
        }))
        .unwrap();
        let reviews = envelope.reviews().unwrap();
        assert_eq!(reviews.len(), 2);
        assert_eq!(reviews[1].author(), "C");
    }

    #[test]
    fn tolerates_null_author_and_string_rating() {
        let envelope: PlaceDetailsEnvelope = serde_json::from_value(json!({
            "status": "OK",
            "result": {
                "reviews": [
                    { "author_name": null, "time": 7, "rating": "5", "text": null },
                    { "author_name": "D", "time": 8, "rating": "n/a" }
                ]
            }
        }))
        .unwrap();
        let reviews = envelope.reviews().unwrap();
        assert_eq!(reviews.len(), 2);
        assert_eq!(reviews[0].author(), "");
        assert_eq!(reviews[0].rating, Some(5.0));
        assert_eq!(reviews[1].rating, None);
    }

    #[test]
    fn missing_reviews_array_is_none() {
        let envelope: PlaceDetailsEnvelope =
            serde_json::from_value(json!({ "status": "OK", "result": {} })).unwrap();
        assert!(envelope.reviews().is_none());
        let envelope: PlaceDetailsEnvelope =
            serde_json::from_value(json!({ "status": "REQUEST_DENIED" })).unwrap();
        assert!(!envelope.is_ok());
        assert!(envelope.reviews().is_none());
    }
}
