use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures_util::StreamExt;
use image::ImageFormat;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use reqwest::Client;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::reviews::ReviewRepository;
use crate::sanitize;

const FILE_PREFIX: &str = "review-profile-";

#[derive(Debug, Clone, Serialize)]
pub struct MediaAsset {
    pub id: i64,
    pub review_id: i64,
    pub file_name: String,
    pub mime_type: String,
    pub byte_size: u64,
    pub source_url: String,
}

impl MediaAsset {
    pub fn public_path(&self) -> String {
        format!("/media/{}", self.file_name)
    }
}

/// Downloads reviewer photos and stores them as media assets owned by the
/// review. Every failure comes back as `AppError::ImageImport`.
#[derive(Clone)]
pub struct ImageImporter {
    http: Client,
    db: Arc<Mutex<Connection>>,
    reviews: ReviewRepository,
    media_dir: PathBuf,
    max_bytes: u64,
}

impl ImageImporter {
    pub fn new(
        config: &AppConfig,
        db: Arc<Mutex<Connection>>,
        reviews: ReviewRepository,
    ) -> AppResult<Self> {
        let media_dir = config.media_dir();
        std::fs::create_dir_all(&media_dir)?;
        let http = Client::builder()
            .user_agent(concat!("review-mirror/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            db,
            reviews,
            media_dir,
            max_bytes: config.max_photo_bytes,
        })
    }

    pub fn media_dir(&self) -> &Path {
        &self.media_dir
    }

    pub async fn import_featured_image(
        &self,
        review_id: i64,
        image_url: &str,
    ) -> AppResult<MediaAsset> {
        let url = sanitize::http_url(image_url)
            .ok_or_else(|| image_error(format!("invalid image URL: {image_url:?}")))?;

        let bytes = self.download(&url).await?;
        let format = image::guess_format(&bytes)
            .map_err(|_| image_error("downloaded file is not a recognised image"))?;
        let (mime_type, extension) = accepted_format(format)
            .ok_or_else(|| image_error(format!("unsupported image format {format:?}")))?;

        // The temp file lives next to its final location so persisting is a
        // rename; on any early return it is removed when dropped.
        let mut transient = NamedTempFile::new_in(&self.media_dir)
            .map_err(|err| image_error(format!("failed to create temp file: {err}")))?;
        transient
            .write_all(&bytes)
            .and_then(|_| transient.flush())
            .map_err(|err| image_error(format!("failed to write temp file: {err}")))?;

        let file_name = format!("{FILE_PREFIX}{}.{extension}", random_token());
        let final_path = self.media_dir.join(&file_name);
        transient
            .persist(&final_path)
            .map_err(|err| image_error(format!("failed to store image: {}", err.error)))?;
        debug!(target: "media", review_id, file = %file_name, "image stored");

        let asset = match self.register(review_id, &file_name, mime_type, bytes.len() as u64, &url) {
            Ok(asset) => asset,
            Err(err) => {
                let _ = std::fs::remove_file(&final_path);
                return Err(image_error(format!("failed to register asset: {err}")));
            }
        };

        match self.reviews.set_featured_media(review_id, asset.id) {
            Ok(true) => {}
            Ok(false) => {
                return Err(image_error(format!(
                    "review {review_id} not found when attaching image"
                )))
            }
            Err(err) => return Err(image_error(format!("failed to attach image: {err}"))),
        }

        info!(
            target: "media",
            review_id,
            media_id = asset.id,
            bytes = asset.byte_size,
            "representative image attached"
        );
        Ok(asset)
    }

    pub fn asset(&self, media_id: i64) -> AppResult<Option<MediaAsset>> {
        let conn = self.db.lock();
        Ok(conn
            .query_row(
                "SELECT id, review_id, file_name, mime_type, byte_size, source_url
                FROM media_assets WHERE id = ?1",
                [media_id],
                |row| {
                    Ok(MediaAsset {
                        id: row.get(0)?,
                        review_id: row.get(1)?,
                        file_name: row.get(2)?,
                        mime_type: row.get(3)?,
                        byte_size: row.get::<_, i64>(4)? as u64,
                        source_url: row.get(5)?,
                    })
                },
            )
            .optional()?)
    }

    async fn download(&self, url: &str) -> AppResult<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| image_error(format!("download failed: {err}")))?;

        if let Some(length) = response.content_length() {
            if length > self.max_bytes {
                return Err(image_error(format!(
                    "image of {length} bytes exceeds the {} byte limit",
                    self.max_bytes
                )));
            }
        }

        let mut stream = response.bytes_stream();
        let mut buffer = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| image_error(format!("download interrupted: {err}")))?;
            if (buffer.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(image_error(format!(
                    "image exceeds the {} byte limit",
                    self.max_bytes
                )));
            }
            buffer.extend_from_slice(&chunk);
        }

        if buffer.is_empty() {
            return Err(image_error("downloaded image is empty"));
        }
        Ok(buffer)
    }

    fn register(
        &self,
        review_id: i64,
        file_name: &str,
        mime_type: &str,
        byte_size: u64,
        source_url: &str,
    ) -> AppResult<MediaAsset> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO media_assets (review_id, file_name, mime_type, byte_size, source_url)
            VALUES (?1, ?2, ?3, ?4, ?5)",
            params![review_id, file_name, mime_type, byte_size as i64, source_url],
        )?;
        Ok(MediaAsset {
            id: conn.last_insert_rowid(),
            review_id,
            file_name: file_name.to_string(),
            mime_type: mime_type.to_string(),
            byte_size,
            source_url: source_url.to_string(),
        })
    }
}

fn accepted_format(format: ImageFormat) -> Option<(&'static str, &'static str)> {
    match format {
        ImageFormat::Jpeg => Some(("image/jpeg", "jpg")),
        ImageFormat::Png => Some(("image/png", "png")),
        ImageFormat::WebP => Some(("image/webp", "webp")),
        _ => None,
    }
}

fn random_token() -> String {
    let mut bytes = [0_u8; 12];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn image_error(message: impl Into<String>) -> AppError {
    AppError::ImageImport(message.into())
}
