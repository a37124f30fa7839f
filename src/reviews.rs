use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::trace;

use crate::errors::AppResult;
use crate::places::ReviewPayload;
use crate::sanitize;

pub const MAX_RATING: u8 = 5;
const FILLED_STAR: char = '★';
const EMPTY_STAR: char = '☆';
const REVIEW_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Fingerprint of a review: hex MD5 over the author name followed by the
/// decimal timestamp. Stable across fetches, so it doubles as the dedup key.
pub fn review_hash(author_name: &str, time: i64) -> String {
    format!("{:x}", md5::compute(format!("{author_name}{time}")))
}

pub fn clamp_rating(raw: Option<f64>) -> u8 {
    match raw {
        Some(value) if value.is_finite() => value.trunc().clamp(0.0, MAX_RATING as f64) as u8,
        _ => 0,
    }
}

pub fn rating_stars(rating: u8) -> String {
    let filled = rating.min(MAX_RATING) as usize;
    let mut stars = String::with_capacity(MAX_RATING as usize * 3);
    stars.extend(std::iter::repeat(FILLED_STAR).take(filled));
    stars.extend(std::iter::repeat(EMPTY_STAR).take(MAX_RATING as usize - filled));
    stars
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewMeta {
    pub review_id: String,
    pub author_name: String,
    pub author_url: String,
    pub rating: u8,
    pub rating_stars: String,
    pub review_time: i64,
    pub review_date: String,
    pub relative_time: String,
    pub language: String,
    pub profile_photo_url: String,
}

impl ReviewMeta {
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        vec![
            ("review_id", self.review_id.clone()),
            ("author_name", self.author_name.clone()),
            ("author_url", self.author_url.clone()),
            ("rating", self.rating.to_string()),
            ("rating_stars", self.rating_stars.clone()),
            ("review_time", self.review_time.to_string()),
            ("review_date", self.review_date.clone()),
            ("relative_time", self.relative_time.clone()),
            ("language", self.language.clone()),
            ("profile_photo_url", self.profile_photo_url.clone()),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct NewReview {
    pub hash: String,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub meta: ReviewMeta,
}

impl NewReview {
    pub fn from_payload(payload: &ReviewPayload) -> Self {
        let hash = review_hash(payload.author(), payload.time);
        let created_at = DateTime::from_timestamp(payload.time, 0).unwrap_or_default();
        let rating = clamp_rating(payload.rating);
        let author_name = sanitize::plain_text(payload.author());
        let meta = ReviewMeta {
            review_id: hash.clone(),
            author_name: author_name.clone(),
            author_url: payload
                .author_url
                .as_deref()
                .and_then(sanitize::http_url)
                .unwrap_or_default(),
            rating,
            rating_stars: rating_stars(rating),
            review_time: payload.time,
            review_date: created_at.format(REVIEW_DATE_FORMAT).to_string(),
            relative_time: payload
                .relative_time_description
                .as_deref()
                .map(sanitize::plain_text)
                .unwrap_or_default(),
            language: payload
                .language
                .as_deref()
                .map(sanitize::plain_text)
                .unwrap_or_default(),
            profile_photo_url: payload
                .profile_photo_url
                .as_deref()
                .and_then(sanitize::http_url)
                .unwrap_or_default(),
        };

        Self {
            hash,
            title: author_name,
            body: payload
                .text
                .as_deref()
                .map(sanitize::rich_text)
                .unwrap_or_default(),
            created_at,
            meta,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewSummary {
    pub id: i64,
    pub title: String,
    pub rating_stars: String,
    pub created_at: String,
    pub featured_media_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewRecord {
    pub id: i64,
    pub title: String,
    pub body: String,
    pub status: String,
    pub created_at: String,
    pub imported_at: String,
    pub featured_media_id: Option<i64>,
    pub meta: BTreeMap<String, String>,
}

impl ReviewRecord {
    pub fn meta_value(&self, key: &str) -> &str {
        self.meta.get(key).map(String::as_str).unwrap_or("")
    }
}

#[derive(Clone)]
pub struct ReviewRepository {
    db: Arc<Mutex<Connection>>,
}

impl ReviewRepository {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    pub fn exists(&self, hash: &str) -> AppResult<bool> {
        let conn = self.db.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT id FROM reviews WHERE review_hash = ?1 LIMIT 1",
                [hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Inserts the record and its metadata in one transaction. Returns `None`
    /// when a record with the same hash already exists.
    pub fn insert(&self, review: &NewReview) -> AppResult<Option<i64>> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT INTO reviews (review_hash, title, body, status, created_at)
            VALUES (?1, ?2, ?3, 'publish', ?4)
            ON CONFLICT(review_hash) DO NOTHING",
            params![
                review.hash,
                review.title,
                review.body,
                review.created_at.to_rfc3339()
            ],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        let review_id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO review_meta (review_id, meta_key, meta_value) VALUES (?1, ?2, ?3)
                ON CONFLICT(review_id, meta_key) DO UPDATE SET meta_value = excluded.meta_value",
            )?;
            for (key, value) in review.meta.entries() {
                stmt.execute(params![review_id, key, value])?;
            }
        }
        tx.commit()?;
        trace!(review_id, hash = %review.hash, "review record created");
        Ok(Some(review_id))
    }

    pub fn set_featured_media(&self, review_id: i64, media_id: i64) -> AppResult<bool> {
        let conn = self.db.lock();
        let updated = conn.execute(
            "UPDATE reviews SET featured_media_id = ?1 WHERE id = ?2",
            params![media_id, review_id],
        )?;
        Ok(updated == 1)
    }

    pub fn count(&self) -> AppResult<i64> {
        let conn = self.db.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM reviews", [], |row| row.get(0))?)
    }

    pub fn list(&self, limit: usize) -> AppResult<Vec<ReviewSummary>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT r.id, r.title, COALESCE(m.meta_value, ''), r.created_at, r.featured_media_id
            FROM reviews r
            LEFT JOIN review_meta m ON m.review_id = r.id AND m.meta_key = 'rating_stars'
            ORDER BY r.created_at DESC, r.id DESC
            LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok(ReviewSummary {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    rating_stars: row.get(2)?,
                    created_at: row.get(3)?,
                    featured_media_id: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get(&self, review_id: i64) -> AppResult<Option<ReviewRecord>> {
        let conn = self.db.lock();
        let record = conn
            .query_row(
                "SELECT id, title, body, status, created_at, imported_at, featured_media_id
                FROM reviews WHERE id = ?1",
                [review_id],
                |row| {
                    Ok(ReviewRecord {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        body: row.get(2)?,
                        status: row.get(3)?,
                        created_at: row.get(4)?,
                        imported_at: row.get(5)?,
                        featured_media_id: row.get(6)?,
                        meta: BTreeMap::new(),
                    })
                },
            )
            .optional()?;
        let Some(mut record) = record else {
            return Ok(None);
        };

        let mut stmt =
            conn.prepare("SELECT meta_key, meta_value FROM review_meta WHERE review_id = ?1")?;
        record.meta = stmt
            .query_map([review_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<BTreeMap<String, String>, _>>()?;
        Ok(Some(record))
    }
}
