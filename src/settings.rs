use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::AppResult;
use crate::sanitize;
use crate::secrets::SecretVault;

pub const MIN_UPDATE_FREQUENCY_DAYS: u32 = 1;
pub const MAX_UPDATE_FREQUENCY_DAYS: u32 = 30;
pub const DEFAULT_UPDATE_FREQUENCY_DAYS: u32 = 7;

pub const API_KEY_ALIAS: &str = "places-api-key";

const OPTION_PLACE_ID: &str = "place_id";
const OPTION_UPDATE_FREQUENCY: &str = "update_frequency_days";
const OPTION_LAST_FETCH: &str = "last_fetch_timestamp";
const OPTION_PLACE_NAME: &str = "cached_place_name";

#[derive(Debug, Clone)]
pub struct Settings {
    pub api_key: Option<SecretString>,
    pub place_id: String,
    pub update_frequency_days: u32,
    pub last_fetch_timestamp: i64,
    pub cached_place_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublicSettings {
    pub has_api_key: bool,
    pub place_id: String,
    pub update_frequency_days: u32,
    pub last_fetch_at: Option<DateTime<Utc>>,
    pub cached_place_name: Option<String>,
}

/// Raw form submission. Every field is optional so partial updates work, and
/// the frequency arrives as text because browsers send whatever was typed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateSettingsPayload {
    pub api_key: Option<String>,
    pub place_id: Option<String>,
    pub update_frequency_days: Option<String>,
}

impl Settings {
    pub fn has_credentials(&self) -> bool {
        self.api_key.is_some() && !self.place_id.is_empty()
    }

    pub fn last_fetch_at(&self) -> Option<DateTime<Utc>> {
        if self.last_fetch_timestamp <= 0 {
            return None;
        }
        DateTime::from_timestamp(self.last_fetch_timestamp, 0)
    }

    pub fn public_profile(&self) -> PublicSettings {
        PublicSettings {
            has_api_key: self.api_key.is_some(),
            place_id: self.place_id.clone(),
            update_frequency_days: self.update_frequency_days,
            last_fetch_at: self.last_fetch_at(),
            cached_place_name: self.cached_place_name.clone(),
        }
    }
}

impl UpdateSettingsPayload {
    pub fn sanitized(mut self) -> Self {
        self.api_key = self
            .api_key
            .map(|key| sanitize::plain_text(&key))
            .filter(|key| !key.is_empty());
        self.place_id = self.place_id.map(|id| sanitize::plain_text(&id));
        self.update_frequency_days = self
            .update_frequency_days
            .map(|raw| clamp_frequency(parse_frequency(&raw)).to_string());
        self
    }
}

/// Lenient integer parse: leading sign and digits are honoured, the sign is
/// dropped, anything unparsable counts as zero.
pub fn parse_frequency(raw: &str) -> u64 {
    let trimmed = raw.trim();
    let unsigned = trimmed.strip_prefix(&['-', '+'][..]).unwrap_or(trimmed);
    let digits: String = unsigned.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse::<u64>().unwrap_or(if digits.is_empty() { 0 } else { u64::MAX })
}

pub fn clamp_frequency(value: u64) -> u32 {
    value.clamp(
        MIN_UPDATE_FREQUENCY_DAYS as u64,
        MAX_UPDATE_FREQUENCY_DAYS as u64,
    ) as u32
}

#[derive(Clone)]
pub struct SettingsStore {
    db: Arc<Mutex<Connection>>,
    vault: SecretVault,
}

impl SettingsStore {
    pub fn new(db: Arc<Mutex<Connection>>, vault: SecretVault) -> Self {
        Self { db, vault }
    }

    pub fn load(&self) -> AppResult<Settings> {
        let api_key = self.vault.read_secret(API_KEY_ALIAS)?;
        let conn = self.db.lock();
        let place_id = read_option(&conn, OPTION_PLACE_ID)?.unwrap_or_default();
        let update_frequency_days = read_option(&conn, OPTION_UPDATE_FREQUENCY)?
            .map(|raw| clamp_frequency(parse_frequency(&raw)))
            .unwrap_or(DEFAULT_UPDATE_FREQUENCY_DAYS);
        let last_fetch_timestamp = read_option(&conn, OPTION_LAST_FETCH)?
            .and_then(|raw| raw.parse::<i64>().ok())
            .unwrap_or(0);
        let cached_place_name =
            read_option(&conn, OPTION_PLACE_NAME)?.filter(|name| !name.is_empty());

        Ok(Settings {
            api_key,
            place_id,
            update_frequency_days,
            last_fetch_timestamp,
            cached_place_name,
        })
    }

    pub fn apply(&self, payload: UpdateSettingsPayload) -> AppResult<Settings> {
        let payload = payload.sanitized();
        if let Some(key) = payload.api_key {
            self.store_api_key(&SecretString::new(key.into()))?;
        }
        {
            let conn = self.db.lock();
            if let Some(place_id) = &payload.place_id {
                write_option(&conn, OPTION_PLACE_ID, place_id)?;
            }
            if let Some(frequency) = &payload.update_frequency_days {
                write_option(&conn, OPTION_UPDATE_FREQUENCY, frequency)?;
            }
        }
        info!(target: "settings", "settings updated");
        self.load()
    }

    pub fn store_api_key(&self, key: &SecretString) -> AppResult<()> {
        self.vault.write_secret(API_KEY_ALIAS, key)
    }

    pub fn record_fetch(&self, at: DateTime<Utc>) -> AppResult<()> {
        let conn = self.db.lock();
        write_option(&conn, OPTION_LAST_FETCH, &at.timestamp().to_string())
    }

    pub fn cache_place_name(&self, name: &str) -> AppResult<()> {
        let conn = self.db.lock();
        write_option(&conn, OPTION_PLACE_NAME, name)
    }
}

fn read_option(conn: &Connection, name: &str) -> AppResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT value FROM options WHERE name = ?1",
            [name],
            |row| row.get(0),
        )
        .optional()?)
}

fn write_option(conn: &Connection, name: &str, value: &str) -> AppResult<()> {
    conn.execute(
        "INSERT INTO options (name, value, updated_at) VALUES (?1, ?2, DATETIME('now'))
        ON CONFLICT(name) DO UPDATE SET value = excluded.value, updated_at = DATETIME('now')",
        params![name, value],
    )?;
    Ok(())
}
