use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

const DEFAULT_PLACES_API_BASE: &str = "https://maps.googleapis.com/maps/api/place";
const DEFAULT_TELEMETRY_BUFFER_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_TELEMETRY_BUFFER_MAX_FILES: usize = 5;
const DEFAULT_MAX_PHOTO_BYTES: u64 = 5 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretBackendKind {
    Keyring,
    Memory,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub host: IpAddr,
    pub port: u16,
    pub data_dir: PathBuf,
    pub database_file_name: String,
    pub places_api_base: String,
    pub http_timeout_secs: u64,
    pub min_fetch_interval_secs: u64,
    pub photo_import_delay_ms: u64,
    pub max_photo_bytes: u64,
    pub scheduler_enabled: bool,
    pub secret_backend: SecretBackendKind,
    pub admin_token: Option<SecretString>,
    pub google_places_api_key: Option<SecretString>,
    pub telemetry_enabled_by_default: bool,
    pub telemetry_batch_size: usize,
    pub telemetry_flush_interval_secs: u64,
    pub telemetry_buffer_max_bytes: u64,
    pub telemetry_buffer_max_files: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub bind_addr: String,
    pub database_file_name: String,
    pub places_api_base: String,
    pub http_timeout_secs: u64,
    pub min_fetch_interval_secs: u64,
    pub photo_import_delay_ms: u64,
    pub max_photo_bytes: u64,
    pub scheduler_enabled: bool,
    pub secret_backend: SecretBackendKind,
    pub has_admin_token: bool,
    pub has_env_places_key: bool,
    pub telemetry_enabled_by_default: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8080,
            data_dir: PathBuf::from("data"),
            database_file_name: "reviews.db".to_string(),
            places_api_base: DEFAULT_PLACES_API_BASE.to_string(),
            http_timeout_secs: 30,
            min_fetch_interval_secs: 5 * 60,
            photo_import_delay_ms: 500,
            max_photo_bytes: DEFAULT_MAX_PHOTO_BYTES,
            scheduler_enabled: true,
            secret_backend: SecretBackendKind::Keyring,
            admin_token: None,
            google_places_api_key: None,
            telemetry_enabled_by_default: true,
            telemetry_batch_size: 25,
            telemetry_flush_interval_secs: 30,
            telemetry_buffer_max_bytes: DEFAULT_TELEMETRY_BUFFER_MAX_BYTES,
            telemetry_buffer_max_files: DEFAULT_TELEMETRY_BUFFER_MAX_FILES,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let defaults = Self::default();
        Self {
            host: env::var("HOST")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.host),
            port: parse_u16("PORT", defaults.port),
            data_dir: env::var("DATA_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            database_file_name: env::var("DATABASE_FILE_NAME")
                .unwrap_or(defaults.database_file_name),
            places_api_base: env::var("PLACES_API_BASE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.places_api_base),
            http_timeout_secs: parse_u64("HTTP_TIMEOUT_SECS", defaults.http_timeout_secs).max(1),
            min_fetch_interval_secs: parse_u64(
                "MIN_FETCH_INTERVAL_SECS",
                defaults.min_fetch_interval_secs,
            ),
            photo_import_delay_ms: parse_u64(
                "PHOTO_IMPORT_DELAY_MS",
                defaults.photo_import_delay_ms,
            ),
            max_photo_bytes: parse_u64("MAX_PHOTO_BYTES", defaults.max_photo_bytes).max(1),
            scheduler_enabled: parse_bool("SCHEDULER_ENABLED", defaults.scheduler_enabled),
            secret_backend: match env::var("SECRET_BACKEND")
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
                .as_str()
            {
                "memory" => SecretBackendKind::Memory,
                _ => SecretBackendKind::Keyring,
            },
            admin_token: parse_secret("ADMIN_TOKEN"),
            google_places_api_key: parse_secret("GOOGLE_PLACES_API_KEY"),
            telemetry_enabled_by_default: parse_bool(
                "TELEMETRY_ENABLED",
                defaults.telemetry_enabled_by_default,
            ),
            telemetry_batch_size: parse_usize("TELEMETRY_BATCH_SIZE", defaults.telemetry_batch_size)
                .max(1),
            telemetry_flush_interval_secs: parse_u64(
                "TELEMETRY_FLUSH_INTERVAL_SECS",
                defaults.telemetry_flush_interval_secs,
            )
            .max(1),
            telemetry_buffer_max_bytes: parse_u64(
                "TELEMETRY_BUFFER_MAX_BYTES",
                defaults.telemetry_buffer_max_bytes,
            ),
            telemetry_buffer_max_files: parse_usize(
                "TELEMETRY_BUFFER_MAX_FILES",
                defaults.telemetry_buffer_max_files,
            )
            .max(1),
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn media_dir(&self) -> PathBuf {
        self.data_dir.join("media")
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            bind_addr: self.bind_addr().to_string(),
            database_file_name: self.database_file_name.clone(),
            places_api_base: self.places_api_base.clone(),
            http_timeout_secs: self.http_timeout_secs,
            min_fetch_interval_secs: self.min_fetch_interval_secs,
            photo_import_delay_ms: self.photo_import_delay_ms,
            max_photo_bytes: self.max_photo_bytes,
            scheduler_enabled: self.scheduler_enabled,
            secret_backend: self.secret_backend,
            has_admin_token: self.admin_token.is_some(),
            has_env_places_key: self.google_places_api_key.is_some(),
            telemetry_enabled_by_default: self.telemetry_enabled_by_default,
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_secret(key: &str) -> Option<SecretString> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(|v| SecretString::new(v.into()))
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_u16(key: &str, default: u16) -> u16 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u16>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}
