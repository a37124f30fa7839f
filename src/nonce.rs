use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

use crate::errors::AppResult;
use crate::secrets::{SecretLifecycle, SecretVault};

pub const NONCE_SALT_ALIAS: &str = "nonce-salt";

/// A nonce stays valid for the tick it was issued in and the one after,
/// so its lifetime is between 12 and 24 hours.
const TICK_SECONDS: i64 = 12 * 60 * 60;

/// Issues and checks action-scoped anti-forgery tokens.
#[derive(Clone)]
pub struct NonceIssuer {
    salt: SecretString,
}

impl NonceIssuer {
    pub fn new(salt: SecretString) -> Self {
        Self { salt }
    }

    /// Loads the salt from the vault, creating it on first start.
    pub fn from_vault(vault: &SecretVault) -> AppResult<(Self, SecretLifecycle)> {
        let salt = vault.ensure(NONCE_SALT_ALIAS)?;
        let lifecycle = salt.lifecycle();
        Ok((Self::new(salt.into_secret()), lifecycle))
    }

    pub fn create(&self, action: &str) -> String {
        self.create_at(action, Utc::now())
    }

    pub fn verify(&self, action: &str, nonce: &str) -> bool {
        self.verify_at(action, nonce, Utc::now())
    }

    pub fn create_at(&self, action: &str, at: DateTime<Utc>) -> String {
        self.token(action, tick(at))
    }

    pub fn verify_at(&self, action: &str, nonce: &str, at: DateTime<Utc>) -> bool {
        let nonce = nonce.trim();
        if nonce.is_empty() {
            return false;
        }
        let current = tick(at);
        [current, current - 1]
            .into_iter()
            .any(|candidate| constant_time_eq(self.token(action, candidate).as_bytes(), nonce.as_bytes()))
    }

    fn token(&self, action: &str, tick: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.salt.expose_secret().as_bytes());
        hasher.update(b"|");
        hasher.update(action.as_bytes());
        hasher.update(b"|");
        hasher.update(tick.to_be_bytes());
        URL_SAFE_NO_PAD.encode(&hasher.finalize()[..18])
    }
}

fn tick(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(TICK_SECONDS)
}

fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    left.len() == right.len()
        && left
            .iter()
            .zip(right)
            .fold(0_u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}
