use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::config::SecretBackendKind;
use crate::errors::{AppError, AppResult};

const KEY_LENGTH: usize = 64;

/// Small wrapper over the OS keychain. The in-memory backend exists for tests
/// and for throwaway deployments where nothing should outlive the process.
#[derive(Clone)]
pub struct SecretVault {
    service_name: String,
    backend: SecretBackend,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecretLifecycle {
    Retrieved,
    Created,
}

impl SecretLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretLifecycle::Retrieved => "retrieved",
            SecretLifecycle::Created => "created",
        }
    }
}

#[derive(Clone)]
pub struct SecretMaterial {
    secret: SecretString,
    lifecycle: SecretLifecycle,
}

impl SecretMaterial {
    pub fn into_secret(self) -> SecretString {
        self.secret
    }

    pub fn lifecycle(&self) -> SecretLifecycle {
        self.lifecycle
    }
}

#[derive(Clone)]
enum SecretBackend {
    Keyring,
    Memory(Arc<Mutex<HashMap<String, SecretString>>>),
}

impl SecretVault {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            backend: SecretBackend::Keyring,
        }
    }

    pub fn in_memory() -> Self {
        Self {
            service_name: "in-memory".to_string(),
            backend: SecretBackend::Memory(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    pub fn for_backend(kind: SecretBackendKind, service_name: impl Into<String>) -> Self {
        match kind {
            SecretBackendKind::Keyring => Self::new(service_name),
            SecretBackendKind::Memory => Self::in_memory(),
        }
    }

    /// Returns the secret stored under `account`, generating and storing a
    /// random one first if none exists.
    pub fn ensure(&self, account: &str) -> AppResult<SecretMaterial> {
        if let Some(secret) = self.read_secret(account)? {
            debug!(
                target: "secret_vault",
                service = %self.service_name,
                account,
                "loaded secret from secure backend"
            );
            return Ok(SecretMaterial {
                secret,
                lifecycle: SecretLifecycle::Retrieved,
            });
        }
        let secret = generate_secret();
        self.write_secret(account, &secret)?;
        info!(
            target: "secret_vault",
            service = %self.service_name,
            account,
            "created new secret in secure backend"
        );
        Ok(SecretMaterial {
            secret,
            lifecycle: SecretLifecycle::Created,
        })
    }

    pub fn read_secret(&self, account: &str) -> AppResult<Option<SecretString>> {
        match &self.backend {
            SecretBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                match entry.get_password() {
                    Ok(value) => Ok(Some(SecretString::new(value.into()))),
                    Err(keyring::Error::NoEntry) => Ok(None),
                    Err(err) => Err(AppError::from(err)),
                }
            }
            SecretBackend::Memory(store) => Ok(store.lock().get(account).cloned()),
        }
    }

    pub fn write_secret(&self, account: &str, secret: &SecretString) -> AppResult<()> {
        match &self.backend {
            SecretBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                entry.set_password(secret.expose_secret())?;
                Ok(())
            }
            SecretBackend::Memory(store) => {
                store.lock().insert(account.to_string(), secret.clone());
                Ok(())
            }
        }
    }
}

fn generate_secret() -> SecretString {
    let mut bytes = vec![0_u8; KEY_LENGTH];
    OsRng.fill_bytes(&mut bytes);
    SecretString::new(STANDARD_NO_PAD.encode(bytes).into())
}
