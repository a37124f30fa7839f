use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Authorization(String),
    #[error("{0}")]
    Throttled(String),
    #[error("{0}")]
    Transport(String),
    #[error("{0}")]
    UpstreamData(String),
    #[error("{0}")]
    EmptyResult(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    ImageImport(String),
    #[error("{0}")]
    Config(String),
    #[error("failed to resolve required path: {0}")]
    Path(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Keychain(#[from] keyring::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Transport(err.to_string())
    }
}

impl AppError {
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Authorization(_) => "authorization",
            AppError::Throttled(_) => "throttle",
            AppError::Transport(_) => "transport",
            AppError::UpstreamData(_) => "upstream_data",
            AppError::EmptyResult(_) => "empty_result",
            AppError::Validation(_) => "validation",
            AppError::ImageImport(_) => "image_import",
            AppError::Config(_) => "configuration",
            AppError::Path(_)
            | AppError::Io(_)
            | AppError::Database(_)
            | AppError::Keychain(_)
            | AppError::Json(_) => "internal",
        }
    }

    /// Message safe to hand back to an admin client. Infrastructure failures
    /// are collapsed so paths and driver errors stay in the logs.
    pub fn public_message(&self) -> String {
        match self.kind() {
            "internal" => "Internal error; check the service logs".to_string(),
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hides_infrastructure_details() {
        let err = AppError::Io(io::Error::new(io::ErrorKind::Other, "/secret/path"));
        assert_eq!(err.kind(), "internal");
        assert!(!err.public_message().contains("/secret/path"));

        let err = AppError::Throttled("Please wait before fetching reviews again".into());
        assert_eq!(err.kind(), "throttle");
        assert_eq!(
            err.public_message(),
            "Please wait before fetching reviews again"
        );
    }
}
