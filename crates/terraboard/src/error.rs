use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Provider(#[from] providers::ProviderError),

    #[error(transparent)]
    Store(#[from] store::StoreError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unknown version: {0}")]
    UnknownVersion(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;
