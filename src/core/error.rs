use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid env var {0}: {1}")]
    InvalidEnv(&'static str, String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("upstream feed error: {0}")]
    Upstream(String),

    #[error("symbol capacity reached ({0} engines)")]
    CapacityReached(usize),

    #[error("symbol not subscribed: {0}")]
    UnknownSymbol(String),
}
