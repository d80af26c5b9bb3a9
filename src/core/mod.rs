pub mod config;
pub mod error;
pub mod state;

pub use config::AppConfig;
pub use error::AppError;
pub use state::AppState;
