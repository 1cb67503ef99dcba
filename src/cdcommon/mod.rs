// 共享基础模块
pub mod api;
pub mod calendar;
pub mod config;
pub mod db;
pub mod error;
pub mod logging_setup;
pub mod models;
pub mod rate_limiter;

pub use api::MarketDataApi;
pub use calendar::SessionCalendar;
pub use config::ServiceConfig;
pub use db::{Database, UpsertMode};
pub use error::{AppError, Result};
pub use models::*;
pub use rate_limiter::RateLimiter;
