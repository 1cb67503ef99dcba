use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("API error: {0}")]
    ApiError(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Rate limited by upstream: {0}")]
    RateLimited(String),

    #[error("API quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("Data unavailable: {0}")]
    DataUnavailable(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

impl AppError {
    /// 检查错误是否为可重试类型
    ///
    /// 用于退避重试循环判断是否应该重试失败的操作
    pub fn is_retryable(&self) -> bool {
        match self {
            // 网络相关错误通常可重试
            AppError::HttpError(_) |
            AppError::ApiError(_) |
            AppError::WebSocketError(_) |
            AppError::RateLimited(_) => true,

            // 临时性系统资源错误可重试
            AppError::IoError(_) |
            AppError::ChannelError(_) => true,

            // 数据库锁争用等可重试
            AppError::DatabaseError(msg) => {
                msg.contains("locked") || msg.contains("busy") || msg.contains("timeout")
            },
            AppError::SqliteError(_) => true,

            // 配额耗尽只能等待下一个窗口，重试无意义
            AppError::QuotaExhausted(_) => false,

            // 上游明确无数据或响应格式错误，重试无意义
            AppError::DataUnavailable(_) |
            AppError::MalformedResponse(_) => false,

            // 解析错误、配置错误等不可重试
            AppError::JsonError(_) |
            AppError::ConfigError(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
