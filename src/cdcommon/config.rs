//! 蜡烛数据服务配置模块

use serde::{Deserialize, Serialize};
use crate::cdcommon::{AppError, Result};

/// 系统配置常量
pub mod constants {
    /// 目标蜡烛周期（毫秒），5分钟
    pub const CANDLE_PERIOD_MS: i64 = 5 * 60 * 1000;

    /// 目标蜡烛周期标识
    pub const CANDLE_TIMEFRAME: &str = "5m";

    /// 历史数据抓取分辨率（1分钟）
    pub const FETCH_RESOLUTION: &str = "1";

    /// 历史数据抓取分辨率对应的毫秒数
    pub const FETCH_RESOLUTION_MS: i64 = 60 * 1000;

    /// 增量补齐跳过阈值（秒）：落后不足5分钟视为已是最新
    pub const INCREMENTAL_SKIP_SECS: i64 = 300;

    /// 完成蜡烛的落库间隔（秒）
    pub const FLUSH_INTERVAL_SECS: u64 = 30;

    /// 调度检查间隔（秒）：对账窗口与队列消化
    pub const SCHEDULER_INTERVAL_SECS: u64 = 600;
}

/// API密钥的环境变量名，优先于配置文件
const API_KEY_ENV: &str = "MARKET_API_KEY";

/// 蜡烛数据服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// REST接口配置
    pub api: ApiConfig,

    /// WebSocket配置
    pub websocket: WebSocketConfig,

    /// 历史补齐配置
    pub backfill: BackfillConfig,

    /// 数据库配置
    pub database: DatabaseConfig,

    /// 标的集合配置
    pub universe: UniverseConfig,

    /// 日志配置
    pub logging: LoggingConfig,
}

/// REST接口配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// REST基础URL
    pub base_url: String,

    /// API密钥（可被环境变量覆盖）
    #[serde(default)]
    pub api_key: String,

    /// 请求超时（秒）
    pub timeout_secs: u64,

    /// 每日调用上限
    pub daily_limit: u32,

    /// 每分钟调用上限
    pub minute_limit: u32,

    /// 配额等待的最大重试次数
    pub max_quota_retries: u32,
}

/// WebSocket配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// WebSocket URL（密钥作为查询参数拼接）
    pub websocket_url: String,

    /// 连接超时（秒）
    pub connection_timeout_secs: u64,

    /// 重连间隔（秒），实际等待为间隔乘以已尝试次数
    pub reconnect_interval_secs: u64,

    /// 最大重连次数，超过后连接被标记为永久断开
    pub max_reconnect_attempts: usize,
}

/// 历史补齐配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// 回溯天数（日历日）
    pub lookback_days: i64,

    /// 回溯天数上限，数据库设置值会被钳制到该上限
    pub max_lookback_days: i64,

    /// 是否纳入盘前盘后数据（数据库设置可覆盖）
    pub include_extended_hours: bool,

    /// 单个分片抓取的最大重试次数
    pub max_chunk_retries: u32,

    /// 每次消化队列的最大条目数
    pub queue_batch_size: usize,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// 数据库文件路径
    pub database_path: String,

    /// 连接池大小
    pub pool_size: u32,

    /// 连接超时（秒）
    pub connection_timeout_secs: u64,

    /// 是否启用WAL模式
    pub enable_wal: bool,
}

/// 标的集合配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniverseConfig {
    /// 标的列表
    pub symbols: Vec<String>,

    /// 刷新间隔（秒）
    pub refresh_interval_secs: u64,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别 (trace, debug, info, warn, error)
    pub log_level: String,

    /// 日志文件目录，为空则只输出到控制台
    #[serde(default)]
    pub log_dir: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://finnhub.io/api/v1".to_string(),
            api_key: String::new(),
            timeout_secs: 30,
            daily_limit: 500,
            minute_limit: 60,
            max_quota_retries: 5,
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            websocket_url: "wss://ws.finnhub.io".to_string(),
            connection_timeout_secs: 30,
            reconnect_interval_secs: 5,
            max_reconnect_attempts: 10,
        }
    }
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            lookback_days: 30,
            max_lookback_days: 365,
            include_extended_hours: false,
            max_chunk_retries: 3,
            queue_batch_size: 10,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_path: "data/candles.db".to_string(),
            pool_size: 10,
            connection_timeout_secs: 30,
            enable_wal: true,
        }
    }
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["AAPL".to_string(), "MSFT".to_string(), "SPY".to_string()],
            refresh_interval_secs: 3600,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: Some("logs".to_string()),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            websocket: WebSocketConfig::default(),
            backfill: BackfillConfig::default(),
            database: DatabaseConfig::default(),
            universe: UniverseConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// 从文件加载配置
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(AppError::IoError)?;

        let mut config: Self = toml::from_str(&content)
            .map_err(|e| AppError::ConfigError(format!("解析配置文件失败: {}", e)))?;

        // 环境变量中的密钥优先于配置文件
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.is_empty() {
                config.api.api_key = key;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        if self.api.api_key.is_empty() {
            return Err(AppError::ConfigError(format!(
                "API密钥未配置，请在配置文件或环境变量 {} 中设置", API_KEY_ENV
            )));
        }

        if self.api.daily_limit == 0 || self.api.minute_limit == 0 {
            return Err(AppError::ConfigError(
                "API调用上限必须大于0".to_string()
            ));
        }

        if self.backfill.lookback_days <= 0 {
            return Err(AppError::ConfigError(
                "回溯天数必须大于0".to_string()
            ));
        }

        if self.backfill.lookback_days > self.backfill.max_lookback_days {
            return Err(AppError::ConfigError(format!(
                "回溯天数 {} 超过上限 {}",
                self.backfill.lookback_days, self.backfill.max_lookback_days
            )));
        }

        if self.database.pool_size == 0 {
            return Err(AppError::ConfigError(
                "数据库连接池大小必须大于0".to_string()
            ));
        }

        if self.universe.symbols.is_empty() {
            return Err(AppError::ConfigError(
                "标的列表不能为空".to_string()
            ));
        }

        if self.websocket.max_reconnect_attempts == 0 {
            return Err(AppError::ConfigError(
                "最大重连次数必须大于0".to_string()
            ));
        }

        Ok(())
    }
}
