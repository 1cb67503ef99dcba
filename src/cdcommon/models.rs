use serde::{Deserialize, Serialize};

/// 表示一根OHLCV蜡烛 - 数据库存储格式
///
/// open_time为UTC毫秒时间戳，按周期边界（交易所时区内）对齐
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// 蜡烛开盘时间（毫秒）
    pub open_time: i64,
    /// 开盘价
    pub open: f64,
    /// 最高价
    pub high: f64,
    /// 最低价
    pub low: f64,
    /// 收盘价
    pub close: f64,
    /// 成交量
    pub volume: f64,
}

/// 解析后的应用内部成交数据
#[derive(Debug, Clone)]
pub struct TradeTick {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub timestamp_ms: i64,
}

/// WebSocket推送的原始成交条目
#[derive(Debug, Clone, Deserialize)]
pub struct RawTrade {
    #[serde(rename = "s")]
    pub symbol: String,      // 股票代码
    #[serde(rename = "p")]
    pub price: f64,          // 成交价格
    #[serde(rename = "v")]
    pub volume: f64,         // 成交量
    #[serde(rename = "t")]
    pub timestamp_ms: i64,   // 成交时间 (毫秒时间戳)
}

/// WebSocket消息信封
#[derive(Debug, Deserialize)]
pub struct StreamMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub data: Vec<RawTrade>,
    #[serde(default)]
    pub msg: Option<String>,
}

/// WebSocket订阅请求
#[derive(Debug, Serialize)]
pub struct SubscribeRequest {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub symbol: String,
}

impl SubscribeRequest {
    pub fn new(symbol: &str) -> Self {
        Self {
            msg_type: "subscribe".to_string(),
            symbol: symbol.to_string(),
        }
    }
}

/// 历史蜡烛接口的响应格式（平行数组）
///
/// s为"ok"或"no_data"，时间戳t以秒为单位
#[derive(Debug, Clone, Deserialize)]
pub struct CandleResponse {
    #[serde(rename = "s")]
    pub status: String,
    #[serde(default, rename = "t")]
    pub timestamps: Vec<i64>,
    #[serde(default, rename = "o")]
    pub opens: Vec<f64>,
    #[serde(default, rename = "h")]
    pub highs: Vec<f64>,
    #[serde(default, rename = "l")]
    pub lows: Vec<f64>,
    #[serde(default, rename = "c")]
    pub closes: Vec<f64>,
    #[serde(default, rename = "v")]
    pub volumes: Vec<f64>,
}

/// 补齐队列条目状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "processing" => Some(QueueStatus::Processing),
            "completed" => Some(QueueStatus::Completed),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }
}

/// 补齐队列条目
#[derive(Debug, Clone)]
pub struct BackfillQueueItem {
    pub id: i64,
    pub symbol: String,
    pub priority: i64,
    /// 最早可执行时间（毫秒）
    pub scheduled_for: i64,
    pub status: QueueStatus,
    pub created_at: i64,
    pub attempts: i64,
}

/// 对账审计记录（只追加）
#[derive(Debug, Clone)]
pub struct ReconciliationRecord {
    pub symbol: String,
    pub timeframe: String,
    /// 交易日 "YYYY-MM-DD"
    pub session_date: String,
    pub bars_updated: i64,
    pub reconciled_at: i64,
}

/// 限流器状态快照
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStats {
    pub calls_today: u32,
    pub daily_limit: u32,
    pub calls_this_minute: u32,
    pub minute_limit: u32,
}

/// 对账状态快照
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationStats {
    pub last_reconciled_date: Option<String>,
    /// 最近7天内的对账记录数
    pub runs_last_7d: i64,
    /// 最近7天内修正的蜡烛总数
    pub bars_updated_last_7d: i64,
}

/// 补齐进度（用于状态快照）
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackfillProgress {
    pub state: String,
    pub current: usize,
    pub total: usize,
}

/// Worker运行状态快照
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub running: bool,
    pub stream_connected: bool,
    pub stream_permanently_down: bool,
    pub subscribed_symbols: usize,
    pub trades_processed: u64,
    pub ticks_dropped: u64,
    pub last_tick_ms: i64,
    pub last_flush_ms: i64,
    pub last_backfill_ms: i64,
    pub backfill: BackfillProgress,
    pub rate_limit: RateLimitStats,
    pub queue_depth: i64,
    pub reconciliation: ReconciliationStats,
}
