//! 实时成交流模块
//!
//! 维护到上游的单条WebSocket长连接，整个标的集合共用。
//! 解码后的成交直接喂给聚合器，任何HTTP补偿请求都通过通道
//! 移交给调度上下文执行，保证解码路径不被阻塞

use crate::cdcommon::config::WebSocketConfig;
use crate::cdcommon::models::{StreamMessage, SubscribeRequest, TradeTick};
use crate::cdcommon::{AppError, Result};
use crate::cddata::aggregator::CandleAggregator;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 断流补偿阈值（毫秒）：重连后落后超过该值才触发补偿
const GAP_THRESHOLD_MS: i64 = 300_000;

/// 补偿窗口起点相对最后成交的偏移（毫秒）
const GAP_RESUME_OFFSET_MS: i64 = 60_000;

/// 连接状态，供状态快照读取
#[derive(Debug, Default)]
pub struct StreamState {
    pub connected: AtomicBool,
    pub permanently_down: AtomicBool,
    pub last_tick_ms: AtomicI64,
}

/// 断流补偿请求，由调度上下文消费
#[derive(Debug, Clone)]
pub struct GapFillRequest {
    pub symbols: Vec<String>,
    pub from_ms: i64,
    pub to_ms: i64,
}

/// 实时成交流
pub struct TradeStreamer {
    config: WebSocketConfig,
    api_key: String,
    aggregator: Arc<Mutex<CandleAggregator>>,
    state: Arc<StreamState>,
    symbols: HashSet<String>,
    subscribe_rx: mpsc::UnboundedReceiver<Vec<String>>,
    gap_tx: mpsc::UnboundedSender<GapFillRequest>,
    cancel: CancellationToken,
}

impl TradeStreamer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: WebSocketConfig,
        api_key: String,
        initial_symbols: Vec<String>,
        aggregator: Arc<Mutex<CandleAggregator>>,
        state: Arc<StreamState>,
        subscribe_rx: mpsc::UnboundedReceiver<Vec<String>>,
        gap_tx: mpsc::UnboundedSender<GapFillRequest>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            api_key,
            aggregator,
            state,
            symbols: initial_symbols.into_iter().collect(),
            subscribe_rx,
            gap_tx,
            cancel,
        }
    }

    /// 连接主循环，断线后按次数递增的间隔重连
    ///
    /// 超过最大重连次数后标记永久断开并退出，服务其余部分继续运行
    pub async fn run(mut self) {
        let mut attempts: usize = 0;

        loop {
            if self.cancel.is_cancelled() {
                info!(target: "streamer", "收到停机信号，连接循环退出");
                return;
            }

            match self.run_session().await {
                Ok(()) => {
                    // 会话因停机信号正常结束
                    self.state.connected.store(false, Ordering::SeqCst);
                    return;
                }
                Err(e) => {
                    // 会话内成功建连过则连续失败从头计数
                    let was_connected = self.state.connected.swap(false, Ordering::SeqCst);
                    attempts = next_attempt_count(was_connected, attempts);

                    if attempts >= self.config.max_reconnect_attempts {
                        error!(target: "streamer", attempts = attempts, error = %e,
                            "超过最大重连次数，连接标记为永久断开");
                        self.state.permanently_down.store(true, Ordering::SeqCst);
                        return;
                    }

                    let delay = self.config.reconnect_interval_secs * attempts as u64;
                    warn!(target: "streamer", attempts = attempts, delay_secs = delay,
                        error = %e, "连接断开，等待重连");

                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(delay)) => {}
                        _ = self.cancel.cancelled() => return,
                    }
                }
            }
        }
    }

    /// 单次连接会话：建连、订阅、读消息直到断开或停机
    async fn run_session(&mut self) -> Result<()> {
        let url = format!("{}?token={}", self.config.websocket_url, self.api_key);

        let connect = tokio::time::timeout(
            Duration::from_secs(self.config.connection_timeout_secs),
            connect_async(url.as_str()),
        );
        let (ws_stream, _) = match connect.await {
            Ok(Ok(ok)) => ok,
            Ok(Err(e)) => return Err(AppError::WebSocketError(format!("连接失败: {}", e))),
            Err(_) => return Err(AppError::WebSocketError("连接超时".to_string())),
        };

        let (mut write, mut read) = ws_stream.split();
        info!(target: "streamer", symbols = self.symbols.len(), "WebSocket已连接，开始订阅");

        // 订阅全部标的
        let mut symbols: Vec<String> = self.symbols.iter().cloned().collect();
        symbols.sort();
        for symbol in &symbols {
            let msg = serde_json::to_string(&SubscribeRequest::new(symbol))?;
            write.send(Message::Text(msg)).await
                .map_err(|e| AppError::WebSocketError(format!("订阅失败: {}", e)))?;
        }

        self.state.connected.store(true, Ordering::SeqCst);

        // 重连成功后检查断流窗口，需要时移交补偿请求
        let last_tick = self.state.last_tick_ms.load(Ordering::SeqCst);
        let now_ms = chrono::Utc::now().timestamp_millis();
        if needs_gap_fill(last_tick, now_ms) {
            let request = GapFillRequest {
                symbols: symbols.clone(),
                from_ms: last_tick + GAP_RESUME_OFFSET_MS,
                to_ms: now_ms,
            };
            info!(target: "streamer", from_ms = request.from_ms, to_ms = request.to_ms,
                "检测到断流窗口，提交补偿请求");
            self.gap_tx.send(request)
                .map_err(|e| AppError::ChannelError(format!("补偿请求发送失败: {}", e)))?;
        }

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text),
                        Some(Ok(Message::Ping(payload))) => {
                            write.send(Message::Pong(payload)).await
                                .map_err(|e| AppError::WebSocketError(format!("Pong发送失败: {}", e)))?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            return Err(AppError::WebSocketError(format!("连接被关闭: {:?}", frame)));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return Err(AppError::WebSocketError(format!("读取消息失败: {}", e)));
                        }
                        None => {
                            return Err(AppError::WebSocketError("消息流结束".to_string()));
                        }
                    }
                }
                cmd = self.subscribe_rx.recv() => {
                    if let Some(new_symbols) = cmd {
                        // 标的集合只增不减，对新增标的补发订阅
                        for symbol in new_symbols {
                            if self.symbols.insert(symbol.clone()) {
                                let msg = serde_json::to_string(&SubscribeRequest::new(&symbol))?;
                                write.send(Message::Text(msg)).await
                                    .map_err(|e| AppError::WebSocketError(format!("订阅失败: {}", e)))?;
                                info!(target: "streamer", symbol = %symbol, "新增标的订阅");
                            }
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    info!(target: "streamer", "收到停机信号，关闭连接");
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }

    /// 解码一条文本消息并送入聚合器
    ///
    /// 格式错误的消息记录后跳过，不中断连接
    fn handle_text(&self, text: &str) {
        let message: StreamMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                warn!(target: "streamer", error = %e, "消息解码失败，跳过");
                return;
            }
        };

        match message.msg_type.as_str() {
            "trade" => {
                let mut agg = match self.aggregator.lock() {
                    Ok(g) => g,
                    Err(_) => {
                        error!(target: "streamer", "聚合器锁中毒，丢弃本批成交");
                        return;
                    }
                };
                for raw in &message.data {
                    let tick = TradeTick {
                        symbol: raw.symbol.clone(),
                        price: raw.price,
                        volume: raw.volume,
                        timestamp_ms: raw.timestamp_ms,
                    };
                    agg.process_tick(&tick);
                    let prev = self.state.last_tick_ms.load(Ordering::SeqCst);
                    if raw.timestamp_ms > prev {
                        self.state.last_tick_ms.store(raw.timestamp_ms, Ordering::SeqCst);
                    }
                }
            }
            "ping" => {}
            "error" => {
                warn!(target: "streamer", msg = ?message.msg, "上游错误消息");
            }
            other => {
                debug!(target: "streamer", msg_type = %other, "忽略未知消息类型");
            }
        }
    }
}

/// 是否需要断流补偿：有历史成交且落后超过阈值
pub fn needs_gap_fill(last_tick_ms: i64, now_ms: i64) -> bool {
    last_tick_ms > 0 && now_ms - last_tick_ms >= GAP_THRESHOLD_MS
}

/// 会话结束后的连续失败次数
///
/// 重连上限针对连续失败，不针对服务生命周期内的累计断线。
/// 会话曾成功建连，本次断开算第一次失败
fn next_attempt_count(was_connected: bool, attempts: usize) -> usize {
    if was_connected {
        1
    } else {
        attempts + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 断流判定：无历史成交不补，落后不足阈值不补
    #[test]
    fn test_needs_gap_fill() {
        assert!(!needs_gap_fill(0, 1_700_000_000_000));
        assert!(!needs_gap_fill(1_700_000_000_000, 1_700_000_000_000 + 299_999));
        assert!(needs_gap_fill(1_700_000_000_000, 1_700_000_000_000 + 300_000));
    }

    /// 成交消息解码
    #[test]
    fn test_decode_trade_message() {
        let text = r#"{"type":"trade","data":[{"s":"AAPL","p":150.25,"v":100,"t":1700000000000}]}"#;
        let msg: StreamMessage = serde_json::from_str(text).unwrap();
        assert_eq!(msg.msg_type, "trade");
        assert_eq!(msg.data.len(), 1);
        assert_eq!(msg.data[0].symbol, "AAPL");
        assert_eq!(msg.data[0].price, 150.25);
        assert_eq!(msg.data[0].timestamp_ms, 1_700_000_000_000);
    }

    /// 订阅消息序列化
    #[test]
    fn test_subscribe_request_format() {
        let msg = serde_json::to_string(&SubscribeRequest::new("MSFT")).unwrap();
        assert_eq!(msg, r#"{"type":"subscribe","symbol":"MSFT"}"#);
    }

    /// 连续建连失败时计数递增，建连成功过的会话断开后重新计数
    #[test]
    fn test_attempt_count_resets_after_connected_session() {
        // 从未成功的冷启动：失败计数一路递增
        let mut attempts = 0;
        for expected in 1..=3 {
            attempts = next_attempt_count(false, attempts);
            assert_eq!(attempts, expected);
        }

        // 成功会话后的断开只算第一次失败
        attempts = next_attempt_count(true, attempts);
        assert_eq!(attempts, 1);

        // 长期运行的服务反复断线重连，累计断线数不会触及上限
        let max_attempts = 10;
        let mut attempts = 0;
        for _ in 0..max_attempts * 5 {
            attempts = next_attempt_count(true, attempts);
            assert!(attempts < max_attempts);
        }
    }
}
