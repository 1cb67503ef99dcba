//! Worker编排模块
//!
//! 显式装配所有组件并管理其生命周期：启动时先跑一轮历史补齐，
//! 然后拉起实时连接、落库节拍、标的刷新与调度节拍。
//! 任何子任务的失败只降级对应能力，不终止进程

use crate::cdcommon::api::MarketDataApi;
use crate::cdcommon::config::{constants, ServiceConfig};
use crate::cdcommon::db::{Database, UpsertMode};
use crate::cdcommon::models::WorkerStatus;
use crate::cdcommon::rate_limiter::RateLimiter;
use crate::cdcommon::Result;
use crate::cddata::aggregator::CandleAggregator;
use crate::cddata::backfill::CandleBackfiller;
use crate::cddata::reconciliation::ReconciliationService;
use crate::cddata::streamer::{GapFillRequest, StreamState, TradeStreamer};
use crate::cddata::universe::{ConfigUniverse, UniverseProvider};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 服务编排器
pub struct Worker {
    config: ServiceConfig,
    db: Arc<Database>,
    limiter: Arc<RateLimiter>,
    aggregator: Arc<Mutex<CandleAggregator>>,
    backfiller: Arc<CandleBackfiller>,
    reconciliation: Arc<ReconciliationService>,
    universe: Arc<dyn UniverseProvider>,
    stream_state: Arc<StreamState>,
    subscribe_tx: mpsc::UnboundedSender<Vec<String>>,
    subscribed: Arc<Mutex<HashSet<String>>>,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
    last_flush_ms: Arc<AtomicI64>,
    last_backfill_ms: Arc<AtomicI64>,
    // start()取走后归属streamer任务
    streamer: Option<TradeStreamer>,
    gap_rx: Option<mpsc::UnboundedReceiver<GapFillRequest>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Worker {
    /// 装配全部组件
    pub fn new(config: ServiceConfig) -> Result<Self> {
        let db = Arc::new(Database::new(
            &config.database.database_path,
            config.database.pool_size,
            config.database.enable_wal,
        )?);

        let limiter = Arc::new(RateLimiter::new(
            db.clone(),
            config.api.daily_limit,
            config.api.minute_limit,
        )?);

        let api = MarketDataApi::new(&config.api)?;
        let aggregator = Arc::new(Mutex::new(CandleAggregator::new(constants::CANDLE_PERIOD_MS)));

        let backfiller = Arc::new(CandleBackfiller::new(
            db.clone(),
            api.clone(),
            limiter.clone(),
            config.backfill.clone(),
            config.api.max_quota_retries,
        ));

        let reconciliation = Arc::new(ReconciliationService::new(
            db.clone(),
            api.clone(),
            limiter.clone(),
            config.backfill.clone(),
            config.api.max_quota_retries,
        ));

        let universe: Arc<dyn UniverseProvider> =
            Arc::new(ConfigUniverse::new(&config.universe.symbols));
        let initial_symbols = universe.symbols()?;

        let cancel = CancellationToken::new();
        let stream_state = Arc::new(StreamState::default());
        let (subscribe_tx, subscribe_rx) = mpsc::unbounded_channel();
        let (gap_tx, gap_rx) = mpsc::unbounded_channel();

        let streamer = TradeStreamer::new(
            config.websocket.clone(),
            config.api.api_key.clone(),
            initial_symbols.clone(),
            aggregator.clone(),
            stream_state.clone(),
            subscribe_rx,
            gap_tx,
            cancel.clone(),
        );

        Ok(Self {
            config,
            db,
            limiter,
            aggregator,
            backfiller,
            reconciliation,
            universe,
            stream_state,
            subscribe_tx,
            subscribed: Arc::new(Mutex::new(initial_symbols.into_iter().collect())),
            cancel,
            running: Arc::new(AtomicBool::new(false)),
            last_flush_ms: Arc::new(AtomicI64::new(0)),
            last_backfill_ms: Arc::new(AtomicI64::new(0)),
            streamer: Some(streamer),
            gap_rx: Some(gap_rx),
            tasks: Vec::new(),
        })
    }

    /// 启动服务：先补齐历史，再拉起各常驻任务
    pub async fn start(&mut self) -> Result<()> {
        info!(target: "worker", "服务启动");
        self.running.store(true, Ordering::SeqCst);

        // 启动补齐，失败降级为实时数据继续运行
        let symbols = self.universe.symbols()?;
        match self.backfiller.run_batch(&symbols).await {
            Ok(()) => {
                self.last_backfill_ms.store(Utc::now().timestamp_millis(), Ordering::SeqCst);
            }
            Err(e) => {
                error!(target: "worker", error = %e, "启动补齐失败，实时链路继续");
            }
        }

        // 实时连接任务
        if let Some(streamer) = self.streamer.take() {
            self.tasks.push(tokio::spawn(streamer.run()));
        }

        // 断流补偿消费任务
        if let Some(mut gap_rx) = self.gap_rx.take() {
            let backfiller = self.backfiller.clone();
            let cancel = self.cancel.clone();
            self.tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        req = gap_rx.recv() => {
                            match req {
                                Some(request) => {
                                    if let Err(e) = backfiller.gap_fill(&request).await {
                                        warn!(target: "worker", error = %e, "断流补偿失败");
                                    }
                                }
                                None => return,
                            }
                        }
                        _ = cancel.cancelled() => return,
                    }
                }
            }));
        }

        // 完成蜡烛落库节拍
        {
            let db = self.db.clone();
            let aggregator = self.aggregator.clone();
            let last_flush = self.last_flush_ms.clone();
            let cancel = self.cancel.clone();
            self.tasks.push(tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_secs(constants::FLUSH_INTERVAL_SECS));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            flush_completed(&db, &aggregator).await;
                            last_flush.store(Utc::now().timestamp_millis(), Ordering::SeqCst);
                        }
                        _ = cancel.cancelled() => return,
                    }
                }
            }));
        }

        // 标的集合刷新任务，新增标的补发订阅
        {
            let universe = self.universe.clone();
            let subscribe_tx = self.subscribe_tx.clone();
            let subscribed = self.subscribed.clone();
            let cancel = self.cancel.clone();
            let interval_secs = self.config.universe.refresh_interval_secs;
            self.tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
                ticker.tick().await; // 首次立即触发的tick跳过
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let current = match universe.symbols() {
                                Ok(s) => s,
                                Err(e) => {
                                    warn!(target: "worker", error = %e, "标的刷新失败");
                                    continue;
                                }
                            };
                            let new_symbols: Vec<String> = {
                                let mut seen = match subscribed.lock() {
                                    Ok(g) => g,
                                    Err(_) => continue,
                                };
                                current.into_iter().filter(|s| seen.insert(s.clone())).collect()
                            };
                            if !new_symbols.is_empty() {
                                info!(target: "worker", count = new_symbols.len(), "发现新增标的");
                                let _ = subscribe_tx.send(new_symbols);
                            }
                        }
                        _ = cancel.cancelled() => return,
                    }
                }
            }));
        }

        // 调度节拍：对账窗口检查与队列消化
        {
            let reconciliation = self.reconciliation.clone();
            let backfiller = self.backfiller.clone();
            let universe = self.universe.clone();
            let cancel = self.cancel.clone();
            self.tasks.push(tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_secs(constants::SCHEDULER_INTERVAL_SECS));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let symbols = match universe.symbols() {
                                Ok(s) => s,
                                Err(_) => continue,
                            };
                            if let Err(e) = reconciliation.run_if_due(&symbols).await {
                                warn!(target: "worker", error = %e, "对账执行失败");
                            }
                            if let Err(e) = backfiller.process_queue().await {
                                warn!(target: "worker", error = %e, "队列消化失败");
                            }
                        }
                        _ = cancel.cancelled() => return,
                    }
                }
            }));
        }

        info!(target: "worker", tasks = self.tasks.len(), "常驻任务已全部拉起");
        Ok(())
    }

    /// 优雅停机：停止重连，强制收盘未结蜡烛并做最终落库
    pub async fn stop(&mut self) {
        info!(target: "worker", "开始优雅停机");
        self.cancel.cancel();

        for task in self.tasks.drain(..) {
            let _ = task.await;
        }

        // 已接收成交的量不能丢失
        if let Ok(mut agg) = self.aggregator.lock() {
            agg.force_close_all();
        }
        flush_completed(&self.db, &self.aggregator).await;
        self.last_flush_ms.store(Utc::now().timestamp_millis(), Ordering::SeqCst);

        self.running.store(false, Ordering::SeqCst);
        info!(target: "worker", "停机完成");
    }

    /// 只读状态快照
    pub fn status(&self) -> Result<WorkerStatus> {
        let (trades_processed, ticks_dropped) = match self.aggregator.lock() {
            Ok(agg) => (agg.trades_processed(), agg.ticks_dropped()),
            Err(_) => (0, 0),
        };
        let subscribed = self.subscribed.lock().map(|s| s.len()).unwrap_or(0);

        Ok(WorkerStatus {
            running: self.running.load(Ordering::SeqCst),
            stream_connected: self.stream_state.connected.load(Ordering::SeqCst),
            stream_permanently_down: self.stream_state.permanently_down.load(Ordering::SeqCst),
            subscribed_symbols: subscribed,
            trades_processed,
            ticks_dropped,
            last_tick_ms: self.stream_state.last_tick_ms.load(Ordering::SeqCst),
            last_flush_ms: self.last_flush_ms.load(Ordering::SeqCst),
            last_backfill_ms: self.last_backfill_ms.load(Ordering::SeqCst),
            backfill: self.backfiller.progress(),
            rate_limit: self.limiter.stats()?,
            queue_depth: self.db.queue_depth()?,
            reconciliation: self.reconciliation.stats()?,
        })
    }
}

/// 将聚合器中已完成的蜡烛按标的分组落库
async fn flush_completed(db: &Arc<Database>, aggregator: &Arc<Mutex<CandleAggregator>>) {
    let completed = match aggregator.lock() {
        Ok(mut agg) => agg.take_completed(),
        Err(_) => {
            error!(target: "worker", "聚合器锁中毒，跳过本轮落库");
            return;
        }
    };
    if completed.is_empty() {
        return;
    }

    let mut by_symbol: std::collections::HashMap<String, Vec<crate::cdcommon::models::Candle>> =
        std::collections::HashMap::new();
    for (symbol, candle) in completed {
        by_symbol.entry(symbol).or_default().push(candle);
    }

    for (symbol, candles) in by_symbol {
        let count = candles.len();
        match db.upsert_candles_async(
            symbol.clone(),
            constants::CANDLE_TIMEFRAME.to_string(),
            candles.clone(),
            UpsertMode::Normal,
        ).await {
            Ok(stored) => {
                info!(target: "worker", symbol = %symbol, completed = count,
                    stored = stored, "完成蜡烛落库");
            }
            Err(e) => {
                // 事务已回滚，蜡烛放回缓冲区等下一轮
                error!(target: "worker", symbol = %symbol, error = %e, "蜡烛落库失败");
                if let Ok(mut agg) = aggregator.lock() {
                    agg.requeue_completed(
                        candles.into_iter().map(|c| (symbol.clone(), c)).collect(),
                    );
                }
            }
        }
    }
}
