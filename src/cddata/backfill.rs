//! 历史蜡烛补齐模块
//!
//! 按日历日分片拉取1分钟历史数据，过滤非交易时段后重采样为5分钟
//! 蜡烛落库。每个分片落库即为检查点，中断后从已有数据续跑。
//! 日配额不足以覆盖整批时，超出的标的直接入队延期，当天不再消耗调用

use crate::cdcommon::api::MarketDataApi;
use crate::cdcommon::calendar::SessionCalendar;
use crate::cdcommon::config::{constants, BackfillConfig};
use crate::cdcommon::db::{Database, UpsertMode};
use crate::cdcommon::models::{BackfillProgress, Candle};
use crate::cdcommon::rate_limiter::RateLimiter;
use crate::cdcommon::{AppError, Result};
use crate::cddata::streamer::GapFillRequest;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// 延期任务的执行时间：次日起每天01:00 UTC，避开交易时段
const DEFERRED_RUN_HOUR_UTC: u32 = 1;

/// 历史补齐器
pub struct CandleBackfiller {
    db: Arc<Database>,
    api: MarketDataApi,
    limiter: Arc<RateLimiter>,
    calendar: SessionCalendar,
    config: BackfillConfig,
    quota_retries: u32,
    progress: Mutex<BackfillProgress>,
}

impl CandleBackfiller {
    pub fn new(
        db: Arc<Database>,
        api: MarketDataApi,
        limiter: Arc<RateLimiter>,
        config: BackfillConfig,
        quota_retries: u32,
    ) -> Self {
        Self {
            db,
            api,
            limiter,
            calendar: SessionCalendar::new(),
            config,
            quota_retries,
            progress: Mutex::new(BackfillProgress::default()),
        }
    }

    /// 当前进度快照
    pub fn progress(&self) -> BackfillProgress {
        self.progress.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn set_progress(&self, state: &str, current: usize, total: usize) {
        if let Ok(mut p) = self.progress.lock() {
            p.state = state.to_string();
            p.current = current;
            p.total = total;
        }
    }

    fn include_extended(&self) -> bool {
        self.db.include_extended_setting(self.config.include_extended_hours)
    }

    fn lookback_days(&self) -> i64 {
        self.db
            .lookback_days_setting(self.config.lookback_days, self.config.max_lookback_days)
    }

    /// 整批补齐入口
    ///
    /// 先按配额预算划分可处理与需延期的标的，延期标的整批入队后
    /// 逐个处理可达标的，单个标的失败不影响其余
    #[instrument(skip_all, fields(symbols = symbols.len()))]
    pub async fn run_batch(&self, symbols: &[String]) -> Result<()> {
        let now = Utc::now();
        let lookback = self.lookback_days();

        // 无存量数据的标的需要整窗拉取，每个交易日一次调用
        let mut full_symbols = Vec::new();
        let mut incremental_symbols = Vec::new();
        for symbol in symbols {
            match self.db.latest_open_time(symbol, constants::CANDLE_TIMEFRAME)? {
                Some(_) => incremental_symbols.push(symbol.clone()),
                None => full_symbols.push(symbol.clone()),
            }
        }

        let remaining = self.limiter.remaining_today()? as i64;
        let (process_count, overflow_count) =
            plan_within_budget(full_symbols.len(), lookback, remaining);

        if overflow_count > 0 {
            info!(target: "backfill", overflow = overflow_count, remaining = remaining,
                "日配额不足，超出标的延期入队");
            let now_ms = now.timestamp_millis();
            let per_day = deferred_per_day(self.limiter.remaining_today()?.max(1) as i64, lookback);
            for (i, symbol) in full_symbols[process_count..].iter().enumerate() {
                let scheduled = deferred_schedule(now, i, per_day);
                self.db.enqueue_backfill(symbol, 0, scheduled.timestamp_millis(), now_ms)?;
            }
        }

        let mut work: Vec<String> = incremental_symbols;
        work.extend_from_slice(&full_symbols[..process_count]);

        let total = work.len();
        self.set_progress("running", 0, total);

        for (i, symbol) in work.iter().enumerate() {
            self.set_progress("running", i, total);
            match self.backfill_symbol(symbol).await {
                Ok(n) => {
                    debug!(target: "backfill", symbol = %symbol, stored = n, "标的补齐完成");
                }
                Err(AppError::QuotaExhausted(msg)) => {
                    // 配额中途耗尽，剩余标的入队延期，本批结束
                    warn!(target: "backfill", symbol = %symbol, msg = %msg,
                        "配额耗尽，剩余标的延期");
                    let now_ms = Utc::now().timestamp_millis();
                    for (j, sym) in work[i..].iter().enumerate() {
                        let scheduled = deferred_schedule(Utc::now(), j, 1.max(work.len() as i64));
                        self.db.enqueue_backfill(sym, 0, scheduled.timestamp_millis(), now_ms)?;
                    }
                    break;
                }
                Err(e) => {
                    // 重试耗尽的标的入队优先补齐，批次继续
                    warn!(target: "backfill", symbol = %symbol, error = %e,
                        "标的补齐失败，入队重试");
                    let now_ms = Utc::now().timestamp_millis();
                    self.db.enqueue_backfill(symbol, 1, now_ms, now_ms)?;
                }
            }
        }

        self.set_progress("idle", total, total);
        Ok(())
    }

    /// 单个标的补齐：有存量做增量顶补，否则整窗逐日拉取
    pub async fn backfill_symbol(&self, symbol: &str) -> Result<usize> {
        let now = Utc::now();
        let now_ms = now.timestamp_millis();

        match self.db.latest_open_time(symbol, constants::CANDLE_TIMEFRAME)? {
            Some(last_ms) => {
                let from_ms = last_ms + 60_000;
                // 落后不足5分钟视为最新，不消耗调用
                if now_ms - from_ms < constants::INCREMENTAL_SKIP_SECS * 1000 {
                    debug!(target: "backfill", symbol = %symbol, "数据已是最新，跳过");
                    return Ok(0);
                }
                self.fetch_and_store_chunk(symbol, from_ms, now_ms).await
            }
            None => {
                let lookback = self.lookback_days();
                let mut stored = 0;
                for day in trading_day_slices(&self.calendar, now, lookback) {
                    let (open, close) = self.calendar.session_bounds(day, self.include_extended());
                    let to_ms = close.timestamp_millis().min(now_ms);
                    let from_ms = open.timestamp_millis();
                    if from_ms >= to_ms {
                        continue;
                    }
                    // 每个交易日一个分片，落库即检查点
                    stored += self.fetch_and_store_chunk(symbol, from_ms, to_ms).await?;
                }
                Ok(stored)
            }
        }
    }

    /// 拉取一个时间分片并落库
    ///
    /// 可重试错误按2^attempt加抖动退避，重试耗尽后返回错误；
    /// 上游无数据视为空分片成功
    pub async fn fetch_and_store_chunk(
        &self,
        symbol: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<usize> {
        let mut last_err = None;

        for attempt in 0..self.config.max_chunk_retries {
            self.limiter.acquire_with_backoff(self.quota_retries).await?;

            match self.api.get_candles(
                symbol,
                constants::FETCH_RESOLUTION,
                from_ms / 1000,
                to_ms / 1000,
            ).await {
                Ok(raw) => {
                    let include_extended = self.include_extended();
                    let filtered: Vec<Candle> = raw
                        .into_iter()
                        .filter(|c| {
                            Utc.timestamp_millis_opt(c.open_time)
                                .single()
                                .map(|dt| self.calendar.should_include(dt, include_extended))
                                .unwrap_or(false)
                        })
                        .collect();
                    let resampled = resample(&self.calendar, &filtered);
                    return self.db.upsert_candles_async(
                        symbol.to_string(),
                        constants::CANDLE_TIMEFRAME.to_string(),
                        resampled,
                        UpsertMode::Normal,
                    ).await;
                }
                Err(AppError::DataUnavailable(msg)) => {
                    debug!(target: "backfill", symbol = %symbol, msg = %msg, "分片无数据");
                    return Ok(0);
                }
                Err(e) if e.is_retryable() => {
                    let backoff = (1u64 << attempt) as f64
                        + rand::thread_rng().gen_range(0.0..2.0);
                    warn!(target: "backfill", symbol = %symbol, attempt = attempt + 1,
                        backoff_secs = backoff, error = %e, "分片拉取失败，退避重试");
                    tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            AppError::ApiError(format!("{} 分片重试耗尽", symbol))
        }))
    }

    /// 消化到期的延期队列条目
    pub async fn process_queue(&self) -> Result<()> {
        let now_ms = Utc::now().timestamp_millis();
        let items = self.db.due_queue_items(now_ms, self.config.queue_batch_size)?;
        if items.is_empty() {
            return Ok(());
        }

        info!(target: "backfill", count = items.len(), "开始消化补齐队列");

        for item in items {
            self.db.mark_queue_processing(item.id)?;
            match self.backfill_symbol(&item.symbol).await {
                Ok(n) => {
                    info!(target: "backfill", symbol = %item.symbol, stored = n,
                        attempts = item.attempts + 1, "队列任务完成");
                    self.db.mark_queue_completed(item.id)?;
                }
                Err(AppError::QuotaExhausted(msg)) => {
                    // 配额耗尽，本条失败且停止消化
                    warn!(target: "backfill", symbol = %item.symbol, msg = %msg,
                        "配额耗尽，停止消化队列");
                    self.db.mark_queue_failed(item.id)?;
                    return Ok(());
                }
                Err(e) => {
                    warn!(target: "backfill", symbol = %item.symbol, error = %e, "队列任务失败");
                    self.db.mark_queue_failed(item.id)?;
                }
            }
        }
        Ok(())
    }

    /// 断流补偿：对每个标的拉取单个缺口分片
    pub async fn gap_fill(&self, request: &GapFillRequest) -> Result<()> {
        info!(target: "backfill", symbols = request.symbols.len(),
            from_ms = request.from_ms, to_ms = request.to_ms, "开始断流补偿");

        for symbol in &request.symbols {
            match self.fetch_and_store_chunk(symbol, request.from_ms, request.to_ms).await {
                Ok(n) => {
                    debug!(target: "backfill", symbol = %symbol, stored = n, "补偿完成");
                }
                Err(AppError::QuotaExhausted(msg)) => {
                    warn!(target: "backfill", msg = %msg, "配额耗尽，中止补偿");
                    return Ok(());
                }
                Err(e) => {
                    warn!(target: "backfill", symbol = %symbol, error = %e, "补偿失败，跳过");
                }
            }
        }
        Ok(())
    }
}

/// 预算规划：整窗标的每个需要lookback次调用
///
/// 返回(本批可处理数, 需延期数)。预算不足的标的零调用直接延期
pub fn plan_within_budget(
    full_count: usize,
    lookback_days: i64,
    remaining_calls: i64,
) -> (usize, usize) {
    if lookback_days <= 0 {
        return (full_count, 0);
    }
    let fits = (remaining_calls / lookback_days).max(0) as usize;
    let process = full_count.min(fits);
    (process, full_count - process)
}

/// 每天可消化的延期标的数
pub fn deferred_per_day(daily_budget: i64, lookback_days: i64) -> i64 {
    (daily_budget / lookback_days.max(1)).max(1)
}

/// 延期任务的执行时间：未来第(1 + i/per_day)天的01:00 UTC
pub fn deferred_schedule(now: DateTime<Utc>, index: usize, per_day: i64) -> DateTime<Utc> {
    let day_offset = 1 + index as i64 / per_day.max(1);
    (now + ChronoDuration::days(day_offset))
        .date_naive()
        .and_hms_opt(DEFERRED_RUN_HOUR_UTC, 0, 0)
        .unwrap()
        .and_utc()
}

/// 回溯窗口内的交易日序列（升序），以各日正午ET为代表时刻
pub fn trading_day_slices(
    calendar: &SessionCalendar,
    now: DateTime<Utc>,
    lookback_days: i64,
) -> Vec<DateTime<Utc>> {
    let mut days = Vec::new();
    for offset in (0..lookback_days).rev() {
        let day = now - ChronoDuration::days(offset);
        if calendar.is_trading_day(day) {
            days.push(day);
        }
    }
    days
}

/// 将1分钟蜡烛重采样为5分钟蜡烛
///
/// 桶边界按ET墙钟对齐，会话开盘即桶起点。输入须按时间升序
pub fn resample(calendar: &SessionCalendar, candles: &[Candle]) -> Vec<Candle> {
    let mut out: Vec<Candle> = Vec::new();
    let mut current_bucket: Option<i64> = None;

    for candle in candles {
        let bucket = Utc
            .timestamp_millis_opt(candle.open_time)
            .single()
            .map(|dt| calendar.align_5min_boundary(dt).timestamp_millis())
            .unwrap_or(candle.open_time);

        if current_bucket == Some(bucket) {
            if let Some(agg) = out.last_mut() {
                agg.high = agg.high.max(candle.high);
                agg.low = agg.low.min(candle.low);
                agg.close = candle.close;
                agg.volume += candle.volume;
            }
        } else {
            out.push(Candle {
                open_time: bucket,
                open: candle.open,
                high: candle.high,
                low: candle.low,
                close: candle.close,
                volume: candle.volume,
            });
            current_bucket = Some(bucket);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 预算充足时全部处理，不足时按整数标的延期
    #[test]
    fn test_plan_within_budget() {
        // 10个标的 × 30天 = 300次，预算500够用
        assert_eq!(plan_within_budget(10, 30, 500), (10, 0));
        // 预算100只够3个标的
        assert_eq!(plan_within_budget(10, 30, 100), (3, 7));
        // 预算为0时全部延期
        assert_eq!(plan_within_budget(5, 30, 0), (0, 5));
    }

    /// 延期任务分布在未来的01:00 UTC
    #[test]
    fn test_deferred_schedule_spread() {
        let now = Utc.with_ymd_and_hms(2025, 6, 9, 15, 0, 0).unwrap();
        // 每天2个，前两个次日执行，第三个后天执行
        let s0 = deferred_schedule(now, 0, 2);
        let s2 = deferred_schedule(now, 2, 2);
        assert_eq!(s0, Utc.with_ymd_and_hms(2025, 6, 10, 1, 0, 0).unwrap());
        assert_eq!(s2, Utc.with_ymd_and_hms(2025, 6, 11, 1, 0, 0).unwrap());
    }

    /// 交易日切片跳过周末与节假日
    #[test]
    fn test_trading_day_slices_skip_non_trading() {
        let calendar = SessionCalendar::new();
        // 2025-07-07周一，回看5天覆盖独立日（07-04休市）与周末
        let now = Utc.with_ymd_and_hms(2025, 7, 7, 18, 0, 0).unwrap();
        let days = trading_day_slices(&calendar, now, 5);
        // 07-03(周四)与07-07(周一)是仅有的交易日
        assert_eq!(days.len(), 2);
        assert!(days[0] < days[1]);
    }

    /// 1分钟到5分钟重采样：开=首、高=最大、低=最小、收=末、量=累计
    #[test]
    fn test_resample_1m_to_5m() {
        let calendar = SessionCalendar::new();
        // 2025-06-09 09:30 ET = 13:30 UTC
        let base = Utc.with_ymd_and_hms(2025, 6, 9, 13, 30, 0).unwrap().timestamp_millis();
        let minute = 60_000;

        let one_min: Vec<Candle> = (0..7)
            .map(|i| Candle {
                open_time: base + i * minute,
                open: 10.0 + i as f64,
                high: 11.0 + i as f64,
                low: 9.0 + i as f64,
                close: 10.5 + i as f64,
                volume: 100.0,
            })
            .collect();

        let out = resample(&calendar, &one_min);
        assert_eq!(out.len(), 2);

        // 第一桶覆盖09:30-09:34的5根
        assert_eq!(out[0].open_time, base);
        assert_eq!(out[0].open, 10.0);
        assert_eq!(out[0].high, 15.0);
        assert_eq!(out[0].low, 9.0);
        assert_eq!(out[0].close, 14.5);
        assert_eq!(out[0].volume, 500.0);

        // 第二桶覆盖09:35起的2根
        assert_eq!(out[1].open_time, base + 5 * minute);
        assert_eq!(out[1].volume, 200.0);
    }
}
