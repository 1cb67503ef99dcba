//! 盘后对账模块
//!
//! 每个交易日收盘后用上游官方复权数据校正实时聚合的序列。
//! 已对账日期持久化在settings中保证幂等，整个服务共用一个
//! 对账日期游标。单个标的失败不影响其余标的

use crate::cdcommon::api::MarketDataApi;
use crate::cdcommon::calendar::SessionCalendar;
use crate::cdcommon::config::{constants, BackfillConfig};
use crate::cdcommon::db::{Database, UpsertMode};
use crate::cdcommon::models::{Candle, ReconciliationRecord, ReconciliationStats};
use crate::cdcommon::rate_limiter::RateLimiter;
use crate::cdcommon::{AppError, Result};
use crate::cddata::backfill::resample;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// 数据库设置键：最近完成对账的交易日
const SETTING_LAST_RECONCILED: &str = "last_reconciled_date";

/// 向前扫描目标交易日的最大天数
const SESSION_SCAN_DAYS: i64 = 5;

/// 盘后对账服务
pub struct ReconciliationService {
    db: Arc<Database>,
    api: MarketDataApi,
    limiter: Arc<RateLimiter>,
    calendar: SessionCalendar,
    config: BackfillConfig,
    quota_retries: u32,
}

impl ReconciliationService {
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
        }
    }

    /// 对账只在常规交易时段之外运行，避免与实时写入竞争配额
    pub fn should_run(&self, now: DateTime<Utc>) -> bool {
        !self.calendar.is_regular_hours(now)
    }

    /// 最近一个已结束的交易日（向前最多扫描5个日历日）
    pub fn target_session(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        for offset in 1..=SESSION_SCAN_DAYS {
            let day = now - ChronoDuration::days(offset);
            if self.calendar.is_trading_day(day) {
                return Some(day);
            }
        }
        None
    }

    fn session_date_key(&self, day: DateTime<Utc>) -> String {
        day.with_timezone(&chrono_tz::America::New_York)
            .format("%Y-%m-%d")
            .to_string()
    }

    /// 条件满足时执行一轮对账
    ///
    /// 目标交易日已对账过则直接返回。配额耗尽会中止本轮且不推进
    /// 对账游标，下个调度周期重新尝试
    #[instrument(skip_all, fields(symbols = symbols.len()))]
    pub async fn run_if_due(&self, symbols: &[String]) -> Result<()> {
        let now = Utc::now();
        if !self.should_run(now) {
            return Ok(());
        }

        let Some(session_day) = self.target_session(now) else {
            warn!(target: "reconciliation", "向前扫描未找到交易日");
            return Ok(());
        };
        let date_key = self.session_date_key(session_day);

        if self.db.get_setting(SETTING_LAST_RECONCILED)?.as_deref() == Some(date_key.as_str()) {
            debug!(target: "reconciliation", date = %date_key, "该交易日已对账，跳过");
            return Ok(());
        }

        info!(target: "reconciliation", date = %date_key, "开始盘后对账");
        let mut updated_total = 0i64;

        for symbol in symbols {
            match self.reconcile_symbol(symbol, session_day, &date_key).await {
                Ok(updated) => {
                    updated_total += updated;
                }
                Err(AppError::QuotaExhausted(msg)) => {
                    // 不推进游标，等下一个窗口重跑
                    warn!(target: "reconciliation", msg = %msg, "配额耗尽，中止本轮对账");
                    return Ok(());
                }
                Err(e) => {
                    warn!(target: "reconciliation", symbol = %symbol, error = %e,
                        "标的对账失败，跳过");
                    let record = ReconciliationRecord {
                        symbol: symbol.clone(),
                        timeframe: constants::CANDLE_TIMEFRAME.to_string(),
                        session_date: date_key.clone(),
                        bars_updated: 0,
                        reconciled_at: Utc::now().timestamp_millis(),
                    };
                    self.db.insert_reconciliation(&record)?;
                }
            }
        }

        self.db.set_setting(SETTING_LAST_RECONCILED, &date_key)?;
        info!(target: "reconciliation", date = %date_key, bars_updated = updated_total,
            "对账完成");
        Ok(())
    }

    /// 对账单个标的
    ///
    /// 会话窗口内没有实时数据的标的不消耗调用直接跳过
    async fn reconcile_symbol(
        &self,
        symbol: &str,
        session_day: DateTime<Utc>,
        date_key: &str,
    ) -> Result<i64> {
        let include_extended = self.db.include_extended_setting(self.config.include_extended_hours);
        let (open, close) = self.calendar.session_bounds(session_day, include_extended);
        let from_ms = open.timestamp_millis();
        let to_ms = close.timestamp_millis();

        let live_count = self.db.count_candles(
            symbol,
            constants::CANDLE_TIMEFRAME,
            from_ms,
            to_ms,
        )?;
        if live_count == 0 {
            debug!(target: "reconciliation", symbol = %symbol, date = %date_key,
                "会话窗口内无实时数据，跳过");
            return Ok(0);
        }

        self.limiter.acquire_with_backoff(self.quota_retries).await?;

        let raw = match self.api.get_candles(
            symbol,
            constants::FETCH_RESOLUTION,
            from_ms / 1000,
            to_ms / 1000,
        ).await {
            Ok(candles) => candles,
            Err(AppError::DataUnavailable(msg)) => {
                debug!(target: "reconciliation", symbol = %symbol, msg = %msg, "官方数据为空");
                return Ok(0);
            }
            Err(e) => return Err(e),
        };

        let filtered: Vec<Candle> = raw
            .into_iter()
            .filter(|c| {
                Utc.timestamp_millis_opt(c.open_time)
                    .single()
                    .map(|dt| self.calendar.should_include(dt, include_extended))
                    .unwrap_or(false)
            })
            .collect();
        let official = resample(&self.calendar, &filtered);

        let updated = self.db.upsert_candles_async(
            symbol.to_string(),
            constants::CANDLE_TIMEFRAME.to_string(),
            official,
            UpsertMode::Reconcile,
        ).await? as i64;

        let record = ReconciliationRecord {
            symbol: symbol.to_string(),
            timeframe: constants::CANDLE_TIMEFRAME.to_string(),
            session_date: date_key.to_string(),
            bars_updated: updated,
            reconciled_at: Utc::now().timestamp_millis(),
        };
        self.db.insert_reconciliation(&record)?;

        if updated > 0 {
            info!(target: "reconciliation", symbol = %symbol, date = %date_key,
                bars_updated = updated, "标的对账完成，存在修正");
        }
        Ok(updated)
    }

    /// 对账状态快照
    pub fn stats(&self) -> Result<ReconciliationStats> {
        let now_ms = Utc::now().timestamp_millis();
        let (runs, bars) = self.db.reconciliation_stats_7d(now_ms)?;
        Ok(ReconciliationStats {
            last_reconciled_date: self.db.get_setting(SETTING_LAST_RECONCILED)?,
            runs_last_7d: runs,
            bars_updated_last_7d: bars,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdcommon::config::ApiConfig;
    use tempfile::TempDir;

    fn service() -> (TempDir, Arc<Database>, ReconciliationService) {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::new(dir.path().join("test.db"), 2, true).unwrap());
        let limiter = Arc::new(RateLimiter::new(db.clone(), 500, 60).unwrap());
        let api_config = ApiConfig {
            api_key: "test".to_string(),
            ..ApiConfig::default()
        };
        let api = MarketDataApi::new(&api_config).unwrap();
        let svc = ReconciliationService::new(
            db.clone(),
            api,
            limiter,
            BackfillConfig::default(),
            3,
        );
        (dir, db, svc)
    }

    /// 常规交易时段内不运行对账
    #[test]
    fn test_should_run_outside_regular_hours() {
        let (_dir, _db, svc) = service();
        // 2025-06-09 周一 10:00 ET = 14:00 UTC，盘中
        assert!(!svc.should_run(Utc.with_ymd_and_hms(2025, 6, 9, 14, 0, 0).unwrap()));
        // 21:00 ET = 次日01:00 UTC，盘后
        assert!(svc.should_run(Utc.with_ymd_and_hms(2025, 6, 10, 1, 0, 0).unwrap()));
        // 周六全天可运行
        assert!(svc.should_run(Utc.with_ymd_and_hms(2025, 6, 14, 15, 0, 0).unwrap()));
    }

    /// 目标交易日跳过周末与节假日
    #[test]
    fn test_target_session_skips_non_trading_days() {
        let (_dir, _db, svc) = service();
        // 2025-07-07周一，前一交易日为07-03周四（07-04休市，05/06周末）
        let now = Utc.with_ymd_and_hms(2025, 7, 7, 2, 0, 0).unwrap();
        let target = svc.target_session(now).unwrap();
        assert_eq!(svc.session_date_key(target), "2025-07-03");

        // 普通周二的目标是周一
        let tuesday = Utc.with_ymd_and_hms(2025, 6, 10, 2, 0, 0).unwrap();
        let target = svc.target_session(tuesday).unwrap();
        assert_eq!(svc.session_date_key(target), "2025-06-09");
    }

    /// 已对账日期的幂等保护
    #[tokio::test]
    async fn test_already_reconciled_guard() {
        let (_dir, db, svc) = service();
        let now = Utc::now();
        if let Some(target) = svc.target_session(now) {
            let date_key = svc.session_date_key(target);
            db.set_setting("last_reconciled_date", &date_key).unwrap();
            // 游标已指向目标日期，无HTTP调用直接返回
            svc.run_if_due(&["AAPL".to_string()]).await.unwrap();
            assert_eq!(
                db.get_setting("last_reconciled_date").unwrap(),
                Some(date_key)
            );
        }
    }
}
