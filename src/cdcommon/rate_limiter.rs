//! API配额限流模块
//!
//! 上游同时限制每日与每分钟调用量。每日计数跨进程重启持久化在
//! settings表中，UTC零点重置；分钟窗口只在内存中滚动。
//! 服务内所有REST调用共用同一个实例，否则配额统计失真

use crate::cdcommon::db::Database;
use crate::cdcommon::error::{AppError, Result};
use crate::cdcommon::models::RateLimitStats;
use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const SETTING_DATE: &str = "rate_limiter_date";
const SETTING_COUNT: &str = "rate_limiter_count";

#[derive(Debug)]
struct LimiterState {
    calls_today: u32,
    calls_this_minute: u32,
    minute_window_start: Instant,
    /// 与calls_today对应的UTC日期
    counted_date: String,
}

/// 配额限流器
#[derive(Debug)]
pub struct RateLimiter {
    db: Arc<Database>,
    daily_limit: u32,
    minute_limit: u32,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    /// 创建限流器，从数据库恢复当日已用配额
    pub fn new(db: Arc<Database>, daily_limit: u32, minute_limit: u32) -> Result<Self> {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let stored_date = db.get_setting(SETTING_DATE)?.unwrap_or_default();
        let stored_count = db.get_setting(SETTING_COUNT)?.unwrap_or_else(|| "0".to_string());

        let calls_today = if stored_date == today {
            stored_count.parse().unwrap_or(0)
        } else {
            // 新的一天，重置计数
            db.set_setting(SETTING_DATE, &today)?;
            db.set_setting(SETTING_COUNT, "0")?;
            0
        };

        info!(target: "rate_limiter", calls_today = calls_today, daily_limit = daily_limit,
            "限流器初始化完成");

        Ok(Self {
            db,
            daily_limit,
            minute_limit,
            state: Mutex::new(LimiterState {
                calls_today,
                calls_this_minute: 0,
                minute_window_start: Instant::now(),
                counted_date: today,
            }),
        })
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, LimiterState>> {
        self.state.lock()
            .map_err(|_| AppError::ChannelError("限流器状态锁中毒".to_string()))
    }

    /// 分钟窗口已满60秒则滚动，UTC日期变化则重置日计数
    fn roll_windows(state: &mut LimiterState) {
        if state.minute_window_start.elapsed() >= Duration::from_secs(60) {
            state.calls_this_minute = 0;
            state.minute_window_start = Instant::now();
        }
        let today = Utc::now().format("%Y-%m-%d").to_string();
        if state.counted_date != today {
            state.calls_today = 0;
            state.counted_date = today;
        }
    }

    /// 当前是否允许调用
    pub fn can_call(&self) -> Result<bool> {
        let mut state = self.lock_state()?;
        Self::roll_windows(&mut state);
        Ok(state.calls_today < self.daily_limit && state.calls_this_minute < self.minute_limit)
    }

    /// 记录一次调用
    ///
    /// 日计数在临界区内落库，并发调用的持久化顺序与计数顺序一致
    pub fn record_call(&self) -> Result<()> {
        let mut state = self.lock_state()?;
        Self::roll_windows(&mut state);
        state.calls_today += 1;
        state.calls_this_minute += 1;
        self.db.set_setting(SETTING_DATE, &state.counted_date)?;
        self.db.set_setting(SETTING_COUNT, &state.calls_today.to_string())?;
        Ok(())
    }

    /// 原子地检查并占用一次调用额度
    ///
    /// 检查与记账在同一临界区内完成，并发竞争下两个调用方不可能
    /// 同时通过最后一个额度。占用成功返回true，额度不足返回false
    pub fn try_acquire(&self) -> Result<bool> {
        let mut state = self.lock_state()?;
        Self::roll_windows(&mut state);

        if state.calls_today >= self.daily_limit || state.calls_this_minute >= self.minute_limit {
            return Ok(false);
        }

        state.calls_today += 1;
        state.calls_this_minute += 1;
        self.db.set_setting(SETTING_DATE, &state.counted_date)?;
        self.db.set_setting(SETTING_COUNT, &state.calls_today.to_string())?;
        Ok(true)
    }

    /// 距离下次可调用的等待秒数
    ///
    /// 日配额耗尽返回到UTC零点的秒数，分钟配额耗尽返回窗口剩余秒数
    pub fn delay_until_next_call(&self) -> Result<f64> {
        let mut state = self.lock_state()?;
        Self::roll_windows(&mut state);

        if state.calls_today < self.daily_limit && state.calls_this_minute < self.minute_limit {
            return Ok(0.0);
        }

        if state.calls_today >= self.daily_limit {
            let now = Utc::now();
            let tomorrow = (now + ChronoDuration::days(1))
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .unwrap()
                .and_utc();
            return Ok((tomorrow - now).num_milliseconds() as f64 / 1000.0);
        }

        let elapsed = state.minute_window_start.elapsed().as_secs_f64();
        Ok((60.0 - elapsed).max(0.0))
    }

    /// 等待并占用一次调用额度
    ///
    /// 指数退避（2^attempt加随机抖动）重试，超过max_retries后返回
    /// QuotaExhausted，由调用方决定延期处理
    pub async fn acquire_with_backoff(&self, max_retries: u32) -> Result<()> {
        for attempt in 0..max_retries {
            let delay = self.delay_until_next_call()?;
            if delay > 0.0 {
                info!(target: "rate_limiter", delay_secs = delay, "触及配额限制，等待");
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            }

            if self.try_acquire()? {
                return Ok(());
            }

            let backoff = (1u64 << attempt) as f64 + rand::thread_rng().gen_range(0.0..1.0);
            warn!(target: "rate_limiter", attempt = attempt + 1, backoff_secs = backoff,
                "获取调用额度失败，退避重试");
            tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
        }

        Err(AppError::QuotaExhausted(format!(
            "重试{}次后仍无法获取调用额度", max_retries
        )))
    }

    /// 状态快照
    pub fn stats(&self) -> Result<RateLimitStats> {
        let mut state = self.lock_state()?;
        Self::roll_windows(&mut state);
        Ok(RateLimitStats {
            calls_today: state.calls_today,
            daily_limit: self.daily_limit,
            calls_this_minute: state.calls_this_minute,
            minute_limit: self.minute_limit,
        })
    }

    /// 当日剩余配额
    pub fn remaining_today(&self) -> Result<u32> {
        let mut state = self.lock_state()?;
        Self::roll_windows(&mut state);
        Ok(self.daily_limit.saturating_sub(state.calls_today))
    }

    /// 把分钟窗口起点回拨指定秒数，用于测试窗口滚动
    #[cfg(test)]
    fn rewind_minute_window(&self, secs: u64) {
        let mut state = self.state.lock().expect("limiter state lock");
        state.minute_window_start = Instant::now()
            .checked_sub(Duration::from_secs(secs))
            .expect("instant underflow");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn limiter(daily: u32, minute: u32) -> (TempDir, Arc<Database>, RateLimiter) {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::new(dir.path().join("test.db"), 2, true).unwrap());
        let rl = RateLimiter::new(db.clone(), daily, minute).unwrap();
        (dir, db, rl)
    }

    /// 分钟配额耗尽后阻塞，等待时间不超过窗口长度
    #[test]
    fn test_minute_cap_blocks() {
        let (_dir, _db, rl) = limiter(100, 2);
        rl.record_call().unwrap();
        rl.record_call().unwrap();
        assert!(!rl.can_call().unwrap());

        let delay = rl.delay_until_next_call().unwrap();
        assert!(delay > 0.0 && delay <= 60.0);
    }

    /// 日配额耗尽后即便分钟窗口空闲也阻塞，等待到UTC零点
    #[test]
    fn test_daily_cap_blocks() {
        let (_dir, _db, rl) = limiter(2, 100);
        rl.record_call().unwrap();
        rl.record_call().unwrap();
        assert!(!rl.can_call().unwrap());

        let delay = rl.delay_until_next_call().unwrap();
        assert!(delay > 0.0 && delay <= 86_400.0);
        assert_eq!(rl.remaining_today().unwrap(), 0);
    }

    /// 日计数在同一数据库上重建限流器后保留
    #[test]
    fn test_daily_count_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::new(dir.path().join("test.db"), 2, true).unwrap());

        let rl = RateLimiter::new(db.clone(), 500, 60).unwrap();
        rl.record_call().unwrap();
        rl.record_call().unwrap();
        rl.record_call().unwrap();
        drop(rl);

        let rl2 = RateLimiter::new(db, 500, 60).unwrap();
        assert_eq!(rl2.stats().unwrap().calls_today, 3);
        // 分钟窗口不持久化
        assert_eq!(rl2.stats().unwrap().calls_this_minute, 0);
    }

    /// 配额可用时acquire立即成功并记账
    #[tokio::test]
    async fn test_acquire_records_call() {
        let (_dir, _db, rl) = limiter(500, 60);
        rl.acquire_with_backoff(3).await.unwrap();
        let stats = rl.stats().unwrap();
        assert_eq!(stats.calls_today, 1);
        assert_eq!(stats.calls_this_minute, 1);
    }

    /// 并发争抢最后几个额度时占用总数不超过上限
    #[test]
    fn test_try_acquire_never_exceeds_cap_under_contention() {
        let (_dir, db, rl) = limiter(100, 4);
        let rl = Arc::new(rl);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let rl = rl.clone();
                std::thread::spawn(move || rl.try_acquire().unwrap())
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|granted| *granted)
            .count();

        assert_eq!(granted, 4);
        let stats = rl.stats().unwrap();
        assert_eq!(stats.calls_this_minute, 4);
        assert_eq!(stats.calls_today, 4);
        // 持久化计数与内存计数一致
        assert_eq!(db.get_setting("rate_limiter_count").unwrap(), Some("4".to_string()));
    }

    /// 分钟窗口满60秒后滚动，配额重新可用
    #[test]
    fn test_minute_window_releases_after_rollover() {
        let (_dir, _db, rl) = limiter(100, 2);
        rl.record_call().unwrap();
        rl.record_call().unwrap();
        assert!(!rl.can_call().unwrap());

        rl.rewind_minute_window(61);
        assert!(rl.can_call().unwrap());
        let stats = rl.stats().unwrap();
        assert_eq!(stats.calls_this_minute, 0);
        // 日计数不随分钟窗口重置
        assert_eq!(stats.calls_today, 2);
        assert!(rl.try_acquire().unwrap());
    }
}
