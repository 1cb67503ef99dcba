//! 美股交易日历模块
//!
//! 所有判断以 America/New_York 时区进行，完整处理夏令时切换。
//! 节假日与提前收盘表为静态维护，来源：NYSE官方日历，每年更新

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::America::New_York;
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use std::collections::HashSet;

/// NYSE/NASDAQ休市日 (2024-2026)
static MARKET_HOLIDAYS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        // 2024
        "2024-01-01", // New Year's Day
        "2024-01-15", // Martin Luther King Jr. Day
        "2024-02-19", // Presidents' Day
        "2024-03-29", // Good Friday
        "2024-05-27", // Memorial Day
        "2024-06-19", // Juneteenth
        "2024-07-04", // Independence Day
        "2024-09-02", // Labor Day
        "2024-11-28", // Thanksgiving Day
        "2024-12-25", // Christmas Day
        // 2025
        "2025-01-01",
        "2025-01-20",
        "2025-02-17",
        "2025-04-18",
        "2025-05-26",
        "2025-06-19",
        "2025-07-04",
        "2025-09-01",
        "2025-11-27",
        "2025-12-25",
        // 2026
        "2026-01-01",
        "2026-01-19",
        "2026-02-16",
        "2026-04-03",
        "2026-05-25",
        "2026-06-19",
        "2026-07-04", // 周六，按观察日休市
        "2026-09-07",
        "2026-11-26",
        "2026-12-25",
    ]
    .into_iter()
    .collect()
});

/// 提前收盘日（13:00 ET收盘），感恩节次日与平安夜
static EARLY_CLOSE_DAYS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "2024-11-29",
        "2024-12-24",
        "2025-11-28",
        "2025-12-24",
        "2026-11-27",
        "2026-12-24",
    ]
    .into_iter()
    .collect()
});

/// 美股交易时段日历
///
/// 常规时段 09:30-16:00 ET，盘前盘后 04:00-09:30 与 16:00-20:00 ET
#[derive(Debug, Clone, Default)]
pub struct SessionCalendar;

impl SessionCalendar {
    pub fn new() -> Self {
        Self
    }

    fn to_eastern(&self, dt: DateTime<Utc>) -> DateTime<Tz> {
        dt.with_timezone(&New_York)
    }

    fn date_key(&self, dt: DateTime<Utc>) -> String {
        self.to_eastern(dt).format("%Y-%m-%d").to_string()
    }

    /// 将ET本地时间转回UTC
    ///
    /// 夏令时切换产生歧义或空洞时取较早的有效解释；
    /// 交易时段时间点不会落在切换区间内（切换发生在02:00 ET）
    fn eastern_to_utc(&self, et: chrono::NaiveDateTime) -> DateTime<Utc> {
        match New_York.from_local_datetime(&et).earliest() {
            Some(dt) => dt.with_timezone(&Utc),
            None => New_York
                .from_local_datetime(&(et + Duration::hours(1)))
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap()),
        }
    }

    /// 是否为交易日（周一至周五且非休市日）
    pub fn is_trading_day(&self, dt: DateTime<Utc>) -> bool {
        let et = self.to_eastern(dt);
        if matches!(et.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        !MARKET_HOLIDAYS.contains(self.date_key(dt).as_str())
    }

    /// 是否处于常规交易时段 [09:30, 16:00) ET
    pub fn is_regular_hours(&self, dt: DateTime<Utc>) -> bool {
        if !self.is_trading_day(dt) {
            return false;
        }
        let t = self.to_eastern(dt).time();
        t >= NaiveTime::from_hms_opt(9, 30, 0).unwrap()
            && t < NaiveTime::from_hms_opt(16, 0, 0).unwrap()
    }

    /// 是否处于盘前盘后时段 [04:00, 09:30) 或 [16:00, 20:00) ET
    pub fn is_extended_hours(&self, dt: DateTime<Utc>) -> bool {
        if !self.is_trading_day(dt) {
            return false;
        }
        let t = self.to_eastern(dt).time();
        let premarket_open = NaiveTime::from_hms_opt(4, 0, 0).unwrap();
        let regular_open = NaiveTime::from_hms_opt(9, 30, 0).unwrap();
        let regular_close = NaiveTime::from_hms_opt(16, 0, 0).unwrap();
        let postmarket_close = NaiveTime::from_hms_opt(20, 0, 0).unwrap();

        (t >= premarket_open && t < regular_open) || (t >= regular_close && t < postmarket_close)
    }

    /// 按设置判断时间戳是否纳入会话
    pub fn should_include(&self, dt: DateTime<Utc>, include_extended: bool) -> bool {
        if include_extended {
            self.is_regular_hours(dt) || self.is_extended_hours(dt)
        } else {
            self.is_regular_hours(dt)
        }
    }

    /// 给定时刻所在ET日历日的开盘时间（09:30 ET），UTC返回
    pub fn session_open(&self, dt: DateTime<Utc>) -> DateTime<Utc> {
        let date = self.to_eastern(dt).date_naive();
        self.eastern_to_utc(date.and_hms_opt(9, 30, 0).unwrap())
    }

    /// 交易会话边界（UTC）
    ///
    /// 含盘前盘后时为 [04:00, 20:00) ET，否则 [09:30, 16:00) ET
    pub fn session_bounds(
        &self,
        dt: DateTime<Utc>,
        include_extended: bool,
    ) -> (DateTime<Utc>, DateTime<Utc>) {
        let date = self.to_eastern(dt).date_naive();
        let (open, close) = if include_extended {
            ((4, 0), (20, 0))
        } else {
            ((9, 30), (16, 0))
        };
        (
            self.eastern_to_utc(date.and_hms_opt(open.0, open.1, 0).unwrap()),
            self.eastern_to_utc(date.and_hms_opt(close.0, close.1, 0).unwrap()),
        )
    }

    /// 将时间戳按ET墙钟对齐到5分钟边界（向下取整）
    ///
    /// 例如 09:32:15 ET 对齐为 09:30:00 ET
    pub fn align_5min_boundary(&self, dt: DateTime<Utc>) -> DateTime<Utc> {
        let et = self.to_eastern(dt);
        let minute = (et.minute() / 5) * 5;
        let aligned = et
            .with_minute(minute)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(et);
        aligned.with_timezone(&Utc)
    }

    /// 下一个交易日（同一ET时刻）
    pub fn next_trading_day(&self, dt: DateTime<Utc>) -> DateTime<Utc> {
        let mut day = dt + Duration::days(1);
        while !self.is_trading_day(day) {
            day += Duration::days(1);
        }
        day
    }

    /// 上一个交易日（同一ET时刻）
    pub fn prev_trading_day(&self, dt: DateTime<Utc>) -> DateTime<Utc> {
        let mut day = dt - Duration::days(1);
        while !self.is_trading_day(day) {
            day -= Duration::days(1);
        }
        day
    }

    /// 是否为提前收盘日
    pub fn is_early_close(&self, dt: DateTime<Utc>) -> bool {
        EARLY_CLOSE_DAYS.contains(self.date_key(dt).as_str())
    }

    /// 当日收盘时间，常规16:00 ET，提前收盘日13:00 ET
    pub fn market_close_time(&self, dt: DateTime<Utc>) -> DateTime<Utc> {
        let date = self.to_eastern(dt).date_naive();
        let close = if self.is_early_close(dt) {
            date.and_hms_opt(13, 0, 0).unwrap()
        } else {
            date.and_hms_opt(16, 0, 0).unwrap()
        };
        self.eastern_to_utc(close)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    /// 节假日与周末不是交易日，相邻工作日是
    #[test]
    fn test_trading_day_holidays_and_weekends() {
        let cal = SessionCalendar::new();
        // 2025-07-04 独立日休市
        assert!(!cal.is_trading_day(utc(2025, 7, 4, 15, 0)));
        // 前一个周四是交易日
        assert!(cal.is_trading_day(utc(2025, 7, 3, 15, 0)));
        // 周六周日
        assert!(!cal.is_trading_day(utc(2025, 7, 5, 15, 0)));
        assert!(!cal.is_trading_day(utc(2025, 7, 6, 15, 0)));
        // 感恩节
        assert!(!cal.is_trading_day(utc(2025, 11, 27, 15, 0)));
    }

    /// 夏令时切换前后开盘时间的UTC表示不同
    #[test]
    fn test_session_open_across_dst_transition() {
        let cal = SessionCalendar::new();
        // 2025-03-07 (EST, UTC-5): 09:30 ET = 14:30 UTC
        let before = cal.session_open(utc(2025, 3, 7, 18, 0));
        assert_eq!(before, utc(2025, 3, 7, 14, 30));
        // 2025-03-10 (EDT, UTC-4): 09:30 ET = 13:30 UTC
        let after = cal.session_open(utc(2025, 3, 10, 18, 0));
        assert_eq!(after, utc(2025, 3, 10, 13, 30));
    }

    /// 常规与盘前盘后时段边界判断（夏季 EDT = UTC-4）
    #[test]
    fn test_hours_classification() {
        let cal = SessionCalendar::new();
        // 2025-06-09 周一
        // 09:30 ET = 13:30 UTC 在常规时段内
        assert!(cal.is_regular_hours(utc(2025, 6, 9, 13, 30)));
        // 16:00 ET 不在常规时段内（半开区间）
        assert!(!cal.is_regular_hours(utc(2025, 6, 9, 20, 0)));
        // 16:00 ET 属于盘后
        assert!(cal.is_extended_hours(utc(2025, 6, 9, 20, 0)));
        // 08:00 ET 属于盘前
        assert!(cal.is_extended_hours(utc(2025, 6, 9, 12, 0)));
        assert!(!cal.is_regular_hours(utc(2025, 6, 9, 12, 0)));
        // 21:00 ET 不属于任何时段
        assert!(!cal.is_extended_hours(utc(2025, 6, 10, 1, 0)));

        assert!(cal.should_include(utc(2025, 6, 9, 12, 0), true));
        assert!(!cal.should_include(utc(2025, 6, 9, 12, 0), false));
    }

    /// ET墙钟5分钟对齐
    #[test]
    fn test_align_5min_boundary() {
        let cal = SessionCalendar::new();
        // 09:32:15 ET = 13:32:15 UTC (EDT)
        let ts = Utc.with_ymd_and_hms(2025, 6, 9, 13, 32, 15).unwrap();
        assert_eq!(cal.align_5min_boundary(ts), utc(2025, 6, 9, 13, 30));
        // 已对齐的时间戳不变
        assert_eq!(cal.align_5min_boundary(utc(2025, 6, 9, 13, 35)), utc(2025, 6, 9, 13, 35));
    }

    /// 跨周末与节假日寻找前后交易日
    #[test]
    fn test_next_prev_trading_day() {
        let cal = SessionCalendar::new();
        // 2025-07-03 周四，次日独立日休市，下一交易日为周一07-07
        let next = cal.next_trading_day(utc(2025, 7, 3, 15, 0));
        assert_eq!(cal.to_eastern(next).date_naive().to_string(), "2025-07-07");
        // 周一07-07的前一交易日为周四07-03
        let prev = cal.prev_trading_day(utc(2025, 7, 7, 15, 0));
        assert_eq!(cal.to_eastern(prev).date_naive().to_string(), "2025-07-03");
    }

    /// 提前收盘日13:00 ET收盘
    #[test]
    fn test_early_close() {
        let cal = SessionCalendar::new();
        let christmas_eve = utc(2025, 12, 24, 15, 0);
        assert!(cal.is_early_close(christmas_eve));
        // 13:00 ET = 18:00 UTC (EST)
        assert_eq!(cal.market_close_time(christmas_eve), utc(2025, 12, 24, 18, 0));

        let normal_day = utc(2025, 6, 9, 15, 0);
        assert!(!cal.is_early_close(normal_day));
        // 16:00 ET = 20:00 UTC (EDT)
        assert_eq!(cal.market_close_time(normal_day), utc(2025, 6, 9, 20, 0));
    }

    /// 会话边界（含与不含盘前盘后）
    #[test]
    fn test_session_bounds() {
        let cal = SessionCalendar::new();
        let dt = utc(2025, 6, 9, 15, 0);
        let (open, close) = cal.session_bounds(dt, false);
        assert_eq!(open, utc(2025, 6, 9, 13, 30));
        assert_eq!(close, utc(2025, 6, 9, 20, 0));

        let (ext_open, ext_close) = cal.session_bounds(dt, true);
        assert_eq!(ext_open, utc(2025, 6, 9, 8, 0));
        assert_eq!(ext_close, utc(2025, 6, 10, 0, 0));
    }
}
