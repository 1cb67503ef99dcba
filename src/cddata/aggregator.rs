//! 成交到蜡烛的实时聚合模块
//!
//! 每个标的同一时刻最多一根未完成蜡烛。tick处理为O(1)纯内存操作，
//! 不做任何I/O，完成的蜡烛进入缓冲区由落库任务定期取走

use crate::cdcommon::models::{Candle, TradeTick};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::warn;

/// 未完成蜡烛的内部状态
#[derive(Debug, Clone)]
struct OpenCandle {
    open_time_ms: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

impl OpenCandle {
    fn from_tick(open_time_ms: i64, tick: &TradeTick) -> Self {
        Self {
            open_time_ms,
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: tick.volume,
        }
    }

    fn to_candle(&self) -> Candle {
        Candle {
            open_time: self.open_time_ms,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

/// 蜡烛聚合器
#[derive(Debug)]
pub struct CandleAggregator {
    /// 蜡烛周期（毫秒）
    period_ms: i64,
    /// 每个标的的当前未完成蜡烛
    current: HashMap<String, OpenCandle>,
    /// 已完成待落库的蜡烛
    completed: Vec<(String, Candle)>,
    /// 完成蜡烛的订阅方
    subscribers: Vec<mpsc::UnboundedSender<(String, Candle)>>,
    trades_processed: u64,
    ticks_dropped: u64,
}

impl CandleAggregator {
    pub fn new(period_ms: i64) -> Self {
        Self {
            period_ms,
            current: HashMap::new(),
            completed: Vec::new(),
            subscribers: Vec::new(),
            trades_processed: 0,
            ticks_dropped: 0,
        }
    }

    /// 订阅完成蜡烛流
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<(String, Candle)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// 处理一笔成交
    ///
    /// 同一桶内更新高低收与累计量；进入新桶时旧蜡烛完成、新蜡烛开启。
    /// 晚到的旧桶成交直接丢弃，已完成的蜡烛不再变动
    pub fn process_tick(&mut self, tick: &TradeTick) {
        let bucket_ms = (tick.timestamp_ms / self.period_ms) * self.period_ms;

        match self.current.get_mut(&tick.symbol) {
            Some(current) => {
                if bucket_ms == current.open_time_ms {
                    current.high = current.high.max(tick.price);
                    current.low = current.low.min(tick.price);
                    current.close = tick.price;
                    current.volume += tick.volume;
                } else if bucket_ms > current.open_time_ms {
                    let finished = current.to_candle();
                    *current = OpenCandle::from_tick(bucket_ms, tick);
                    self.emit(tick.symbol.clone(), finished);
                } else {
                    self.ticks_dropped += 1;
                    warn!(target: "aggregator", symbol = %tick.symbol,
                        tick_bucket = bucket_ms, open_bucket = current.open_time_ms,
                        "丢弃乱序成交");
                    return;
                }
            }
            None => {
                self.current.insert(
                    tick.symbol.clone(),
                    OpenCandle::from_tick(bucket_ms, tick),
                );
            }
        }
        self.trades_processed += 1;
    }

    fn emit(&mut self, symbol: String, candle: Candle) {
        for tx in &self.subscribers {
            let _ = tx.send((symbol.clone(), candle.clone()));
        }
        self.completed.push((symbol, candle));
    }

    /// 强制完成所有未结蜡烛，用于停机前保全已接收的成交量
    pub fn force_close_all(&mut self) {
        let open: Vec<(String, OpenCandle)> = self.current.drain().collect();
        for (symbol, bar) in open {
            let candle = bar.to_candle();
            self.emit(symbol, candle);
        }
    }

    /// 取走全部已完成蜡烛
    pub fn take_completed(&mut self) -> Vec<(String, Candle)> {
        std::mem::take(&mut self.completed)
    }

    /// 落库失败的蜡烛放回缓冲区，等待下一轮重试
    pub fn requeue_completed(&mut self, candles: Vec<(String, Candle)>) {
        self.completed.extend(candles);
    }

    pub fn trades_processed(&self) -> u64 {
        self.trades_processed
    }

    pub fn ticks_dropped(&self) -> u64 {
        self.ticks_dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: i64 = 300_000; // 5分钟

    fn tick(symbol: &str, price: f64, volume: f64, ts: i64) -> TradeTick {
        TradeTick {
            symbol: symbol.to_string(),
            price,
            volume,
            timestamp_ms: ts,
        }
    }

    /// 同一周期内的成交聚合为一根蜡烛：开=首笔，高=最高，低=最低，收=末笔，量=累计
    #[test]
    fn test_ticks_within_period_build_one_candle() {
        let mut agg = CandleAggregator::new(PERIOD);
        let base = 1_700_000_100_000 / PERIOD * PERIOD;

        agg.process_tick(&tick("AAPL", 10.0, 100.0, base));
        agg.process_tick(&tick("AAPL", 12.0, 50.0, base + 60_000));
        agg.process_tick(&tick("AAPL", 9.0, 25.0, base + 240_000));

        // 周期未结束，没有完成的蜡烛
        assert!(agg.take_completed().is_empty());

        // 下一周期的首笔成交触发滚动
        agg.process_tick(&tick("AAPL", 11.0, 10.0, base + PERIOD));
        let completed = agg.take_completed();
        assert_eq!(completed.len(), 1);

        let (symbol, candle) = &completed[0];
        assert_eq!(symbol, "AAPL");
        assert_eq!(candle.open_time, base);
        assert_eq!(candle.open, 10.0);
        assert_eq!(candle.high, 12.0);
        assert_eq!(candle.low, 9.0);
        assert_eq!(candle.close, 9.0);
        assert_eq!(candle.volume, 175.0);
        assert_eq!(agg.trades_processed(), 4);

        // 新开的蜡烛以触发滚动的成交初始化
        agg.force_close_all();
        let next = agg.take_completed();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].1.open_time, base + PERIOD);
        assert_eq!(next[0].1.open, 11.0);
        assert_eq!(next[0].1.high, 11.0);
        assert_eq!(next[0].1.low, 11.0);
        assert_eq!(next[0].1.close, 11.0);
        assert_eq!(next[0].1.volume, 10.0);
    }

    /// 乱序成交被丢弃，已完成蜡烛不变
    #[test]
    fn test_out_of_order_tick_dropped() {
        let mut agg = CandleAggregator::new(PERIOD);
        let base = 1_700_000_100_000 / PERIOD * PERIOD;

        agg.process_tick(&tick("AAPL", 10.0, 100.0, base));
        agg.process_tick(&tick("AAPL", 11.0, 10.0, base + PERIOD));
        // 属于上一周期的晚到成交
        agg.process_tick(&tick("AAPL", 99.0, 999.0, base + 100));

        assert_eq!(agg.ticks_dropped(), 1);
        let completed = agg.take_completed();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].1.close, 10.0);
        assert_eq!(completed[0].1.volume, 100.0);
    }

    /// 不同标的互不影响
    #[test]
    fn test_symbols_are_independent() {
        let mut agg = CandleAggregator::new(PERIOD);
        let base = 1_700_000_100_000 / PERIOD * PERIOD;

        agg.process_tick(&tick("AAPL", 10.0, 100.0, base));
        agg.process_tick(&tick("MSFT", 300.0, 5.0, base));
        agg.process_tick(&tick("AAPL", 11.0, 10.0, base + PERIOD));

        let completed = agg.take_completed();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].0, "AAPL");
    }

    /// 强制收盘输出全部未结蜡烛
    #[test]
    fn test_force_close_all() {
        let mut agg = CandleAggregator::new(PERIOD);
        let base = 1_700_000_100_000 / PERIOD * PERIOD;

        agg.process_tick(&tick("AAPL", 10.0, 100.0, base));
        agg.process_tick(&tick("MSFT", 300.0, 5.0, base));

        agg.force_close_all();
        let completed = agg.take_completed();
        assert_eq!(completed.len(), 2);
        let total_volume: f64 = completed.iter().map(|(_, c)| c.volume).sum();
        assert_eq!(total_volume, 105.0);
    }

    /// 订阅方收到完成的蜡烛
    #[test]
    fn test_subscriber_receives_completed() {
        let mut agg = CandleAggregator::new(PERIOD);
        let mut rx = agg.subscribe();
        let base = 1_700_000_100_000 / PERIOD * PERIOD;

        agg.process_tick(&tick("AAPL", 10.0, 100.0, base));
        agg.process_tick(&tick("AAPL", 11.0, 10.0, base + PERIOD));

        let (symbol, candle) = rx.try_recv().unwrap();
        assert_eq!(symbol, "AAPL");
        assert_eq!(candle.close, 10.0);
    }
}
