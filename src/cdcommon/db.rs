use crate::cdcommon::error::{AppError, Result};
use crate::cdcommon::models::{BackfillQueueItem, Candle, QueueStatus, ReconciliationRecord};
use tracing::{debug, info, instrument};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tokio::task;

// 数据库连接池类型
pub type DbPool = Pool<SqliteConnectionManager>;

/// 写入模式
///
/// Normal用于实时/补齐写入，时间戳冲突时保留已有数据；
/// Reconcile用于盘后对账，以官方数据覆盖并统计差异
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertMode {
    Normal,
    Reconcile,
}

/// 蜡烛数据存储
///
/// 每个(标的, 周期)一张表，open_time为主键保证序列去重有序。
/// 另有settings、backfill_queue、reconciliations三张共享表
#[derive(Debug)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// 创建数据库连接池，启用WAL模式与性能参数
    #[instrument(skip(db_path), fields(db_path = %db_path.as_ref().display()), err)]
    pub fn new<P: AsRef<Path>>(db_path: P, pool_size: u32, enable_wal: bool) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        info!(target: "db", "使用SQLite数据库: {}", db_path.display());

        let manager = SqliteConnectionManager::file(db_path).with_init(move |conn| {
            let journal_mode = if enable_wal { "WAL" } else { "DELETE" };
            conn.execute_batch(&format!("
                PRAGMA journal_mode = {};
                PRAGMA synchronous = NORMAL;
                PRAGMA temp_store = MEMORY;
                PRAGMA busy_timeout = 5000;
            ", journal_mode))
        });

        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(|e| AppError::DatabaseError(format!("创建连接池失败: {}", e)))?;

        let db = Self { pool };
        db.ensure_shared_tables()?;
        Ok(db)
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get()
            .map_err(|e| AppError::DatabaseError(format!("获取数据库连接失败: {}", e)))
    }

    /// 创建共享表（settings、补齐队列、对账审计）
    fn ensure_shared_tables(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS backfill_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                scheduled_for INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_queue_due
                ON backfill_queue (status, scheduled_for);
            CREATE TABLE IF NOT EXISTS reconciliations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                session_date TEXT NOT NULL,
                bars_updated INTEGER NOT NULL,
                reconciled_at INTEGER NOT NULL
            );"
        ).map_err(|e| AppError::DatabaseError(format!("创建共享表失败: {}", e)))?;
        Ok(())
    }

    /// 序列表名，如 c_aapl_5m
    fn table_name(symbol: &str, timeframe: &str) -> String {
        let symbol_lower = symbol.to_lowercase().replace('.', "_");
        format!("c_{}_{}", symbol_lower, timeframe.to_lowercase())
    }

    fn ensure_series_table(conn: &rusqlite::Connection, table_name: &str) -> Result<()> {
        let create_table_sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                open_time INTEGER PRIMARY KEY,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL
            )",
            table_name
        );

        conn.execute(&create_table_sql, [])
            .map_err(|e| AppError::DatabaseError(format!("创建表 {} 失败: {}", table_name, e)))?;
        Ok(())
    }

    /// 批量写入蜡烛，单个事务内完成
    ///
    /// Normal模式：已有时间戳保持不变，只插入新行；
    /// Reconcile模式：已有行字段有差异时覆盖，差异行与新行都计入返回值
    pub fn upsert_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        candles: &[Candle],
        mode: UpsertMode,
    ) -> Result<usize> {
        if candles.is_empty() {
            return Ok(0);
        }

        let table_name = Self::table_name(symbol, timeframe);
        let mut conn = self.conn()?;
        Self::ensure_series_table(&conn, &table_name)?;

        let tx = conn.transaction()
            .map_err(|e| AppError::DatabaseError(format!("开始事务失败: {}", e)))?;

        let mut added = 0;
        let mut changed = 0;

        for candle in candles {
            let existing: Option<Candle> = tx.query_row(
                &format!(
                    "SELECT open_time, open, high, low, close, volume FROM {} WHERE open_time = ?",
                    table_name
                ),
                params![candle.open_time],
                |row| {
                    Ok(Candle {
                        open_time: row.get(0)?,
                        open: row.get(1)?,
                        high: row.get(2)?,
                        low: row.get(3)?,
                        close: row.get(4)?,
                        volume: row.get(5)?,
                    })
                },
            ).optional().map_err(|e| AppError::DatabaseError(format!("查询蜡烛失败: {}", e)))?;

            match existing {
                Some(current) => {
                    if mode == UpsertMode::Reconcile && current != *candle {
                        tx.execute(
                            &format!(
                                "UPDATE {} SET open = ?, high = ?, low = ?, close = ?, volume = ?
                                 WHERE open_time = ?",
                                table_name
                            ),
                            params![
                                candle.open,
                                candle.high,
                                candle.low,
                                candle.close,
                                candle.volume,
                                candle.open_time,
                            ],
                        ).map_err(|e| AppError::DatabaseError(format!("更新蜡烛失败: {}", e)))?;
                        changed += 1;
                    }
                    // Normal模式下保留已有数据，实时聚合先到先得
                }
                None => {
                    tx.execute(
                        &format!(
                            "INSERT INTO {} (open_time, open, high, low, close, volume)
                             VALUES (?, ?, ?, ?, ?, ?)",
                            table_name
                        ),
                        params![
                            candle.open_time,
                            candle.open,
                            candle.high,
                            candle.low,
                            candle.close,
                            candle.volume,
                        ],
                    ).map_err(|e| AppError::DatabaseError(format!("插入蜡烛失败: {}", e)))?;
                    added += 1;
                }
            }
        }

        tx.commit()
            .map_err(|e| AppError::DatabaseError(format!("提交事务失败: {}", e)))?;

        debug!(target: "db", symbol = %symbol, timeframe = %timeframe,
            added = added, changed = changed, "蜡烛写入完成");
        Ok(added + changed)
    }

    /// 异步写入封装，阻塞操作放入spawn_blocking
    pub async fn upsert_candles_async(
        self: &Arc<Self>,
        symbol: String,
        timeframe: String,
        candles: Vec<Candle>,
        mode: UpsertMode,
    ) -> Result<usize> {
        let db = self.clone();
        task::spawn_blocking(move || db.upsert_candles(&symbol, &timeframe, &candles, mode))
            .await
            .map_err(|e| AppError::DatabaseError(format!("数据库写入任务panic: {:?}", e)))?
    }

    /// 按时间范围读取蜡烛（闭区间），升序返回
    pub fn read_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<Candle>> {
        let table_name = Self::table_name(symbol, timeframe);
        let conn = self.conn()?;
        Self::ensure_series_table(&conn, &table_name)?;

        let mut stmt = conn.prepare(&format!(
            "SELECT open_time, open, high, low, close, volume FROM {}
             WHERE open_time >= ? AND open_time <= ? ORDER BY open_time ASC",
            table_name
        ))?;

        let rows = stmt.query_map(params![from_ms, to_ms], |row| {
            Ok(Candle {
                open_time: row.get(0)?,
                open: row.get(1)?,
                high: row.get(2)?,
                low: row.get(3)?,
                close: row.get(4)?,
                volume: row.get(5)?,
            })
        })?;

        let mut candles = Vec::new();
        for row in rows {
            candles.push(row?);
        }
        Ok(candles)
    }

    /// 序列中最新一根蜡烛的开盘时间
    pub fn latest_open_time(&self, symbol: &str, timeframe: &str) -> Result<Option<i64>> {
        let table_name = Self::table_name(symbol, timeframe);
        let conn = self.conn()?;
        Self::ensure_series_table(&conn, &table_name)?;

        let result = conn.query_row(
            &format!("SELECT MAX(open_time) FROM {}", table_name),
            [],
            |row| row.get::<_, Option<i64>>(0),
        ).optional().map_err(|e| AppError::DatabaseError(format!("查询最新时间失败: {}", e)))?;

        Ok(result.flatten())
    }

    /// 时间范围内的蜡烛数量
    pub fn count_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<i64> {
        let table_name = Self::table_name(symbol, timeframe);
        let conn = self.conn()?;
        Self::ensure_series_table(&conn, &table_name)?;

        let count = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE open_time >= ? AND open_time <= ?",
                table_name
            ),
            params![from_ms, to_ms],
            |row| row.get(0),
        ).map_err(|e| AppError::DatabaseError(format!("统计蜡烛数量失败: {}", e)))?;
        Ok(count)
    }

    // ---- settings ----

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let value = conn.query_row(
            "SELECT value FROM settings WHERE key = ?",
            params![key],
            |row| row.get(0),
        ).optional().map_err(|e| AppError::DatabaseError(format!("读取设置失败: {}", e)))?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        ).map_err(|e| AppError::DatabaseError(format!("写入设置失败: {}", e)))?;
        Ok(())
    }

    /// 运行时设置：是否纳入盘前盘后，数据库值覆盖默认值
    pub fn include_extended_setting(&self, default: bool) -> bool {
        match self.get_setting("INCLUDE_EXTENDED_HOURS") {
            Ok(Some(v)) => v.eq_ignore_ascii_case("true") || v == "1",
            _ => default,
        }
    }

    /// 运行时设置：回溯天数，钳制到上限
    pub fn lookback_days_setting(&self, default: i64, max: i64) -> i64 {
        let days = match self.get_setting("LOOKBACK_DAYS") {
            Ok(Some(v)) => v.parse().unwrap_or(default),
            _ => default,
        };
        days.clamp(1, max)
    }

    // ---- 补齐队列 ----

    /// 入队一个补齐任务
    ///
    /// 同一标的已有pending条目时不重复入队，返回false
    pub fn enqueue_backfill(
        &self,
        symbol: &str,
        priority: i64,
        scheduled_for_ms: i64,
        now_ms: i64,
    ) -> Result<bool> {
        let conn = self.conn()?;

        let pending_exists: bool = conn.query_row(
            "SELECT 1 FROM backfill_queue WHERE symbol = ? AND status = 'pending' LIMIT 1",
            params![symbol],
            |_| Ok(true),
        ).optional().map_err(|e| AppError::DatabaseError(format!("查询队列失败: {}", e)))?.is_some();

        if pending_exists {
            debug!(target: "queue", symbol = %symbol, "已存在pending条目，跳过入队");
            return Ok(false);
        }

        conn.execute(
            "INSERT INTO backfill_queue (symbol, priority, scheduled_for, status, created_at, attempts)
             VALUES (?, ?, ?, 'pending', ?, 0)",
            params![symbol, priority, scheduled_for_ms, now_ms],
        ).map_err(|e| AppError::DatabaseError(format!("入队失败: {}", e)))?;

        info!(target: "queue", symbol = %symbol, priority = priority,
            scheduled_for = scheduled_for_ms, "补齐任务已入队");
        Ok(true)
    }

    /// 取出所有到期的pending条目
    ///
    /// 顺序：priority降序，同优先级按created_at升序
    pub fn due_queue_items(&self, now_ms: i64, limit: usize) -> Result<Vec<BackfillQueueItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, symbol, priority, scheduled_for, status, created_at, attempts
             FROM backfill_queue
             WHERE status = 'pending' AND scheduled_for <= ?
             ORDER BY priority DESC, created_at ASC
             LIMIT ?",
        )?;

        let rows = stmt.query_map(params![now_ms, limit as i64], |row| {
            let status_str: String = row.get(4)?;
            Ok(BackfillQueueItem {
                id: row.get(0)?,
                symbol: row.get(1)?,
                priority: row.get(2)?,
                scheduled_for: row.get(3)?,
                status: QueueStatus::parse(&status_str).unwrap_or(QueueStatus::Pending),
                created_at: row.get(5)?,
                attempts: row.get(6)?,
            })
        })?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    /// pending -> processing，同时递增attempts
    pub fn mark_queue_processing(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE backfill_queue SET status = 'processing', attempts = attempts + 1
             WHERE id = ? AND status = 'pending'",
            params![id],
        ).map_err(|e| AppError::DatabaseError(format!("更新队列状态失败: {}", e)))?;
        Ok(())
    }

    pub fn mark_queue_completed(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE backfill_queue SET status = 'completed' WHERE id = ? AND status = 'processing'",
            params![id],
        ).map_err(|e| AppError::DatabaseError(format!("更新队列状态失败: {}", e)))?;
        Ok(())
    }

    pub fn mark_queue_failed(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE backfill_queue SET status = 'failed' WHERE id = ? AND status = 'processing'",
            params![id],
        ).map_err(|e| AppError::DatabaseError(format!("更新队列状态失败: {}", e)))?;
        Ok(())
    }

    /// 待处理条目数
    pub fn queue_depth(&self) -> Result<i64> {
        let conn = self.conn()?;
        let depth = conn.query_row(
            "SELECT COUNT(*) FROM backfill_queue WHERE status = 'pending'",
            [],
            |row| row.get(0),
        ).map_err(|e| AppError::DatabaseError(format!("统计队列深度失败: {}", e)))?;
        Ok(depth)
    }

    // ---- 对账审计 ----

    pub fn insert_reconciliation(&self, record: &ReconciliationRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO reconciliations (symbol, timeframe, session_date, bars_updated, reconciled_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
                record.symbol,
                record.timeframe,
                record.session_date,
                record.bars_updated,
                record.reconciled_at,
            ],
        ).map_err(|e| AppError::DatabaseError(format!("写入对账记录失败: {}", e)))?;
        Ok(())
    }

    /// 最近7天的对账统计：(记录数, 修正蜡烛总数)
    pub fn reconciliation_stats_7d(&self, now_ms: i64) -> Result<(i64, i64)> {
        let cutoff = now_ms - 7 * 24 * 3600 * 1000;
        let conn = self.conn()?;
        let stats = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(bars_updated), 0)
             FROM reconciliations WHERE reconciled_at >= ?",
            params![cutoff],
            |row| Ok((row.get(0)?, row.get(1)?)),
        ).map_err(|e| AppError::DatabaseError(format!("统计对账记录失败: {}", e)))?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_db() -> (TempDir, Arc<Database>) {
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path().join("test.db"), 2, true).unwrap();
        (dir, Arc::new(db))
    }

    fn candle(open_time: i64, close: f64) -> Candle {
        Candle { open_time, open: 1.0, high: 2.0, low: 0.5, close, volume: 100.0 }
    }

    /// Normal模式下重复写入不改变已有数据
    #[test]
    fn test_normal_upsert_is_idempotent() {
        let (_dir, db) = test_db();
        let first = vec![candle(0, 10.0), candle(300_000, 11.0)];
        let n = db.upsert_candles("AAPL", "5m", &first, UpsertMode::Normal).unwrap();
        assert_eq!(n, 2);

        // 相同时间戳、不同数值的重复写入被忽略
        let second = vec![candle(0, 99.0)];
        let n = db.upsert_candles("AAPL", "5m", &second, UpsertMode::Normal).unwrap();
        assert_eq!(n, 0);

        let stored = db.read_candles("AAPL", "5m", 0, 300_000).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].close, 10.0);
    }

    /// Reconcile模式覆盖差异行并统计差异与新增
    #[test]
    fn test_reconcile_counts_changed_and_added() {
        let (_dir, db) = test_db();
        db.upsert_candles("AAPL", "5m", &[candle(0, 10.0), candle(300_000, 11.0)], UpsertMode::Normal).unwrap();

        let official = vec![
            candle(0, 10.0),        // 无差异
            candle(300_000, 11.5),  // close有差异
            candle(600_000, 12.0),  // 新时间戳
        ];
        let n = db.upsert_candles("AAPL", "5m", &official, UpsertMode::Reconcile).unwrap();
        assert_eq!(n, 2);

        let stored = db.read_candles("AAPL", "5m", 0, 600_000).unwrap();
        assert_eq!(stored[1].close, 11.5);
    }

    /// 范围读取按开盘时间升序返回
    #[test]
    fn test_read_candles_sorted_range() {
        let (_dir, db) = test_db();
        db.upsert_candles("MSFT", "5m",
            &[candle(600_000, 3.0), candle(0, 1.0), candle(300_000, 2.0)],
            UpsertMode::Normal).unwrap();

        let stored = db.read_candles("MSFT", "5m", 0, 300_000).unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored[0].open_time < stored[1].open_time);

        assert_eq!(db.latest_open_time("MSFT", "5m").unwrap(), Some(600_000));
    }

    /// 队列按优先级降序、创建时间升序出队
    #[test]
    fn test_queue_ordering_and_dedup() {
        let (_dir, db) = test_db();
        assert!(db.enqueue_backfill("AAPL", 0, 0, 100).unwrap());
        assert!(db.enqueue_backfill("MSFT", 1, 0, 200).unwrap());
        assert!(db.enqueue_backfill("SPY", 1, 0, 150).unwrap());
        // AAPL已有pending条目
        assert!(!db.enqueue_backfill("AAPL", 1, 0, 300).unwrap());

        let items = db.due_queue_items(1000, 10).unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].symbol, "SPY");
        assert_eq!(items[1].symbol, "MSFT");
        assert_eq!(items[2].symbol, "AAPL");
    }

    /// 未到期条目不出队，状态流转递增attempts
    #[test]
    fn test_queue_lifecycle() {
        let (_dir, db) = test_db();
        db.enqueue_backfill("AAPL", 0, 5000, 100).unwrap();
        assert!(db.due_queue_items(1000, 10).unwrap().is_empty());

        let items = db.due_queue_items(5000, 10).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].attempts, 0);

        db.mark_queue_processing(items[0].id).unwrap();
        db.mark_queue_completed(items[0].id).unwrap();
        assert_eq!(db.queue_depth().unwrap(), 0);

        // 完成后可再次入队
        assert!(db.enqueue_backfill("AAPL", 0, 0, 400).unwrap());
    }

    /// 设置读写与覆盖
    #[test]
    fn test_settings_roundtrip() {
        let (_dir, db) = test_db();
        assert_eq!(db.get_setting("k").unwrap(), None);
        db.set_setting("k", "v1").unwrap();
        db.set_setting("k", "v2").unwrap();
        assert_eq!(db.get_setting("k").unwrap(), Some("v2".to_string()));
    }
}
