//! SQLite 用量账本
//!
//! 每个 (user_id, feature) 一行；try_increment 在 IMMEDIATE 事务中先滚动过期窗口，
//! 再执行条件更新 `UPDATE ... WHERE count < ?limit RETURNING`，避免先读后写的丢失更新。
//! rusqlite 为同步接口，所有数据库操作经 spawn_blocking 执行。

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::ledger::{QuotaError, UsageLedger};
use super::types::{FeatureType, UsageRecord, WINDOW_HOURS};
use super::window::UsageWindow;

const WINDOW_SECS: i64 = WINDOW_HOURS * 3600;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS usage_records (
    user_id TEXT NOT NULL,
    feature TEXT NOT NULL,
    window_start INTEGER NOT NULL,
    count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (user_id, feature)
)";

impl From<rusqlite::Error> for QuotaError {
    fn from(e: rusqlite::Error) -> Self {
        QuotaError::Storage(e.to_string())
    }
}

pub struct SqliteUsageLedger {
    conn: Arc<Mutex<Connection>>,
    window: UsageWindow,
}

impl SqliteUsageLedger {
    /// 打开（或创建）数据库文件；父目录不存在时自动创建
    pub fn open(path: impl AsRef<Path>, window: UsageWindow) -> Result<Self, QuotaError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| QuotaError::Storage(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init(conn, window)
    }

    /// 内存数据库（测试用）
    pub fn open_in_memory(window: UsageWindow) -> Result<Self, QuotaError> {
        Self::init(Connection::open_in_memory()?, window)
    }

    fn init(conn: Connection, window: UsageWindow) -> Result<Self, QuotaError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            window,
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, QuotaError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, QuotaError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| QuotaError::Storage(format!("connection lock poisoned: {}", e)))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| QuotaError::Join(e.to_string()))?
    }
}

fn to_datetime(secs: i64) -> Result<DateTime<Utc>, QuotaError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| QuotaError::CorruptRecord(format!("window_start out of range: {}", secs)))
}

fn to_count(raw: i64) -> Result<u32, QuotaError> {
    u32::try_from(raw).map_err(|_| QuotaError::CorruptRecord(format!("count out of range: {}", raw)))
}

#[async_trait]
impl UsageLedger for SqliteUsageLedger {
    async fn get(&self, user_id: &str, feature: FeatureType) -> Result<UsageRecord, QuotaError> {
        let now = self.window.now();
        let fresh = UsageRecord::fresh(user_id, feature, self.window.start_of_day(now));
        let user = user_id.to_string();
        let row: Option<(i64, i64)> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT window_start, count FROM usage_records WHERE user_id = ?1 AND feature = ?2",
                    params![user, feature.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(QuotaError::from)
            })
            .await?;

        let Some((start, count)) = row else {
            return Ok(fresh);
        };
        let record = UsageRecord {
            user_id: user_id.to_string(),
            feature,
            window_start: to_datetime(start)?,
            count: to_count(count)?,
        };
        Ok(if record.is_expired(now) { fresh } else { record })
    }

    async fn try_increment(
        &self,
        user_id: &str,
        feature: FeatureType,
        limit: u32,
    ) -> Result<(bool, UsageRecord), QuotaError> {
        let now = self.window.now();
        let current_start = self.window.start_of_day(now).timestamp();
        let user = user_id.to_string();
        let (incremented, start, count) = self
            .with_conn(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                // 首次使用时建行；窗口过期时重置计数
                tx.execute(
                    "INSERT INTO usage_records (user_id, feature, window_start, count)
                     VALUES (?1, ?2, ?3, 0)
                     ON CONFLICT(user_id, feature) DO UPDATE
                     SET window_start = excluded.window_start, count = 0
                     WHERE usage_records.window_start + ?4 <= ?5",
                    params![user, feature.as_str(), current_start, WINDOW_SECS, now.timestamp()],
                )?;
                let updated: Option<(i64, i64)> = tx
                    .query_row(
                        "UPDATE usage_records SET count = count + 1
                         WHERE user_id = ?1 AND feature = ?2 AND count < ?3
                         RETURNING window_start, count",
                        params![user, feature.as_str(), limit],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                let result = match updated {
                    Some((start, count)) => (true, start, count),
                    None => {
                        let (start, count): (i64, i64) = tx.query_row(
                            "SELECT window_start, count FROM usage_records WHERE user_id = ?1 AND feature = ?2",
                            params![user, feature.as_str()],
                            |row| Ok((row.get(0)?, row.get(1)?)),
                        )?;
                        (false, start, count)
                    }
                };
                tx.commit()?;
                Ok(result)
            })
            .await?;

        Ok((
            incremented,
            UsageRecord {
                user_id: user_id.to_string(),
                feature,
                window_start: to_datetime(start)?,
                count: to_count(count)?,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use chrono_tz::Tz;

    use super::*;
    use crate::quota::window::ManualClock;

    fn window(clock: &ManualClock) -> UsageWindow {
        UsageWindow::new(Tz::UTC, Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn test_sqlite_increment_until_limit() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
        let ledger = SqliteUsageLedger::open_in_memory(window(&clock)).unwrap();

        for expected in 1..=2 {
            let (ok, r) = ledger
                .try_increment("u1", FeatureType::StructuredAnalysis, 2)
                .await
                .unwrap();
            assert!(ok);
            assert_eq!(r.count, expected);
        }
        let (ok, r) = ledger
            .try_increment("u1", FeatureType::StructuredAnalysis, 2)
            .await
            .unwrap();
        assert!(!ok);
        assert_eq!(r.count, 2);
        assert_eq!(
            ledger.get("u1", FeatureType::StructuredAnalysis).await.unwrap().count,
            2
        );
    }

    #[tokio::test]
    async fn test_sqlite_rollover() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 23, 0, 0).unwrap());
        let ledger = SqliteUsageLedger::open_in_memory(window(&clock)).unwrap();
        ledger.try_increment("u1", FeatureType::QuickChat, 1).await.unwrap();
        let (ok, _) = ledger.try_increment("u1", FeatureType::QuickChat, 1).await.unwrap();
        assert!(!ok);

        clock.advance(Duration::hours(2));
        assert_eq!(ledger.get("u1", FeatureType::QuickChat).await.unwrap().count, 0);
        let (ok, r) = ledger.try_increment("u1", FeatureType::QuickChat, 1).await.unwrap();
        assert!(ok);
        assert_eq!(r.count, 1);
        assert_eq!(r.window_start, Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_file_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/usage.db");
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());

        {
            let ledger = SqliteUsageLedger::open(&path, window(&clock)).unwrap();
            ledger.try_increment("u1", FeatureType::QuickChat, 5).await.unwrap();
            ledger.try_increment("u1", FeatureType::QuickChat, 5).await.unwrap();
        }

        let ledger = SqliteUsageLedger::open(&path, window(&clock)).unwrap();
        assert_eq!(ledger.get("u1", FeatureType::QuickChat).await.unwrap().count, 2);
    }
}
