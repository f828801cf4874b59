//! 配额窗口：参考时区 + 可注入时钟
//!
//! 窗口起点为参考时区当日零点；测试中用 ManualClock 推进时间以验证跨日重置。

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use super::types::{FeatureType, UsageRecord};

/// 时钟抽象
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// 系统时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 手动时钟（测试用）
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 窗口策略：决定「今天」从何时开始
#[derive(Clone)]
pub struct UsageWindow {
    tz: Tz,
    clock: Arc<dyn Clock>,
}

impl UsageWindow {
    pub fn new(tz: Tz, clock: Arc<dyn Clock>) -> Self {
        Self { tz, clock }
    }

    /// UTC + 系统时钟
    pub fn utc() -> Self {
        Self::new(Tz::UTC, Arc::new(SystemClock))
    }

    /// 按 IANA 名称解析时区，失败返回 None
    pub fn from_tz_name(name: &str, clock: Arc<dyn Clock>) -> Option<Self> {
        name.parse::<Tz>().ok().map(|tz| Self::new(tz, clock))
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// 给定时刻所在日（参考时区）的零点
    pub fn start_of_day(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let local_midnight = at.with_timezone(&self.tz).date_naive().and_time(NaiveTime::MIN);
        // 夏令时切换恰逢零点时取最早的合法时刻
        self.tz
            .from_local_datetime(&local_midnight)
            .earliest()
            .unwrap_or_else(|| self.tz.from_utc_datetime(&local_midnight))
            .with_timezone(&Utc)
    }

    pub fn current_start(&self) -> DateTime<Utc> {
        self.start_of_day(self.now())
    }

    pub fn fresh_record(&self, user_id: &str, feature: FeatureType) -> UsageRecord {
        UsageRecord::fresh(user_id, feature, self.current_start())
    }

    /// 返回仍在窗口内的记录；过期则替换为新窗口的零计数记录
    pub fn roll(&self, record: UsageRecord) -> UsageRecord {
        if record.is_expired(self.now()) {
            self.fresh_record(&record.user_id, record.feature)
        } else {
            record
        }
    }
}

impl std::fmt::Debug for UsageWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageWindow").field("tz", &self.tz).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_of_day_utc() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 10, 15, 30, 0).unwrap());
        let window = UsageWindow::new(Tz::UTC, Arc::new(clock));
        assert_eq!(
            window.current_start(),
            Utc.with_ymd_and_hms(2024, 5, 10, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_start_of_day_in_reference_timezone() {
        // 2024-05-10 20:00 UTC 在上海已是 5 月 11 日 04:00，窗口起点为 5/11 00:00 CST = 5/10 16:00 UTC
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 10, 20, 0, 0).unwrap());
        let window = UsageWindow::from_tz_name("Asia/Shanghai", Arc::new(clock)).unwrap();
        assert_eq!(
            window.current_start(),
            Utc.with_ymd_and_hms(2024, 5, 10, 16, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_roll_expired_record() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 10, 9, 0, 0).unwrap());
        let window = UsageWindow::new(Tz::UTC, Arc::new(clock.clone()));
        let mut record = window.fresh_record("u1", FeatureType::QuickChat);
        record.count = 7;

        assert_eq!(window.roll(record.clone()).count, 7);

        clock.advance(Duration::hours(20));
        let rolled = window.roll(record);
        assert_eq!(rolled.count, 0);
        assert_eq!(
            rolled.window_start,
            Utc.with_ymd_and_hms(2024, 5, 11, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_unknown_timezone() {
        assert!(UsageWindow::from_tz_name("Mars/Olympus", Arc::new(SystemClock)).is_none());
    }
}
