//! 滑动窗口限流器
//!
//! 基于日志计数而非固定桶：检查时统计 `(now - window, now]` 区间内
//! 已记录的条目数（严格大于下界），达到上限即拒绝。精度以写放大
//! 换取 —— 每次放行追加一条带时间戳的条目，由保留期清理回收。
//!
//! 拒绝是软性的：只返回拒绝决定与 retry-after 提示，从不引入
//! 惩罚性冷却时间。

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::warn;

use crate::config::RateLimitConfig;
use crate::error::Result;
use crate::model::RateLimitDecision;
use crate::store::RateLimitStore;

/// 滑动窗口限流器
#[derive(Clone)]
pub struct SlidingWindowRateLimiter {
    store: Arc<dyn RateLimitStore>,
    config: RateLimitConfig,
}

impl SlidingWindowRateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    /// 检查某操作类别的配额（不记录本次请求）
    pub async fn check(
        &self,
        key: &str,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision> {
        let class = self.config.class(key);
        let since = now - Duration::seconds(class.window_secs as i64);
        let count = self.store.count_since(key, identifier, since).await?;

        if count < class.limit {
            return Ok(RateLimitDecision::allow(class.limit - count, class.limit));
        }

        let retry_after_secs = self.retry_after(key, identifier, since, class.window_secs, now).await?;
        warn!(
            "🚫 触发限流: key={} identifier={} count={}/{}",
            key, identifier, count, class.limit
        );
        Ok(RateLimitDecision::deny(class.limit, retry_after_secs))
    }

    /// 窗口内最早的条目滚出窗口所需的秒数（向上取整，至少 1 秒）
    async fn retry_after(
        &self,
        key: &str,
        identifier: &str,
        since: DateTime<Utc>,
        window_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let timestamps = self.store.timestamps_since(key, identifier, since).await?;
        let oldest = match timestamps.into_iter().min() {
            Some(ts) => ts,
            None => return Ok(1),
        };
        let rolls_at = oldest + Duration::seconds(window_secs as i64);
        let millis = (rolls_at - now).num_milliseconds();
        if millis <= 0 {
            return Ok(1);
        }
        Ok(((millis as u64) + 999) / 1000)
    }

    /// 记录一次已放行的请求
    pub async fn record(&self, key: &str, identifier: &str, now: DateTime<Utc>) -> Result<()> {
        self.store.record(key, identifier, now).await
    }

    /// 检查并在放行时记录
    ///
    /// 检查与记录是两次存储往返，并非事务；并发极端情况下可能
    /// 短暂超限一两次，换来的是无锁的存储接口。拒绝时不记录，
    /// 被限流的重试不会把窗口越推越满。
    pub async fn check_and_record(
        &self,
        key: &str,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision> {
        let decision = self.check(key, identifier, now).await?;
        if decision.allowed {
            self.store.record(key, identifier, now).await?;
        }
        Ok(decision)
    }

    /// 清理早于 cutoff 的条目
    pub async fn purge_key(&self, key: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        self.store.purge_key_older_than(key, cutoff).await
    }
}
