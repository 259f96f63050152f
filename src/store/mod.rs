//! 存储层
//!
//! 所有计数器自增与设备行的 upsert 都必须在存储实现内部原子完成
//! （conditional insert-or-update / `SET x = x + 1`），上层组件绝不做
//! fetch-modify-write，以避免并发首次接触时的重复建行和丢失更新。
//!
//! 两套实现：
//! - `memory`：DashMap 版，分片锁保证原子性，测试与单机部署用
//! - `postgres`：sqlx 版，单条 `INSERT ... ON CONFLICT` 往返

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{
    AnomalySnapshot, AuditEvent, AuditQuery, Device, GeoLocation, ObservationKind, TrustFactors,
};

pub use memory::{MemoryAnomalyStore, MemoryAuditStore, MemoryDeviceStore, MemoryRateLimitStore};
pub use postgres::{
    Database, PgAnomalyStore, PgAuditStore, PgDeviceStore, PgRateLimitStore,
};

/// 一次请求活动带来的设备更新
#[derive(Debug, Clone)]
pub struct ActivityUpdate {
    pub device_id: String,
    /// 仅在提供时覆盖，否则保留旧值
    pub ip: Option<String>,
    /// 仅在提供时覆盖，否则保留旧值
    pub user_agent: Option<String>,
    /// 仅在提供时覆盖，否则保留旧值
    pub geo: Option<GeoLocation>,
    pub now: DateTime<Utc>,
}

/// 设备存储
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// 原子地创建或更新设备行：request_count + 1、last_seen_at = now，
    /// ip / user_agent / geo 仅在提供时覆盖。返回更新后的设备。
    async fn upsert_activity(&self, update: &ActivityUpdate) -> Result<Device>;

    /// 查询设备
    async fn get(&self, device_id: &str) -> Result<Option<Device>>;

    /// 吊销设备（不可逆；重复吊销保留首次的时间与原因）。
    /// 设备不存在返回 None。
    async fn revoke(
        &self,
        device_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Device>>;

    /// 原子自增认证失败计数并刷新 last_failed_auth_at。
    /// 设备不存在时创建（认证失败同样是首次接触信号）。
    async fn record_failed_auth(&self, device_id: &str, now: DateTime<Utc>) -> Result<Device>;

    /// 设置会话过期时间。设备不存在返回 false。
    async fn set_session_expiry(
        &self,
        device_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    /// 设置可疑标记。设备不存在返回 false。
    async fn set_suspicious(&self, device_id: &str, suspicious: bool) -> Result<bool>;

    /// 持久化信任分及因子明细。设备不存在返回 false。
    async fn store_trust_score(
        &self,
        device_id: &str,
        score: i32,
        factors: &TrustFactors,
        scored_request_count: u64,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// 记录设备与 Profile 的关联（幂等）
    async fn attach_profile(&self, device_id: &str, profile_id: &str) -> Result<()>;

    /// 记录一次观测值（IP / User-Agent / 地理位置，幂等去重）
    async fn record_observation(
        &self,
        device_id: &str,
        kind: ObservationKind,
        value: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// 某一维度的去重观测数
    async fn distinct_observation_count(
        &self,
        device_id: &str,
        kind: ObservationKind,
    ) -> Result<u32>;

    /// 列出被标记可疑的设备（按最后活跃时间倒序）
    async fn list_suspicious(&self, limit: u32) -> Result<Vec<Device>>;
}

/// 限流日志存储（仅追加）
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// 追加一条带时间戳的条目
    async fn record(&self, key: &str, identifier: &str, timestamp: DateTime<Utc>) -> Result<()>;

    /// 统计 `timestamp > since` 的条目数
    async fn count_since(&self, key: &str, identifier: &str, since: DateTime<Utc>) -> Result<u32>;

    /// 取回 `timestamp > since` 的全部时间戳（特征提取 / retry-after 计算用）
    async fn timestamps_since(
        &self,
        key: &str,
        identifier: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>>;

    /// 清理所有 key 中早于 cutoff 的条目，返回清理数量
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// 清理指定 key 中早于 cutoff 的条目，返回清理数量
    async fn purge_key_older_than(&self, key: &str, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// 审计事件存储（仅追加，除保留期清理外不可变）
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// 追加一条事件
    async fn append(&self, event: &AuditEvent) -> Result<()>;

    /// 按条件查询（倒序）
    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>>;

    /// 固定期限保留清理
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// 异常快照存储
#[async_trait]
pub trait AnomalyStore: Send + Sync {
    /// 写入一份快照
    async fn store_snapshot(&self, snapshot: &AnomalySnapshot) -> Result<()>;

    /// 设备最近一份快照
    async fn latest(&self, device_id: &str) -> Result<Option<AnomalySnapshot>>;
}
