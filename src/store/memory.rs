//! 内存存储实现
//!
//! 基于 DashMap 的分片锁：`entry()` 在持有分片写锁的情况下完成
//! 创建或修改，因此同一设备的并发 upsert 不会丢失计数，也不会
//! 出现重复建行。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;

use crate::error::Result;
use crate::model::{
    AnomalySnapshot, AuditEvent, AuditQuery, Device, ObservationKind, TrustFactors,
};
use crate::store::{ActivityUpdate, AnomalyStore, AuditStore, DeviceStore, RateLimitStore};

/// 每个观测维度最多保留的去重值数量（防止恶意设备撑爆内存）
const MAX_OBSERVATIONS_PER_KIND: usize = 512;

/// 每个设备最多保留的 Profile 关联数
const MAX_PROFILES_PER_DEVICE: usize = 16;

/// 每个设备最多保留的异常快照数
const MAX_SNAPSHOTS_PER_DEVICE: usize = 48;

/// 内存设备存储
pub struct MemoryDeviceStore {
    devices: DashMap<String, Device>,
    observations: DashMap<(String, ObservationKind), HashSet<String>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self {
            devices: DashMap::new(),
            observations: DashMap::new(),
        }
    }

    /// 当前设备行数（测试用）
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}

impl Default for MemoryDeviceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn upsert_activity(&self, update: &ActivityUpdate) -> Result<Device> {
        // entry() 持有分片写锁，创建与自增是一个原子动作
        let mut entry = self
            .devices
            .entry(update.device_id.clone())
            .or_insert_with(|| Device::first_seen(&update.device_id, update.now));
        let device = entry.value_mut();

        device.request_count += 1;
        device.last_seen_at = update.now;
        if let Some(ip) = &update.ip {
            device.ip = Some(ip.clone());
        }
        if let Some(ua) = &update.user_agent {
            device.user_agent = Some(ua.clone());
        }
        if let Some(geo) = &update.geo {
            device.geo = Some(geo.clone());
        }

        Ok(device.clone())
    }

    async fn get(&self, device_id: &str) -> Result<Option<Device>> {
        Ok(self.devices.get(device_id).map(|d| d.value().clone()))
    }

    async fn revoke(
        &self,
        device_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Device>> {
        match self.devices.get_mut(device_id) {
            Some(mut entry) => {
                let device = entry.value_mut();
                if !device.is_revoked {
                    device.is_revoked = true;
                    device.revoked_at = Some(now);
                    device.revoked_reason = Some(reason.to_string());
                }
                Ok(Some(device.clone()))
            }
            None => Ok(None),
        }
    }

    async fn record_failed_auth(&self, device_id: &str, now: DateTime<Utc>) -> Result<Device> {
        let mut entry = self
            .devices
            .entry(device_id.to_string())
            .or_insert_with(|| Device::first_seen(device_id, now));
        let device = entry.value_mut();
        device.failed_auth_count += 1;
        device.last_failed_auth_at = Some(now);
        Ok(device.clone())
    }

    async fn set_session_expiry(
        &self,
        device_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        match self.devices.get_mut(device_id) {
            Some(mut entry) => {
                entry.value_mut().session_expires_at = expires_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_suspicious(&self, device_id: &str, suspicious: bool) -> Result<bool> {
        match self.devices.get_mut(device_id) {
            Some(mut entry) => {
                entry.value_mut().is_suspicious = suspicious;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn store_trust_score(
        &self,
        device_id: &str,
        score: i32,
        factors: &TrustFactors,
        scored_request_count: u64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        match self.devices.get_mut(device_id) {
            Some(mut entry) => {
                let device = entry.value_mut();
                device.trust_score = score;
                device.trust_score_factors = *factors;
                device.trust_score_updated_at = Some(now);
                device.trust_scored_request_count = scored_request_count;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn attach_profile(&self, device_id: &str, profile_id: &str) -> Result<()> {
        if let Some(mut entry) = self.devices.get_mut(device_id) {
            let device = entry.value_mut();
            if !device.profile_ids.iter().any(|p| p == profile_id)
                && device.profile_ids.len() < MAX_PROFILES_PER_DEVICE
            {
                device.profile_ids.push(profile_id.to_string());
            }
        }
        Ok(())
    }

    async fn record_observation(
        &self,
        device_id: &str,
        kind: ObservationKind,
        value: &str,
        _now: DateTime<Utc>,
    ) -> Result<()> {
        let mut entry = self
            .observations
            .entry((device_id.to_string(), kind))
            .or_insert_with(HashSet::new);
        let values = entry.value_mut();
        if values.len() < MAX_OBSERVATIONS_PER_KIND || values.contains(value) {
            values.insert(value.to_string());
        }
        Ok(())
    }

    async fn distinct_observation_count(
        &self,
        device_id: &str,
        kind: ObservationKind,
    ) -> Result<u32> {
        Ok(self
            .observations
            .get(&(device_id.to_string(), kind))
            .map(|v| v.len() as u32)
            .unwrap_or(0))
    }

    async fn list_suspicious(&self, limit: u32) -> Result<Vec<Device>> {
        let mut devices: Vec<Device> = self
            .devices
            .iter()
            .filter(|entry| entry.value().is_suspicious)
            .map(|entry| entry.value().clone())
            .collect();
        devices.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        devices.truncate(limit as usize);
        Ok(devices)
    }
}

/// 内存限流日志存储
///
/// 每个 (key, identifier) 一把细粒度锁；条目按追加序存放，
/// 清理时整体 retain。
pub struct MemoryRateLimitStore {
    entries: DashMap<(String, String), Mutex<Vec<DateTime<Utc>>>>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl Default for MemoryRateLimitStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn record(&self, key: &str, identifier: &str, timestamp: DateTime<Utc>) -> Result<()> {
        let entry = self
            .entries
            .entry((key.to_string(), identifier.to_string()))
            .or_insert_with(|| Mutex::new(Vec::new()));
        entry.value().lock().push(timestamp);
        Ok(())
    }

    async fn count_since(&self, key: &str, identifier: &str, since: DateTime<Utc>) -> Result<u32> {
        Ok(self
            .entries
            .get(&(key.to_string(), identifier.to_string()))
            .map(|entry| entry.value().lock().iter().filter(|ts| **ts > since).count() as u32)
            .unwrap_or(0))
    }

    async fn timestamps_since(
        &self,
        key: &str,
        identifier: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        Ok(self
            .entries
            .get(&(key.to_string(), identifier.to_string()))
            .map(|entry| {
                entry
                    .value()
                    .lock()
                    .iter()
                    .filter(|ts| **ts > since)
                    .copied()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut purged = 0u64;
        for entry in self.entries.iter() {
            let mut timestamps = entry.value().lock();
            let before = timestamps.len();
            timestamps.retain(|ts| *ts >= cutoff);
            purged += (before - timestamps.len()) as u64;
        }
        self.entries
            .retain(|_, timestamps| !timestamps.lock().is_empty());
        Ok(purged)
    }

    async fn purge_key_older_than(&self, key: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut purged = 0u64;
        for entry in self.entries.iter() {
            if entry.key().0 != key {
                continue;
            }
            let mut timestamps = entry.value().lock();
            let before = timestamps.len();
            timestamps.retain(|ts| *ts >= cutoff);
            purged += (before - timestamps.len()) as u64;
        }
        Ok(purged)
    }
}

/// 内存审计事件存储
pub struct MemoryAuditStore {
    events: RwLock<Vec<AuditEvent>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self {
            events: RwLock::new(Vec::new()),
        }
    }
}

impl Default for MemoryAuditStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, event: &AuditEvent) -> Result<()> {
        self.events.write().push(event.clone());
        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        let events = self.events.read();
        let mut matched: Vec<AuditEvent> = events
            .iter()
            .filter(|e| {
                query
                    .device_id
                    .as_ref()
                    .map(|id| &e.device_id == id)
                    .unwrap_or(true)
                    && query
                        .event_type
                        .map(|t| e.event_type == t)
                        .unwrap_or(true)
                    && query
                        .min_severity
                        .map(|s| e.severity.rank() >= s.rank())
                        .unwrap_or(true)
                    && query.since.map(|t| e.created_at >= t).unwrap_or(true)
                    && query.until.map(|t| e.created_at <= t).unwrap_or(true)
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = query.limit {
            matched.truncate(limit as usize);
        }
        Ok(matched)
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut events = self.events.write();
        let before = events.len();
        events.retain(|e| e.created_at >= cutoff);
        Ok((before - events.len()) as u64)
    }
}

/// 内存异常快照存储
pub struct MemoryAnomalyStore {
    snapshots: DashMap<String, Vec<AnomalySnapshot>>,
}

impl MemoryAnomalyStore {
    pub fn new() -> Self {
        Self {
            snapshots: DashMap::new(),
        }
    }
}

impl Default for MemoryAnomalyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AnomalyStore for MemoryAnomalyStore {
    async fn store_snapshot(&self, snapshot: &AnomalySnapshot) -> Result<()> {
        let mut entry = self
            .snapshots
            .entry(snapshot.device_id.clone())
            .or_insert_with(Vec::new);
        let snapshots = entry.value_mut();
        snapshots.push(snapshot.clone());
        if snapshots.len() > MAX_SNAPSHOTS_PER_DEVICE {
            let excess = snapshots.len() - MAX_SNAPSHOTS_PER_DEVICE;
            snapshots.drain(0..excess);
        }
        Ok(())
    }

    async fn latest(&self, device_id: &str) -> Result<Option<AnomalySnapshot>> {
        Ok(self
            .snapshots
            .get(device_id)
            .and_then(|entry| entry.value().last().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_upsert_creates_then_increments() {
        let store = MemoryDeviceStore::new();
        let now = Utc::now();
        let update = ActivityUpdate {
            device_id: "device-1".to_string(),
            ip: Some("1.2.3.4".to_string()),
            user_agent: None,
            geo: None,
            now,
        };

        let first = store.upsert_activity(&update).await.unwrap();
        assert_eq!(first.request_count, 1);
        assert_eq!(first.ip.as_deref(), Some("1.2.3.4"));

        // 第二次不带 ip：保留旧值
        let update2 = ActivityUpdate {
            device_id: "device-1".to_string(),
            ip: None,
            user_agent: Some("WaveClip/2.1".to_string()),
            geo: None,
            now: now + Duration::seconds(1),
        };
        let second = store.upsert_activity(&update2).await.unwrap();
        assert_eq!(second.request_count, 2);
        assert_eq!(second.ip.as_deref(), Some("1.2.3.4"));
        assert_eq!(second.user_agent.as_deref(), Some("WaveClip/2.1"));
        assert_eq!(store.device_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_upsert_single_row() {
        let store = Arc::new(MemoryDeviceStore::new());
        let now = Utc::now();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let update = ActivityUpdate {
                    device_id: "race-device".to_string(),
                    ip: None,
                    user_agent: None,
                    geo: None,
                    now,
                };
                store.upsert_activity(&update).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let device = store.get("race-device").await.unwrap().unwrap();
        assert_eq!(device.request_count, 50);
        assert_eq!(store.device_count(), 1);
    }

    #[tokio::test]
    async fn test_revoke_is_irreversible_and_keeps_first_reason() {
        let store = MemoryDeviceStore::new();
        let now = Utc::now();
        store
            .upsert_activity(&ActivityUpdate {
                device_id: "d1".to_string(),
                ip: None,
                user_agent: None,
                geo: None,
                now,
            })
            .await
            .unwrap();

        let revoked = store.revoke("d1", "abuse", now).await.unwrap().unwrap();
        assert!(revoked.is_revoked);

        let again = store
            .revoke("d1", "other", now + Duration::hours(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.revoked_reason.as_deref(), Some("abuse"));
        assert_eq!(again.revoked_at, Some(now));
    }

    #[tokio::test]
    async fn test_rate_limit_count_window() {
        let store = MemoryRateLimitStore::new();
        let base = Utc::now();

        for i in 0..5 {
            store
                .record("reactions", "d1", base + Duration::seconds(i))
                .await
                .unwrap();
        }

        // since 是严格大于
        let count = store
            .count_since("reactions", "d1", base)
            .await
            .unwrap();
        assert_eq!(count, 4);

        let all = store
            .count_since("reactions", "d1", base - Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(all, 5);
    }

    #[tokio::test]
    async fn test_purge_key_scoped() {
        let store = MemoryRateLimitStore::new();
        let base = Utc::now();
        store.record("reactions", "d1", base).await.unwrap();
        store.record("listens", "d1", base).await.unwrap();

        let purged = store
            .purge_key_older_than("reactions", base + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);

        // listens 不受影响
        let remaining = store
            .count_since("listens", "d1", base - Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(remaining, 1);
    }
}
