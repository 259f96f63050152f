//! 地理位置解析
//!
//! IP → 位置的解析是可插拔的外部能力：核心子系统只依赖这里的
//! trait，不内置任何网络调用，保证离线可测。生产部署注入真实
//! 解析器（GeoIP 库 / 边缘节点头部），测试注入静态表。

use async_trait::async_trait;
use dashmap::DashMap;

use crate::model::GeoLocation;

/// IP → 地理位置解析器
#[async_trait]
pub trait GeoResolver: Send + Sync {
    /// 解析 IP 对应的地理位置，解析不出返回 None（永不报错阻塞请求）
    async fn resolve(&self, ip: &str) -> Option<GeoLocation>;
}

/// 空解析器（默认）：不解析任何位置
pub struct NullGeoResolver;

#[async_trait]
impl GeoResolver for NullGeoResolver {
    async fn resolve(&self, _ip: &str) -> Option<GeoLocation> {
        None
    }
}

/// 静态表解析器（测试/内网部署用）
pub struct StaticGeoResolver {
    table: DashMap<String, GeoLocation>,
}

impl StaticGeoResolver {
    /// 创建空表解析器
    pub fn new() -> Self {
        Self {
            table: DashMap::new(),
        }
    }

    /// 登记一条 IP → 位置映射
    pub fn insert(&self, ip: impl Into<String>, location: GeoLocation) {
        self.table.insert(ip.into(), location);
    }
}

impl Default for StaticGeoResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GeoResolver for StaticGeoResolver {
    async fn resolve(&self, ip: &str) -> Option<GeoLocation> {
        self.table.get(ip).map(|entry| entry.value().clone())
    }
}
