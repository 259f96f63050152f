pub mod config;
pub mod context;
pub mod error;
pub mod geo;
pub mod logging;
pub mod model;
pub mod security;  // 安全组件
pub mod store;  // 双后端存储层

pub use config::WaveguardConfig;
pub use context::RequestContext;
pub use error::{Result, SecurityError};
pub use geo::{GeoResolver, NullGeoResolver, StaticGeoResolver};
pub use model::*;
pub use security::{
    AccessDecision, AnomalyDetector, AuditLog, DeviceRegistry, SecurityService, SecurityStores,
    SessionManager, SessionState, SlidingWindowRateLimiter, TrustScoringEngine,
};
pub use store::Database;
