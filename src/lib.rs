pub mod calibrate;
pub mod core;
pub mod crawler;
pub mod engine;
pub mod extract;
pub mod limiter;
pub mod scope;
pub mod transport;
pub mod urls;

// --- Primary exports ---
pub use crate::core::config::{
    AutoCalibrateConfig, CrawlerConfig, DomainRateLimitConfig, NormalizationConfig,
    ResourceLimiterConfig, RetryConfig, ScopeConfig,
};
pub use crate::core::errors::CrawlerError;
pub use crate::core::types::{Asset, AssetType, StatsCallback, StatsDelta, StatsSnapshot};
pub use crate::crawler::Crawler;
pub use crate::engine::RobotsFilter;
pub use crate::limiter::{ResourceLimiter, ShutdownCallback};
pub use crate::transport::TransportError;
