pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod taxonomy;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    BreakerConfig, ConcurrencyConfig, ControlPlaneConfig, DlqConfig, GateConfig, MonitorConfig,
    RetryConfig, SessionConfig,
};
pub use error::*;
pub use metrics::ConcurrencyMetrics;
pub use taxonomy::ErrorTaxonomy;
