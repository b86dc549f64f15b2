pub mod broadcast;
pub mod config;
pub mod constants;
pub mod error;
pub mod plan;
pub mod pool;
pub mod retry;
pub mod session;
pub mod types;

pub use broadcast::*;
pub use config::{
    AlertsConfig, Config, CurrencyConfig, FeePolicy, MixingConfig, ResourceConfig, TransportConfig,
};
pub use constants::*;
pub use error::{ErrorContext, ErrorKind, MixError, RecoveryPolicy, Severity};
pub use plan::*;
pub use pool::*;
pub use retry::{execute_with_retry, exponential_backoff_ms, RetryOutcome, RetryStrategy};
pub use session::*;
pub use types::*;
