//! obscura-govern
//!
//! The resource governor: every long-lived map in the core is a
//! `BoundedCollection` registered here, and every long-lived timer task is
//! registered by name. The memory monitor samples process usage and drives
//! cleanup passes; `shutdown()` drains both registries so nothing leaks
//! past the core's lifetime.

pub mod bounded;
pub mod monitor;
pub mod registry;

pub use bounded::{BoundedCollection, Maintainable, SharedBounded};
pub use monitor::{GovernorEvent, ResourceGovernor};
pub use registry::{CollectionRegistry, TimerKind, TimerRegistry};
