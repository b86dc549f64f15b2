//! obscura-sched
//!
//! Release planning and timed execution. The planner turns a reserved
//! selection into a randomized, monotone hop schedule; the scheduler fiber
//! sleeps on the earliest pending fire time, submits due hops through the
//! chain facade, watches confirmations, retries with fee bumps, and pauses
//! per currency under endpoint backpressure.

pub mod planner;
pub mod scheduler;

pub use planner::{build_plan, PlanParams};
pub use scheduler::{SchedCommand, SchedEvent, Scheduler};
