//! Outbound delivery — blackout-aware scheduling, global throttling, and
//! the dispatch worker pool.

pub mod blackout;
pub mod dispatch;
pub mod scheduler;
pub mod throttle;

pub use blackout::{BlackoutDecision, BlackoutWindowProvider};
pub use dispatch::DispatchWorker;
pub use scheduler::DeliveryScheduler;
pub use throttle::DispatchThrottle;
