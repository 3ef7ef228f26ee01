//! corral-scheduler — level-triggered first-fit scheduling.
//!
//! The scheduler binds unscheduled containers to the first node with
//! enough free capacity on every resource dimension and no host-port
//! collision. It runs one pass at startup (to catch triggers missed
//! while down) and one per `ContainerAdded` event. No rebalancing, no
//! backoff: a container that fits nowhere stays unscheduled until the
//! next trigger.

pub mod error;
pub mod fit;
pub mod scheduler;

pub use error::{ScheduleError, ScheduleResult};
pub use scheduler::Scheduler;
