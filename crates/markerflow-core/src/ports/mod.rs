//! Ports: interfaces to the outside world.

pub mod clock;
pub mod scheduler;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::scheduler::Scheduler;
