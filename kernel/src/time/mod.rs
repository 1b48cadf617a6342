//! Public façade for time-related facilities.
//!
//! Wall-clock/RTC reporting is out of scope; every consumer here only ever
//! needs a monotonic tick count (scheduler wait deadlines, driver timeouts).

pub mod timer;

pub use timer::{get_monotonic_time, get_ticks, init, timer_interrupt};
