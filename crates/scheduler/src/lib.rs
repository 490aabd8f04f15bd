//! Cron-driven task dispatch.
//!
//! Tasks register by name with a 5-field cron expression; the scheduler
//! ticks once a minute and runs whatever matches. Skills get a
//! namespaced client view so they never hold the scheduler type itself.

pub mod cron;
pub mod scheduler;

pub use cron::{parse_tz, CronExpr};
pub use scheduler::{SchedulerClient, TaskHandler, TaskInfo, TaskScheduler, TaskSpec};
