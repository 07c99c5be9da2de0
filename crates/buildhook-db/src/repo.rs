//! Repository traits and PostgreSQL implementations.

pub mod job;
pub mod queue;
pub mod trigger;

pub use job::{JobRepo, PgJobRepo, Stat, Stats};
pub use queue::{Claim, DeadLetter, PgWorkQueue, WorkQueue, WorkerInfo};
pub use trigger::{PgTriggerRepo, TriggerRepo};
