//! Core domain types and traits for buildhook.
//!
//! This crate contains:
//! - Build job identifiers and the persisted job payload
//! - Trigger rules and webhook push events
//! - The build runner trait used by workers

pub mod error;
pub mod event;
pub mod id;
pub mod job;
pub mod runner;
pub mod trigger;

pub use error::{Error, Result};
pub use event::PushEvent;
pub use id::JobId;
pub use job::{BuildJob, BuildOutcome, JobFailure, JobStatus};
pub use runner::{BuildOutput, BuildRunner};
pub use trigger::{ProjectTriggers, RepoTriggers, TriggerRule, split_list};
