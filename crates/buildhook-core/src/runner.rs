//! Build runner trait.
//!
//! A runner executes a project's build in a working directory and reports
//! how it went. A failing build is a normal [`BuildOutput`] with a non-zero
//! exit code; `Err` is reserved for not being able to run the build at all.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::Result;

/// Exit code and combined stdout/stderr of a build run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutput {
    pub exit_code: i32,
    pub output: String,
}

impl BuildOutput {
    pub fn new(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: output.into(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Trait for build mechanisms.
#[async_trait]
pub trait BuildRunner: Send + Sync {
    /// Name of this runner.
    fn name(&self) -> &'static str;

    /// Run the build in `working_dir` and wait for it to finish.
    async fn run(&self, working_dir: &Path) -> Result<BuildOutput>;
}
