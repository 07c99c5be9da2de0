//! Shell script runner.

use async_trait::async_trait;
use buildhook_core::{BuildOutput, BuildRunner, Error, Result};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Runs the build script through `sh -c` with stderr folded into stdout.
pub struct ScriptRunner {
    script: String,
}

impl ScriptRunner {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
        }
    }

    pub fn script(&self) -> &str {
        &self.script
    }
}

#[async_trait]
impl BuildRunner for ScriptRunner {
    fn name(&self) -> &'static str {
        "script"
    }

    async fn run(&self, working_dir: &Path) -> Result<BuildOutput> {
        if !working_dir.is_dir() {
            return Err(Error::ExecutionFailed(format!(
                "build directory {} does not exist",
                working_dir.display()
            )));
        }

        debug!(script = %self.script, dir = %working_dir.display(), "Spawning build script");
        let output = Command::new("sh")
            .arg("-c")
            .arg(format!("{} 2>&1", self.script))
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::ExecutionFailed(format!("failed to spawn build script: {}", e)))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        // Only the shell itself can still write here.
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        let exit_code = exit_code(output.status);
        if exit_code == 0 {
            info!(dir = %working_dir.display(), "Build script succeeded");
        } else {
            warn!(dir = %working_dir.display(), exit_code, "Build script failed");
        }

        Ok(BuildOutput::new(exit_code, combined))
    }
}

/// Exit code of the script, `128 + signal` when it was killed.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &Path, body: &str) {
        let path = dir.join("do_build");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[tokio::test]
    async fn test_successful_build() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "echo building; pwd");

        let output = ScriptRunner::new("./do_build").run(dir.path()).await.unwrap();
        assert!(output.succeeded());
        assert!(output.output.starts_with("building\n"));
        let canonical = dir.path().canonicalize().unwrap();
        assert!(output.output.contains(canonical.to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_failing_build_combines_output() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "echo out; echo err >&2; exit 3");

        let output = ScriptRunner::new("./do_build").run(dir.path()).await.unwrap();
        assert_eq!(output.exit_code, 3);
        assert!(output.output.contains("out\n"));
        assert!(output.output.contains("err\n"));
    }

    #[tokio::test]
    async fn test_killed_build_reports_signal() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "kill -9 $$");

        let output = ScriptRunner::new("exec ./do_build").run(dir.path()).await.unwrap();
        assert_eq!(output.exit_code, 128 + 9);
    }

    #[tokio::test]
    async fn test_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = ScriptRunner::new("./do_build")
            .run(&dir.path().join("nope"))
            .await;
        assert!(matches!(result, Err(Error::ExecutionFailed(_))));
    }
}
