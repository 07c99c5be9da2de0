//! Trigger rules: which (repository, ref) pairs build which project.

use serde::{Deserialize, Serialize};

/// A single configured trigger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriggerRule {
    pub project: String,
    /// `owner/name`
    pub repository: String,
    /// Fully-qualified ref, e.g. `refs/heads/master`.
    pub git_ref: String,
}

impl TriggerRule {
    pub fn new(
        project: impl Into<String>,
        repository: impl Into<String>,
        git_ref: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            repository: repository.into(),
            git_ref: git_ref.into(),
        }
    }

    /// Text recorded as `triggered_by` on jobs created through this rule.
    pub fn describe(&self) -> String {
        format!(
            "Triggered by ref {} in repo {}",
            self.git_ref, self.repository
        )
    }
}

/// All triggers of one project, sorted by repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectTriggers {
    pub name: String,
    pub repos: Vec<RepoTriggers>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoTriggers {
    pub name: String,
    pub refs: Vec<String>,
}

/// Split a comma separated list, trimming whitespace and dropping empty items.
///
/// Order is preserved: `"a, b"` yields `["a", "b"]`.
pub fn split_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
