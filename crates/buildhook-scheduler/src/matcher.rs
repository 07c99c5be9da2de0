//! Trigger matching.

use buildhook_core::{PushEvent, TriggerRule};
use buildhook_db::{DbResult, TriggerRepo};
use std::sync::Arc;

/// Decides whether a push event triggers builds of a project.
#[derive(Clone)]
pub struct TriggerMatcher {
    triggers: Arc<dyn TriggerRepo>,
}

impl TriggerMatcher {
    pub fn new(triggers: Arc<dyn TriggerRepo>) -> Self {
        Self { triggers }
    }

    /// Description of the matching rule, or `None` when no rule of `project`
    /// covers the event's repository and ref.
    pub async fn check(&self, project: &str, event: &PushEvent) -> DbResult<Option<String>> {
        let triggered = self
            .triggers
            .is_triggered(project, &event.repository, &event.git_ref)
            .await?;
        if !triggered {
            return Ok(None);
        }
        let rule = TriggerRule::new(project, &event.repository, &event.git_ref);
        Ok(Some(rule.describe()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildhook_db::Store;
    use serde_json::json;

    fn event(repo: &str, name: &str, git_ref: &str) -> PushEvent {
        PushEvent::from_payload(json!({
            "ref": git_ref,
            "repository": {"name": name, "owner": {"name": repo}}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_match_and_miss() {
        let store = Store::in_memory();
        store
            .triggers
            .add_or_update("p", "org/repo", &["refs/heads/master".to_string()])
            .await
            .unwrap();
        let matcher = TriggerMatcher::new(store.triggers.clone());

        let hit = matcher
            .check("p", &event("org", "repo", "refs/heads/master"))
            .await
            .unwrap();
        assert_eq!(
            hit.as_deref(),
            Some("Triggered by ref refs/heads/master in repo org/repo")
        );

        let wrong_ref = matcher
            .check("p", &event("org", "repo", "refs/heads/dev"))
            .await
            .unwrap();
        assert!(wrong_ref.is_none());

        let wrong_repo = matcher
            .check("p", &event("org", "fork", "refs/heads/master"))
            .await
            .unwrap();
        assert!(wrong_repo.is_none());

        let wrong_project = matcher
            .check("q", &event("org", "repo", "refs/heads/master"))
            .await
            .unwrap();
        assert!(wrong_project.is_none());
    }
}
