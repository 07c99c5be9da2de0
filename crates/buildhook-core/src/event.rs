//! Webhook push events.

use serde::Serialize;

use crate::{Error, Result};

/// The parts of a push webhook a trigger is matched against.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushEvent {
    /// `owner/name`
    pub repository: String,
    pub git_ref: String,
    /// The full payload as received.
    pub raw: serde_json::Value,
}

impl PushEvent {
    /// Parse the JSON carried in the webhook's `payload` form field.
    pub fn parse(payload: &str) -> Result<Self> {
        let raw: serde_json::Value = serde_json::from_str(payload)
            .map_err(|e| Error::InvalidInput(format!("payload is not JSON: {}", e)))?;
        Self::from_payload(raw)
    }

    /// Extract repository and ref from a decoded payload.
    ///
    /// The owner is read from `repository.owner.name`, falling back to
    /// `repository.owner.login` for senders using the newer schema.
    pub fn from_payload(raw: serde_json::Value) -> Result<Self> {
        let repo = raw
            .get("repository")
            .ok_or_else(|| Error::InvalidInput("missing repository".to_string()))?;
        let owner = repo
            .get("owner")
            .and_then(|o| o.get("name").or_else(|| o.get("login")))
            .and_then(|n| n.as_str())
            .ok_or_else(|| Error::InvalidInput("missing repository.owner.name".to_string()))?;
        let name = repo
            .get("name")
            .and_then(|n| n.as_str())
            .ok_or_else(|| Error::InvalidInput("missing repository.name".to_string()))?;
        let git_ref = raw
            .get("ref")
            .and_then(|r| r.as_str())
            .ok_or_else(|| Error::InvalidInput("missing ref".to_string()))?
            .to_string();

        Ok(Self {
            repository: format!("{}/{}", owner, name),
            git_ref,
            raw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_push_payload() {
        let payload = json!({
            "ref": "refs/heads/master",
            "after": "abc123",
            "repository": {"name": "repo", "owner": {"name": "org"}}
        });
        let event = PushEvent::parse(&payload.to_string()).unwrap();
        assert_eq!(event.repository, "org/repo");
        assert_eq!(event.git_ref, "refs/heads/master");
        assert_eq!(event.raw, payload);
    }

    #[test]
    fn test_owner_login_fallback() {
        let payload = json!({
            "ref": "refs/tags/v1",
            "repository": {"name": "repo", "owner": {"login": "octocat"}}
        });
        let event = PushEvent::from_payload(payload).unwrap();
        assert_eq!(event.repository, "octocat/repo");
    }

    #[test]
    fn test_rejects_incomplete_payloads() {
        assert!(PushEvent::parse("not json").is_err());
        assert!(PushEvent::from_payload(json!({"ref": "refs/heads/x"})).is_err());
        assert!(
            PushEvent::from_payload(json!({
                "repository": {"name": "repo", "owner": {"name": "org"}}
            }))
            .is_err()
        );
    }
}
