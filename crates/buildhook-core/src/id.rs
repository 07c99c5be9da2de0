//! Build job identifiers.

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

/// Identifier of a build job.
///
/// Issued by the job store's counter, strictly increasing and never reused.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From,
)]
#[serde(transparent)]
#[display("{_0}")]
pub struct JobId(i64);

impl JobId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<JobId> for i64 {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl std::str::FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let id: JobId = " 42".parse().unwrap();
        assert_eq!(id, JobId::new(42));
        assert_eq!(id.to_string(), "42");
        assert!("forty-two".parse::<JobId>().is_err());
    }

    #[test]
    fn test_serializes_as_plain_integer() {
        let json = serde_json::to_string(&JobId::new(7)).unwrap();
        assert_eq!(json, "7");
    }
}
