use coderun_sandbox::LimitOverrides;
use serde::{Deserialize, Serialize};

/// A request to execute source code in a workspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub workspace_id: String,
    /// Language name or alias (`node`, `js`, `python3`, `sh`, ...)
    pub language: String,
    pub source: String,
    #[serde(default)]
    pub limits: Option<LimitOverrides>,
}

impl RunRequest {
    pub fn new(
        workspace_id: impl Into<String>,
        language: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            language: language.into(),
            source: source.into(),
            limits: None,
        }
    }

    pub fn with_limits(mut self, limits: LimitOverrides) -> Self {
        self.limits = Some(limits);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_deserialize_camel_case_with_limits() {
        let json = r#"{
            "workspaceId": "w1",
            "language": "node",
            "source": "console.log(1+1)",
            "limits": {"timeout": "2s", "maxOutputBytes": 64}
        }"#;
        let request: RunRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.workspace_id, "w1");
        let limits = request.limits.unwrap();
        assert_eq!(limits.timeout, Some(Duration::from_secs(2)));
        assert_eq!(limits.max_output_bytes, Some(64));
        assert_eq!(limits.max_memory, None);
    }

    #[test]
    fn test_limits_are_optional() {
        let request: RunRequest =
            serde_json::from_str(r#"{"workspaceId":"w","language":"sh","source":"true"}"#).unwrap();
        assert!(request.limits.is_none());
    }
}
