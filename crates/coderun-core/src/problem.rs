use coderun_diagnostics::Diagnostic;
use serde::{Deserialize, Serialize};

use crate::SessionId;

/// A diagnostic attributed to the session that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    pub session_id: SessionId,
    #[serde(flatten)]
    pub diagnostic: Diagnostic,
}

impl Problem {
    pub fn new(session_id: SessionId, diagnostic: Diagnostic) -> Self {
        Self {
            session_id,
            diagnostic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coderun_diagnostics::Location;

    #[test]
    fn test_problem_json_shape() {
        let problem = Problem::new(
            SessionId::new(),
            Diagnostic::error("boom").with_location(Location::new(None, Some(3), None)),
        );
        let json = serde_json::to_value(&problem).unwrap();
        assert_eq!(json["severity"], "error");
        assert_eq!(json["message"], "boom");
        assert_eq!(json["line"], 3);
        assert!(json["file"].is_null());
        assert!(json["col"].is_null());
        assert!(json["sessionId"].is_string());
    }
}
