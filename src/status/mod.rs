use serde::{Deserialize, Serialize};
use std::fmt;

/// Message shown once the unit has converged
pub const NODE_CONFIGURED: &str = "Node Configured";

/// UnitStatus is the single user-facing surface of the charm
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "lowercase")]
pub enum UnitStatus {
    Maintenance(String),
    Waiting(String),
    Blocked(String),
    Active(String),
}

impl UnitStatus {
    pub fn maintenance(msg: impl Into<String>) -> Self {
        Self::Maintenance(msg.into())
    }

    pub fn waiting(msg: impl Into<String>) -> Self {
        Self::Waiting(msg.into())
    }

    pub fn blocked(msg: impl Into<String>) -> Self {
        Self::Blocked(msg.into())
    }

    pub fn active(msg: impl Into<String>) -> Self {
        Self::Active(msg.into())
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Maintenance(_) => "maintenance",
            Self::Waiting(_) => "waiting",
            Self::Blocked(_) => "blocked",
            Self::Active(_) => "active",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Maintenance(m) | Self::Waiting(m) | Self::Blocked(m) | Self::Active(m) => m,
        }
    }
}

impl Default for UnitStatus {
    fn default() -> Self {
        Self::Maintenance(String::new())
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message().is_empty() {
            write!(f, "{}", self.name())
        } else {
            write!(f, "{}: {}", self.name(), self.message())
        }
    }
}

/// Health of the tigera-operator pod as reported by `kubectl get pods -o json`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodHealth {
    Absent,
    Unhealthy(String),
    Healthy,
}

impl PodHealth {
    /// Unit status reflecting this health
    pub fn status(&self) -> UnitStatus {
        match self {
            Self::Absent => UnitStatus::waiting("Waiting for tigera-operator pod"),
            Self::Unhealthy(detail) => {
                UnitStatus::waiting(format!("tigera-operator pod not ready: {}", detail))
            }
            Self::Healthy => UnitStatus::active(NODE_CONFIGURED),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatus {
    #[serde(default)]
    phase: Option<String>,
    #[serde(default)]
    conditions: Vec<PodCondition>,
}

#[derive(Debug, Deserialize)]
struct PodCondition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
    #[serde(default)]
    reason: Option<String>,
}

impl PodStatus {
    fn is_ready(&self) -> bool {
        self.conditions.iter().any(|c| c.kind == "Ready" && c.status == "True")
    }

    /// Summarise the conditions that are not satisfied, e.g. "Ready=False (ContainersNotReady)"
    fn describe(&self) -> String {
        let failing: Vec<String> = self
            .conditions
            .iter()
            .filter(|c| c.status != "True")
            .map(|c| match &c.reason {
                Some(reason) => format!("{}={} ({})", c.kind, c.status, reason),
                None => format!("{}={}", c.kind, c.status),
            })
            .collect();
        if failing.is_empty() {
            format!("phase {}", self.phase.as_deref().unwrap_or("Unknown"))
        } else {
            failing.join(", ")
        }
    }
}

/// Evaluate operator pod health from the JSON pod list
pub fn operator_pod_health(output: &str) -> Result<PodHealth, serde_json::Error> {
    let pods: PodList = serde_json::from_str(output)?;
    let Some(first) = pods.items.first() else {
        return Ok(PodHealth::Absent);
    };
    if pods.items.iter().any(|p| p.status.is_ready()) {
        return Ok(PodHealth::Healthy);
    }
    Ok(PodHealth::Unhealthy(first.status.describe()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(UnitStatus::blocked("Missing license config").to_string(), "blocked: Missing license config");
        assert_eq!(UnitStatus::active("").to_string(), "active");
    }

    #[test]
    fn test_status_serde() {
        let status = UnitStatus::waiting("Waiting for CNI relation");
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, r#"{"kind":"waiting","message":"Waiting for CNI relation"}"#);
        assert_eq!(serde_json::from_str::<UnitStatus>(&json).unwrap(), status);
    }

    #[test]
    fn test_pod_absent() {
        let health = operator_pod_health(r#"{"apiVersion":"v1","items":[],"kind":"List"}"#).unwrap();
        assert_eq!(health, PodHealth::Absent);
        assert!(matches!(health.status(), UnitStatus::Waiting(_)));
    }

    #[test]
    fn test_pod_unhealthy() {
        let output = r#"{"items":[{"status":{"phase":"Running","conditions":[
            {"type":"Initialized","status":"True"},
            {"type":"Ready","status":"False","reason":"ContainersNotReady"},
            {"type":"ContainersReady","status":"False","reason":"ContainersNotReady"}
        ]}}]}"#;
        let health = operator_pod_health(output).unwrap();
        assert_eq!(
            health,
            PodHealth::Unhealthy("Ready=False (ContainersNotReady), ContainersReady=False (ContainersNotReady)".to_string())
        );
        assert_eq!(
            health.status().message(),
            "tigera-operator pod not ready: Ready=False (ContainersNotReady), ContainersReady=False (ContainersNotReady)"
        );
    }

    #[test]
    fn test_pod_pending_without_conditions() {
        let output = r#"{"items":[{"status":{"phase":"Pending"}}]}"#;
        assert_eq!(operator_pod_health(output).unwrap(), PodHealth::Unhealthy("phase Pending".to_string()));
    }

    #[test]
    fn test_pod_healthy() {
        let output = r#"{"items":[{"status":{"phase":"Running","conditions":[{"type":"Ready","status":"True"}]}}]}"#;
        let health = operator_pod_health(output).unwrap();
        assert_eq!(health, PodHealth::Healthy);
        assert_eq!(health.status(), UnitStatus::active(NODE_CONFIGURED));
    }

    #[test]
    fn test_pod_list_garbage() {
        assert!(operator_pod_health("not json").is_err());
    }
}
