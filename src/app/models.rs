use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a work item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkItemStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

impl WorkItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
        }
    }

    /// `Complete` and `Failed` see no further automatic transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl std::fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETE" => Ok(Self::Complete),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("Invalid work item status: {}", s)),
        }
    }
}

/// The "web" resource: one analysis job and its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub id: String,
    pub owner_id: String,
    pub space_id: Option<String>,
    pub title: Option<String>,
    pub source_urls: Vec<String>,
    pub status: WorkItemStatus,
    pub run_id: Option<String>,
    pub result_payload: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    /// Derived from `result.summary` when a run completes.
    pub summary: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl WorkItem {
    /// Check the status/field invariants; returns the first violation.
    pub fn check_invariants(&self) -> Result<(), String> {
        match self.status {
            WorkItemStatus::Processing if self.run_id.is_none() => {
                Err(format!("{} is PROCESSING without a runId", self.id))
            }
            WorkItemStatus::Complete if self.result_payload.is_none() => {
                Err(format!("{} is COMPLETE without a resultPayload", self.id))
            }
            WorkItemStatus::Complete if self.failure_reason.is_some() => {
                Err(format!("{} is COMPLETE with a failureReason", self.id))
            }
            WorkItemStatus::Failed if self.failure_reason.is_none() => {
                Err(format!("{} is FAILED without a failureReason", self.id))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Space {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            _ => Err(format!("Invalid message role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub work_item_id: String,
    pub owner_id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: String,
}

/// An entity extracted from a completed run's result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    pub work_item_id: String,
    pub name: String,
    pub kind: Option<String>,
    pub data: Option<serde_json::Value>,
}

/// Entity fields before insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntity {
    pub name: String,
    pub kind: Option<String>,
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserSettings {
    pub user_id: String,
    pub settings: serde_json::Value,
    pub updated_at: String,
}

/// Fields a completed run contributes beyond the raw payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DerivedResult {
    pub summary: Option<String>,
    pub entities: Vec<NewEntity>,
}

impl DerivedResult {
    /// Pull `summary` and `entities` out of a runner result.
    ///
    /// Entities without a string `name` are skipped. `kind` falls back to
    /// `type`; all other keys are kept in `data`.
    pub fn from_result(result: &serde_json::Value) -> Self {
        let summary = result
            .get("summary")
            .and_then(|s| s.as_str())
            .map(|s| s.to_string());

        let entities = result
            .get("entities")
            .and_then(|e| e.as_array())
            .map(|items| items.iter().filter_map(entity_from_value).collect())
            .unwrap_or_default();

        Self { summary, entities }
    }
}

fn entity_from_value(value: &serde_json::Value) -> Option<NewEntity> {
    let obj = value.as_object()?;
    let name = obj.get("name")?.as_str()?.to_string();
    let kind = obj
        .get("kind")
        .or_else(|| obj.get("type"))
        .and_then(|k| k.as_str())
        .map(|k| k.to_string());
    let rest: serde_json::Map<String, serde_json::Value> = obj
        .iter()
        .filter(|(k, _)| !matches!(k.as_str(), "name" | "kind" | "type"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let data = (!rest.is_empty()).then(|| serde_json::Value::Object(rest));
    Some(NewEntity { name, kind, data })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(status: WorkItemStatus) -> WorkItem {
        WorkItem {
            id: "w1".to_string(),
            owner_id: "u1".to_string(),
            space_id: None,
            title: None,
            source_urls: vec!["https://example.com".to_string()],
            status,
            run_id: None,
            result_payload: None,
            failure_reason: None,
            summary: None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn test_status_wire_format() {
        let json = serde_json::to_string(&WorkItemStatus::Processing).unwrap();
        assert_eq!(json, "\"PROCESSING\"");
        let parsed: WorkItemStatus = serde_json::from_str("\"COMPLETE\"").unwrap();
        assert_eq!(parsed, WorkItemStatus::Complete);
    }

    #[test]
    fn test_status_from_str_matches_as_str() {
        for status in [
            WorkItemStatus::Pending,
            WorkItemStatus::Processing,
            WorkItemStatus::Complete,
            WorkItemStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<WorkItemStatus>().unwrap(), status);
        }
        assert!("complete".parse::<WorkItemStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(WorkItemStatus::Complete.is_terminal());
        assert!(WorkItemStatus::Failed.is_terminal());
        assert!(!WorkItemStatus::Pending.is_terminal());
        assert!(!WorkItemStatus::Processing.is_terminal());
    }

    #[test]
    fn test_work_item_serializes_camel_case() {
        let value = serde_json::to_value(item(WorkItemStatus::Pending)).unwrap();
        assert_eq!(value["ownerId"], "u1");
        assert_eq!(value["sourceUrls"][0], "https://example.com");
        assert!(value["runId"].is_null());
        assert_eq!(value["status"], "PENDING");
    }

    #[test]
    fn test_invariants() {
        assert!(item(WorkItemStatus::Pending).check_invariants().is_ok());
        assert!(item(WorkItemStatus::Processing).check_invariants().is_err());
        assert!(item(WorkItemStatus::Complete).check_invariants().is_err());
        assert!(item(WorkItemStatus::Failed).check_invariants().is_err());

        let mut complete = item(WorkItemStatus::Complete);
        complete.result_payload = Some(json!({"ok": true}));
        assert!(complete.check_invariants().is_ok());
        complete.failure_reason = Some("late".to_string());
        assert!(complete.check_invariants().is_err());
    }

    #[test]
    fn test_derived_result_extracts_summary_and_entities() {
        let result = json!({
            "summary": "Two companies mentioned",
            "entities": [
                {"name": "Acme", "type": "organization", "url": "https://acme.test"},
                {"name": "Globex", "kind": "organization"},
                {"kind": "person"},
                "not an object"
            ]
        });
        let derived = DerivedResult::from_result(&result);
        assert_eq!(derived.summary.as_deref(), Some("Two companies mentioned"));
        assert_eq!(derived.entities.len(), 2);
        assert_eq!(derived.entities[0].name, "Acme");
        assert_eq!(derived.entities[0].kind.as_deref(), Some("organization"));
        assert_eq!(
            derived.entities[0].data,
            Some(json!({"url": "https://acme.test"}))
        );
        assert_eq!(derived.entities[1].data, None);
    }

    #[test]
    fn test_derived_result_tolerates_arbitrary_payloads() {
        assert_eq!(DerivedResult::from_result(&json!([1, 2, 3])), DerivedResult::default());
        assert_eq!(DerivedResult::from_result(&json!("text")), DerivedResult::default());
    }
}
