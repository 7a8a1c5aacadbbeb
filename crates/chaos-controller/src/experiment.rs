//! Experiment model: the desired chaos action, its selector and the
//! per-target records the reconciler maintains.

use std::fmt;
use std::time::Duration;

use chaos_core::util::parse_duration;
use chaos_core::{ChaosError, Phase, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A chaos experiment as read from its manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub name: String,
    pub spec: ExperimentSpec,
    #[serde(default)]
    pub status: ExperimentStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSpec {
    pub fault: FaultSpec,
    pub selector: Selector,
    /// How long the experiment runs before it is stopped (`30s`, `5m`, `1h`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default)]
    pub desired: DesiredState,
}

/// Fault kind and its kind-specific parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultSpec {
    pub kind: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl FaultSpec {
    /// sha256 over the kind and the canonical JSON of the parameters
    pub fn signature(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kind.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.params.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Which targets the experiment applies to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    pub namespace: String,
    /// Pod names; empty selects every pod in the namespace
    #[serde(default)]
    pub pods: Vec<String>,
    /// Container name; unset selects every container of the pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

impl Selector {
    pub fn matches(&self, id: &RecordId) -> bool {
        id.namespace == self.namespace
            && (self.pods.is_empty() || self.pods.iter().any(|p| *p == id.pod))
            && self.container.as_ref().is_none_or(|c| *c == id.container)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    #[default]
    Run,
    Stop,
}

/// Stable identity of a target: namespace, pod and container name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl RecordId {
    pub fn new(namespace: &str, pod: &str, container: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            container: container.to_string(),
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.pod, self.container)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Apply,
    Recover,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Apply => write!(f, "apply"),
            Operation::Recover => write!(f, "recover"),
        }
    }
}

/// Last failed operation on a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub operation: Operation,
    pub attempts: u32,
    pub last_error: String,
    /// Permanent failure that exhausted its attempts
    #[serde(default)]
    pub gave_up: bool,
    /// Signature of the fault spec the failing operation ran with
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry: Option<DateTime<Utc>>,
}

/// Per-target state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub phase: Phase,
    /// Whether the target currently matches the selector
    #[serde(default = "default_true")]
    pub selected: bool,
    /// Signature of the fault spec the injection was applied with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default)]
    pub injected_count: u32,
    #[serde(default)]
    pub recovered_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
}

fn default_true() -> bool {
    true
}

impl Record {
    pub fn new(id: RecordId) -> Self {
        Self {
            id,
            phase: Phase::NotInjected,
            selected: true,
            signature: None,
            injected_count: 0,
            recovered_count: 0,
            failure: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExperimentStatus {
    #[serde(default)]
    pub records: Vec<Record>,
    /// Every record that still exists is `Injected`
    #[serde(default)]
    pub all_injected: bool,
    /// Every record that still exists is `NotInjected`
    #[serde(default)]
    pub all_recovered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ExperimentStatus {
    /// Reconcile the record list with the currently selected targets.
    ///
    /// New targets are appended as `NotInjected`. Records that no longer
    /// match are dropped unless they still hold an injection, in which case
    /// they stay (deselected) until recovered.
    pub fn sync_records(&mut self, selected: &[RecordId]) {
        for record in &mut self.records {
            record.selected = selected.contains(&record.id);
        }

        self.records
            .retain(|r| r.selected || r.phase == Phase::Injected);

        for id in selected {
            if !self.records.iter().any(|r| r.id == *id) {
                self.records.push(Record::new(id.clone()));
            }
        }
    }

    pub fn refresh_conditions(&mut self) {
        let live: Vec<&Record> = self
            .records
            .iter()
            .filter(|r| r.phase != Phase::NotExist)
            .collect();

        self.all_injected = live.iter().all(|r| r.phase == Phase::Injected);
        self.all_recovered = live.iter().all(|r| r.phase == Phase::NotInjected);
        self.updated_at = Some(Utc::now());
    }

    pub fn count(&self, phase: Phase) -> usize {
        self.records.iter().filter(|r| r.phase == phase).count()
    }

    /// Records whose last failure was given up on
    pub fn stalled(&self) -> impl Iterator<Item = &Record> {
        self.records
            .iter()
            .filter(|r| r.failure.as_ref().is_some_and(|f| f.gave_up))
    }
}

impl Experiment {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ChaosError::InvalidConfig(
                "Experiment name cannot be empty".to_string(),
            ));
        }

        if self.spec.fault.kind.is_empty() {
            return Err(ChaosError::InvalidConfig(
                "Fault kind cannot be empty".to_string(),
            ));
        }

        if self.spec.selector.namespace.is_empty() {
            return Err(ChaosError::InvalidConfig(
                "Selector namespace cannot be empty".to_string(),
            ));
        }

        self.duration()?;
        Ok(())
    }

    pub fn duration(&self) -> Result<Option<Duration>> {
        self.spec.duration.as_deref().map(parse_duration).transpose()
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| ChaosError::InvalidConfig(format!("Invalid experiment manifest: {}", e)))
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| ChaosError::InvalidConfig(format!("Cannot serialize experiment: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
name: kill-nginx
spec:
  fault:
    kind: exec
    params:
      apply: ["pkill", "nginx"]
      recover: ["nginx"]
  selector:
    namespace: web
    pods: [frontend-0]
  duration: 5m
"#;

    fn ids(names: &[&str]) -> Vec<RecordId> {
        names.iter().map(|p| RecordId::new("web", p, "app")).collect()
    }

    #[test]
    fn test_parse_manifest() {
        let exp = Experiment::from_yaml(MANIFEST).unwrap();
        assert_eq!(exp.spec.fault.kind, "exec");
        assert_eq!(exp.spec.desired, DesiredState::Run);
        assert_eq!(exp.duration().unwrap(), Some(Duration::from_secs(300)));
        assert!(exp.status.records.is_empty());
        exp.validate().unwrap();
    }

    #[test]
    fn test_json_manifest_is_accepted() {
        let json = r#"{"name": "ps", "spec": {"fault": {"kind": "process-list"},
            "selector": {"namespace": "default"}}}"#;
        let exp = Experiment::from_yaml(json).unwrap();
        assert_eq!(exp.spec.fault.kind, "process-list");
        assert!(exp.spec.fault.params.is_null());
    }

    #[test]
    fn test_validate_rejects_bad_duration() {
        let mut exp = Experiment::from_yaml(MANIFEST).unwrap();
        exp.spec.duration = Some("soon".to_string());
        assert!(exp.validate().is_err());
    }

    #[test]
    fn test_signature_tracks_params() {
        let exp = Experiment::from_yaml(MANIFEST).unwrap();
        let before = exp.spec.fault.signature();

        let mut changed = exp.spec.fault.clone();
        changed.params["apply"] = serde_json::json!(["pkill", "-9", "nginx"]);
        assert_ne!(before, changed.signature());
        assert_eq!(before, exp.spec.fault.clone().signature());
        assert_eq!(before.len(), 64);
    }

    #[test]
    fn test_selector_matches() {
        let selector = Selector {
            namespace: "web".to_string(),
            pods: Vec::new(),
            container: Some("app".to_string()),
        };
        assert!(selector.matches(&RecordId::new("web", "any", "app")));
        assert!(!selector.matches(&RecordId::new("web", "any", "sidecar")));
        assert!(!selector.matches(&RecordId::new("db", "any", "app")));
    }

    #[test]
    fn test_sync_records_adds_and_prunes() {
        let mut status = ExperimentStatus::default();
        status.sync_records(&ids(&["a", "b"]));
        assert_eq!(status.records.len(), 2);

        status.records[0].phase = Phase::Injected;
        status.sync_records(&ids(&["c"]));

        let pods: Vec<&str> = status.records.iter().map(|r| r.id.pod.as_str()).collect();
        assert_eq!(pods, vec!["a", "c"]);
        assert!(!status.records[0].selected);
        assert!(status.records[1].selected);
    }

    #[test]
    fn test_sync_records_keeps_order_and_state() {
        let mut status = ExperimentStatus::default();
        status.sync_records(&ids(&["a", "b"]));
        status.records[1].injected_count = 2;

        status.sync_records(&ids(&["b", "a"]));
        assert_eq!(status.records[0].id.pod, "a");
        assert_eq!(status.records[1].injected_count, 2);
    }

    #[test]
    fn test_conditions_ignore_not_exist() {
        let mut status = ExperimentStatus::default();
        status.sync_records(&ids(&["a", "b"]));
        status.records[0].phase = Phase::Injected;
        status.records[1].phase = Phase::NotExist;

        status.refresh_conditions();
        assert!(status.all_injected);
        assert!(!status.all_recovered);

        status.records[0].phase = Phase::NotInjected;
        status.refresh_conditions();
        assert!(status.all_recovered);
    }
}
