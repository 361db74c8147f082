use crate::{resourcekey::ResourceKey, Error};
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Custom resource describing the desired state of a Stratum control plane.
/// The operator renders its component charts and converges the cluster
/// toward them.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "ControlPlane",
    status = "ControlPlaneStatus",
    shortname = "scp",
    group = "stratum.io",
    version = "v1",
    namespaced
)]
#[kube(
    doc = "Custom resource representing a Stratum control plane installation",
    printcolumn = r#"
    {"name":"version", "type":"string", "description":"Release", "jsonPath":".spec.version"},
    {"name":"reconciled", "type":"string", "description":"Reconciled", "jsonPath":".status.conditions[?(@.type == 'Reconciled')].status"},
    {"name":"last_transition", "type":"date", "description":"Last transition", "format": "date-time", "jsonPath":".status.conditions[?(@.type == 'Reconciled')].lastTransitionTime"},
    {"name":"errors", "type":"string", "description":"Errors", "jsonPath":".status.conditions[?(@.status == 'False')].message"}"#
)]
pub struct ControlPlaneSpec {
    /// The control plane release to install
    pub version: Option<String>,
    /// Values for the core mesh components
    pub mesh: serde_json::Map<String, serde_json::Value>,
    /// Values for the metering add-on; rendered only when enabled
    pub metering: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema)]
pub enum ConditionType {
    Installed,
    Reconciled,
    Ready,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// A typed, timestamped flag describing one aspect of a resource or
/// component. At most one condition per type is held at a time.
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of the condition
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    /// Status ("True", "False" or "Unknown") of the condition
    pub status: ConditionStatus,
    /// Machine-readable reason for the last transition
    pub reason: String,
    /// Human-readable message matching the reason
    pub message: String,
    /// Last time the condition changed status or reason
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    pub fn new(
        condition_type: ConditionType,
        status: ConditionStatus,
        reason: &str,
        message: &str,
    ) -> Condition {
        Condition {
            condition_type,
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: None,
        }
    }
}

pub static REASON_INSTALL_SUCCESSFUL: &str = "InstallSuccessful";
pub static REASON_INSTALL_ERROR: &str = "InstallError";
pub static REASON_RECONCILE_SUCCESSFUL: &str = "ReconcileSuccessful";
pub static REASON_RECONCILE_ERROR: &str = "ReconcileError";
pub static REASON_DELETION_SUCCESSFUL: &str = "DeletionSuccessful";
pub static REASON_DELETION_ERROR: &str = "DeletionError";

/// Observed generation plus the active condition set, shared by every level
/// of the status tree.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusType {
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl StatusType {
    /// Returns the active condition of the given type, or an Unknown
    /// placeholder when none is set.
    pub fn get_condition(&self, condition_type: ConditionType) -> Condition {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
            .cloned()
            .unwrap_or_else(|| {
                Condition::new(condition_type, ConditionStatus::Unknown, "", "")
            })
    }

    /// Installs a condition, replacing any prior entry of the same type. The
    /// transition time is carried over unless status or reason changed.
    pub fn set_condition(&mut self, mut condition: Condition) {
        let now = Utc::now();
        for prev in self.conditions.iter_mut() {
            if prev.condition_type == condition.condition_type {
                if prev.status != condition.status || prev.reason != condition.reason {
                    condition.last_transition_time = Some(now);
                } else {
                    condition.last_transition_time = prev.last_transition_time;
                }
                *prev = condition;
                return;
            }
        }
        condition.last_transition_time = Some(now);
        self.conditions.push(condition);
    }

    pub fn remove_condition(&mut self, condition_type: ConditionType) {
        self.conditions.retain(|c| c.condition_type != condition_type);
    }
}

/// Folds an apply outcome into a status. First successful install flips
/// Installed to True; later passes only refresh Reconciled.
pub fn update_reconcile_status(status: &mut StatusType, err: Option<&Error>) {
    let installed = status.get_condition(ConditionType::Installed).status;
    match err {
        None => {
            if installed != ConditionStatus::True {
                status.set_condition(Condition::new(
                    ConditionType::Installed,
                    ConditionStatus::True,
                    REASON_INSTALL_SUCCESSFUL,
                    "install successful",
                ));
                status.set_condition(Condition::new(
                    ConditionType::Reconciled,
                    ConditionStatus::True,
                    REASON_INSTALL_SUCCESSFUL,
                    "install successful",
                ));
            } else {
                status.set_condition(Condition::new(
                    ConditionType::Reconciled,
                    ConditionStatus::True,
                    REASON_RECONCILE_SUCCESSFUL,
                    "reconcile successful",
                ));
            }
        }
        Some(err) if installed == ConditionStatus::Unknown => {
            let message = err.to_string();
            status.set_condition(Condition::new(
                ConditionType::Installed,
                ConditionStatus::False,
                REASON_INSTALL_ERROR,
                &message,
            ));
            status.set_condition(Condition::new(
                ConditionType::Reconciled,
                ConditionStatus::False,
                REASON_INSTALL_ERROR,
                &message,
            ));
        }
        Some(err) => {
            status.set_condition(Condition::new(
                ConditionType::Reconciled,
                ConditionStatus::False,
                REASON_RECONCILE_ERROR,
                &err.to_string(),
            ));
        }
    }
}

/// Folds a delete outcome into a status. Successful deletion turns Installed
/// explicitly False, which is what keeps the prune pass from retrying it.
pub fn update_delete_status(status: &mut StatusType, err: Option<&Error>) {
    match err {
        None => {
            status.set_condition(Condition::new(
                ConditionType::Installed,
                ConditionStatus::False,
                REASON_DELETION_SUCCESSFUL,
                "deletion successful",
            ));
            status.set_condition(Condition::new(
                ConditionType::Reconciled,
                ConditionStatus::True,
                REASON_DELETION_SUCCESSFUL,
                "deletion successful",
            ));
        }
        Some(err) => {
            status.set_condition(Condition::new(
                ConditionType::Reconciled,
                ConditionStatus::False,
                REASON_DELETION_ERROR,
                &err.to_string(),
            ));
        }
    }
}

/// Last-known reconciliation outcome for one managed object, keyed by its
/// rendered ResourceKey string.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    /// ResourceKey of the object, in display form
    pub resource: String,
    #[serde(flatten)]
    pub status: StatusType,
}

impl ResourceStatus {
    pub fn new(resource: String) -> ResourceStatus {
        ResourceStatus {
            resource,
            status: StatusType::default(),
        }
    }
}

/// Status of one named, independently rendered component.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    /// Name of the rendered component
    pub name: String,
    #[serde(flatten)]
    pub status: StatusType,
    /// Per-object statuses, in rendered order, no duplicate keys
    #[serde(default)]
    pub resources: Vec<ResourceStatus>,
}

impl ComponentStatus {
    pub fn new(name: &str) -> ComponentStatus {
        ComponentStatus {
            name: name.to_string(),
            status: StatusType::default(),
            resources: Vec::new(),
        }
    }

    pub fn find_resource(&self, resource: &str) -> Option<&ResourceStatus> {
        self.resources.iter().find(|r| r.resource == resource)
    }

    /// Appends a resource status, replacing any prior entry with the same
    /// key so the sequence never holds duplicates.
    pub fn push_resource(&mut self, resource: ResourceStatus) {
        if let Some(prev) = self
            .resources
            .iter_mut()
            .find(|r| r.resource == resource.resource)
        {
            *prev = resource;
        } else {
            self.resources.push(resource);
        }
    }

    /// All resource statuses whose key parses to the given kind.
    pub fn resources_of_kind(&self, kind: &str) -> Vec<&ResourceStatus> {
        self.resources
            .iter()
            .filter(|r| {
                r.resource
                    .parse::<ResourceKey>()
                    .map(|k| k.kind == kind)
                    .unwrap_or(false)
            })
            .collect()
    }
}

/// The status object of `ControlPlane`. Owned exclusively by the
/// orchestrator for the duration of a pass and written back atomically.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneStatus {
    #[serde(flatten)]
    pub status: StatusType,
    /// One entry per component that produced renderings
    #[serde(default)]
    pub components: Vec<ComponentStatus>,
}

impl ControlPlaneStatus {
    pub fn find_component(&self, name: &str) -> Option<&ComponentStatus> {
        self.components.iter().find(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn installed(status: ConditionStatus) -> Condition {
        Condition::new(ConditionType::Installed, status, "test", "test")
    }

    #[test]
    fn get_condition_defaults_to_unknown() {
        let status = StatusType::default();
        let cond = status.get_condition(ConditionType::Reconciled);
        assert_eq!(cond.status, ConditionStatus::Unknown);
    }

    #[test]
    fn set_condition_holds_one_entry_per_type() {
        let mut status = StatusType::default();
        status.set_condition(installed(ConditionStatus::True));
        status.set_condition(installed(ConditionStatus::False));
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(
            status.get_condition(ConditionType::Installed).status,
            ConditionStatus::False
        );
    }

    #[test]
    fn transition_time_only_moves_on_status_or_reason_change() {
        let mut status = StatusType::default();
        status.set_condition(installed(ConditionStatus::True));
        let first = status
            .get_condition(ConditionType::Installed)
            .last_transition_time;
        assert!(first.is_some());

        // same status, same reason, new message: timestamp carried over
        let mut same = installed(ConditionStatus::True);
        same.message = "something else".to_string();
        status.set_condition(same);
        assert_eq!(
            status
                .get_condition(ConditionType::Installed)
                .last_transition_time,
            first
        );
        assert_eq!(
            status.get_condition(ConditionType::Installed).message,
            "something else"
        );

        // status flipped: timestamp moves
        status.set_condition(installed(ConditionStatus::False));
        assert_ne!(
            status
                .get_condition(ConditionType::Installed)
                .last_transition_time,
            first
        );
    }

    #[test]
    fn remove_condition_drops_only_that_type() {
        let mut status = StatusType::default();
        status.set_condition(installed(ConditionStatus::True));
        status.set_condition(Condition::new(
            ConditionType::Reconciled,
            ConditionStatus::True,
            "test",
            "test",
        ));
        status.remove_condition(ConditionType::Reconciled);
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(
            status.conditions[0].condition_type,
            ConditionType::Installed
        );
    }

    #[test]
    fn first_success_installs_then_reconciles() {
        let mut status = StatusType::default();
        update_reconcile_status(&mut status, None);
        assert_eq!(
            status.get_condition(ConditionType::Installed).status,
            ConditionStatus::True
        );
        assert_eq!(
            status.get_condition(ConditionType::Reconciled).reason,
            REASON_INSTALL_SUCCESSFUL
        );

        update_reconcile_status(&mut status, None);
        assert_eq!(
            status.get_condition(ConditionType::Reconciled).reason,
            REASON_RECONCILE_SUCCESSFUL
        );
    }

    #[test]
    fn failure_before_install_marks_both_conditions() {
        let mut status = StatusType::default();
        update_reconcile_status(&mut status, Some(&Error::Other("boom".into())));
        assert_eq!(
            status.get_condition(ConditionType::Installed).status,
            ConditionStatus::False
        );
        assert_eq!(
            status.get_condition(ConditionType::Reconciled).reason,
            REASON_INSTALL_ERROR
        );
    }

    #[test]
    fn failure_after_install_keeps_installed_true() {
        let mut status = StatusType::default();
        update_reconcile_status(&mut status, None);
        update_reconcile_status(&mut status, Some(&Error::Other("boom".into())));
        assert_eq!(
            status.get_condition(ConditionType::Installed).status,
            ConditionStatus::True
        );
        assert_eq!(
            status.get_condition(ConditionType::Reconciled).status,
            ConditionStatus::False
        );
    }

    #[test]
    fn delete_success_turns_installed_explicitly_false() {
        let mut status = StatusType::default();
        update_reconcile_status(&mut status, None);
        update_delete_status(&mut status, None);
        assert_eq!(
            status.get_condition(ConditionType::Installed).status,
            ConditionStatus::False
        );
        assert_eq!(
            status.get_condition(ConditionType::Reconciled).status,
            ConditionStatus::True
        );
    }

    #[test]
    fn push_resource_replaces_duplicates() {
        let mut component = ComponentStatus::new("mesh");
        let mut first = ResourceStatus::new("v1/ConfigMap/mesh/cfg".into());
        first.status.observed_generation = 1;
        component.push_resource(first);
        let mut second = ResourceStatus::new("v1/ConfigMap/mesh/cfg".into());
        second.status.observed_generation = 2;
        component.push_resource(second);
        assert_eq!(component.resources.len(), 1);
        assert_eq!(component.resources[0].status.observed_generation, 2);
    }

    #[test]
    fn resources_of_kind_filters_by_parsed_key() {
        let mut component = ComponentStatus::new("mesh");
        component.push_resource(ResourceStatus::new(
            "apps/v1/Deployment/mesh/discovery".into(),
        ));
        component.push_resource(ResourceStatus::new("v1/Service/mesh/discovery".into()));
        let deployments = component.resources_of_kind("Deployment");
        assert_eq!(deployments.len(), 1);
        assert_eq!(deployments[0].resource, "apps/v1/Deployment/mesh/discovery");
    }
}
