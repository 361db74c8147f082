//! Per-object and per-component callbacks around the manifest processor.
//! Component hooks gate on readiness after install; the two webhook
//! components additionally wait for their certificate bundles before the
//! generic workload check.

use async_trait::async_trait;
use common::{
    controlplane::{ComponentStatus, ConditionStatus, ConditionType},
    k8sgeneric::ClusterApi,
    resourcekey::ResourceKey,
    Error, Result,
};
use kube::api::DynamicObject;
use std::collections::BTreeMap;
use tracing::info;

/// Callbacks around individual objects. Defaults are no-ops; deployments of
/// the operator may plug in patchers (e.g. endpoint auto-discovery) here.
#[async_trait]
pub trait ObjectHooks: Send + Sync {
    /// May mutate the object before it is written. An error skips this
    /// object only.
    async fn pre_process(&self, _api: &dyn ClusterApi, _obj: &mut DynamicObject) -> Result<()> {
        Ok(())
    }

    /// Invoked after an object was created; errors are logged only.
    async fn on_created(&self, _api: &dyn ClusterApi, _obj: &DynamicObject) -> Result<()> {
        Ok(())
    }

    /// Invoked after an object was pruned; errors are logged only.
    async fn on_deleted(&self, _api: &dyn ClusterApi, _obj: &DynamicObject) -> Result<()> {
        Ok(())
    }
}

pub struct NoObjectHooks;

#[async_trait]
impl ObjectHooks for NoObjectHooks {}

/// Post-install gate for one component kind.
#[async_trait]
pub trait ComponentHook: Send + Sync {
    async fn post_install(
        &self,
        api: &dyn ClusterApi,
        component: &str,
        status: &ComponentStatus,
    ) -> Result<()>;
}

static WORKLOAD_KINDS: &[&str] = &["StatefulSet", "Deployment", "DeploymentConfig"];

/// Default gate: every installed workload must report at least one ready
/// replica.
pub struct WorkloadReady;

#[async_trait]
impl ComponentHook for WorkloadReady {
    async fn post_install(
        &self,
        api: &dyn ClusterApi,
        component: &str,
        status: &ComponentStatus,
    ) -> Result<()> {
        for kind in WORKLOAD_KINDS {
            for resource in status.resources_of_kind(kind) {
                if resource.status.get_condition(ConditionType::Installed).status
                    == ConditionStatus::True
                {
                    let key: ResourceKey = resource.resource.parse()?;
                    wait_for_workload(api, component, &key).await?;
                }
            }
        }
        Ok(())
    }
}

async fn wait_for_workload(api: &dyn ClusterApi, component: &str, key: &ResourceKey) -> Result<()> {
    info!(resource = %key, "checking if workload is ready");
    // a missing workload here is a broken invariant, not a transient state
    let obj = api.get(key).await?.ok_or_else(|| Error::UnknownResource {
        kind: key.kind.clone(),
        name: key.name.clone(),
    })?;
    let ready = obj
        .data
        .pointer("/status/readyReplicas")
        .and_then(serde_json::Value::as_i64)
        .unwrap_or(0);
    if ready > 0 {
        Ok(())
    } else {
        Err(Error::ComponentNotReady {
            component: component.to_string(),
            reason: "no replica is ready".to_string(),
        })
    }
}

/// Gate for webhook-carrying components: every installed webhook
/// configuration must have a populated caBundle on each of its entries
/// before the workload check runs.
pub struct WebhookCaBundle {
    kind: &'static str,
}

impl WebhookCaBundle {
    #[must_use]
    pub fn validating() -> WebhookCaBundle {
        WebhookCaBundle {
            kind: "ValidatingWebhookConfiguration",
        }
    }

    #[must_use]
    pub fn mutating() -> WebhookCaBundle {
        WebhookCaBundle {
            kind: "MutatingWebhookConfiguration",
        }
    }
}

#[async_trait]
impl ComponentHook for WebhookCaBundle {
    async fn post_install(
        &self,
        api: &dyn ClusterApi,
        component: &str,
        status: &ComponentStatus,
    ) -> Result<()> {
        for resource in status.resources_of_kind(self.kind) {
            if resource.status.get_condition(ConditionType::Installed).status
                == ConditionStatus::True
            {
                let key: ResourceKey = resource.resource.parse()?;
                wait_for_ca_bundle(api, component, &key).await?;
            }
        }
        WorkloadReady.post_install(api, component, status).await
    }
}

async fn wait_for_ca_bundle(api: &dyn ClusterApi, component: &str, key: &ResourceKey) -> Result<()> {
    info!(resource = %key, "waiting for webhook caBundle initialization");
    let obj = api.get(key).await?.ok_or_else(|| Error::UnknownResource {
        kind: key.kind.clone(),
        name: key.name.clone(),
    })?;
    let webhooks = match obj.data.get("webhooks").and_then(serde_json::Value::as_array) {
        Some(webhooks) => webhooks.clone(),
        // no entries to certify is vacuously ready
        None => return Ok(()),
    };
    for webhook in webhooks {
        let bundle = webhook
            .pointer("/clientConfig/caBundle")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        if bundle.is_empty() {
            return Err(Error::ComponentNotReady {
                component: component.to_string(),
                reason: format!("caBundle in {} {} not set", key.kind, key.name),
            });
        }
    }
    Ok(())
}

/// Hook dispatch by component name, assembled at startup. Unlisted
/// components fall back to the generic workload gate.
pub struct HookRegistry {
    pub object: Box<dyn ObjectHooks>,
    components: BTreeMap<String, Box<dyn ComponentHook>>,
    fallback: Box<dyn ComponentHook>,
}

impl HookRegistry {
    #[must_use]
    pub fn standard() -> HookRegistry {
        let mut components: BTreeMap<String, Box<dyn ComponentHook>> = BTreeMap::new();
        components.insert(
            "mesh/charts/cert-authority".to_string(),
            Box::new(WebhookCaBundle::validating()),
        );
        components.insert(
            "mesh/charts/injection-webhook".to_string(),
            Box::new(WebhookCaBundle::mutating()),
        );
        HookRegistry {
            object: Box::new(NoObjectHooks),
            components,
            fallback: Box::new(WorkloadReady),
        }
    }

    pub fn register(&mut self, component: &str, hook: Box<dyn ComponentHook>) {
        self.components.insert(component.to_string(), hook);
    }

    pub async fn post_install(
        &self,
        api: &dyn ClusterApi,
        component: &str,
        status: &ComponentStatus,
    ) -> Result<()> {
        self.components
            .get(component)
            .unwrap_or(&self.fallback)
            .post_install(api, component, status)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::controlplane::{update_reconcile_status, ResourceStatus};
    use common::k8smock::MockCluster;

    fn installed_resource(key: &ResourceKey) -> ResourceStatus {
        let mut status = ResourceStatus::new(key.to_string());
        update_reconcile_status(&mut status.status, None);
        status
    }

    fn deployment(ready: Option<i64>) -> DynamicObject {
        let mut obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "discovery", "namespace": "mesh"},
            "spec": {"replicas": 1}
        }))
        .unwrap();
        if let Some(ready) = ready {
            obj.data["status"] = serde_json::json!({"readyReplicas": ready});
        }
        obj
    }

    fn webhook_config(bundle: Option<&str>) -> DynamicObject {
        let client_config = match bundle {
            Some(b) => serde_json::json!({"caBundle": b}),
            None => serde_json::json!({}),
        };
        serde_json::from_value(serde_json::json!({
            "apiVersion": "admissionregistration.k8s.io/v1",
            "kind": "ValidatingWebhookConfiguration",
            "metadata": {"name": "cert-authority"},
            "webhooks": [{"name": "validate.stratum.io", "clientConfig": client_config}]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn workload_with_ready_replica_passes() {
        let mock = MockCluster::new();
        let obj = deployment(Some(1));
        let key = ResourceKey::from_object(&obj).unwrap();
        mock.put(obj);
        let mut status = ComponentStatus::new("mesh/charts/discovery");
        status.push_resource(installed_resource(&key));
        assert!(WorkloadReady
            .post_install(&mock, "mesh/charts/discovery", &status)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn workload_with_no_ready_replica_is_not_ready() {
        let mock = MockCluster::new();
        let obj = deployment(Some(0));
        let key = ResourceKey::from_object(&obj).unwrap();
        mock.put(obj);
        let mut status = ComponentStatus::new("mesh/charts/discovery");
        status.push_resource(installed_resource(&key));
        let err = WorkloadReady
            .post_install(&mock, "mesh/charts/discovery", &status)
            .await
            .unwrap_err();
        assert!(err.is_not_ready());
    }

    #[tokio::test]
    async fn waiting_on_an_unknown_workload_is_a_hard_error() {
        let mock = MockCluster::new();
        let key = ResourceKey::new("apps/v1", "Deployment", Some("mesh"), "ghost");
        let mut status = ComponentStatus::new("mesh/charts/discovery");
        status.push_resource(installed_resource(&key));
        let err = WorkloadReady
            .post_install(&mock, "mesh/charts/discovery", &status)
            .await
            .unwrap_err();
        assert!(!err.is_not_ready());
        assert!(matches!(err, Error::UnknownResource { .. }));
    }

    #[tokio::test]
    async fn resources_not_marked_installed_are_skipped() {
        let mock = MockCluster::new();
        // nothing stored in the cluster, but the resource is not Installed
        let key = ResourceKey::new("apps/v1", "Deployment", Some("mesh"), "ghost");
        let mut status = ComponentStatus::new("mesh/charts/discovery");
        status.push_resource(ResourceStatus::new(key.to_string()));
        assert!(WorkloadReady
            .post_install(&mock, "mesh/charts/discovery", &status)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn missing_ca_bundle_is_not_ready() {
        let mock = MockCluster::new();
        let obj = webhook_config(None);
        let key = ResourceKey::from_object(&obj).unwrap();
        mock.put(obj);
        let mut status = ComponentStatus::new("mesh/charts/cert-authority");
        status.push_resource(installed_resource(&key));
        let err = WebhookCaBundle::validating()
            .post_install(&mock, "mesh/charts/cert-authority", &status)
            .await
            .unwrap_err();
        assert!(err.is_not_ready());
    }

    #[tokio::test]
    async fn populated_ca_bundle_is_ready() {
        let mock = MockCluster::new();
        let obj = webhook_config(Some("Q0VSVA=="));
        let key = ResourceKey::from_object(&obj).unwrap();
        mock.put(obj);
        let mut status = ComponentStatus::new("mesh/charts/cert-authority");
        status.push_resource(installed_resource(&key));
        assert!(WebhookCaBundle::validating()
            .post_install(&mock, "mesh/charts/cert-authority", &status)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn webhook_config_without_entries_is_vacuously_ready() {
        let mock = MockCluster::new();
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "admissionregistration.k8s.io/v1",
            "kind": "ValidatingWebhookConfiguration",
            "metadata": {"name": "cert-authority"},
        }))
        .unwrap();
        let key = ResourceKey::from_object(&obj).unwrap();
        mock.put(obj);
        let mut status = ComponentStatus::new("mesh/charts/cert-authority");
        status.push_resource(installed_resource(&key));
        assert!(WebhookCaBundle::validating()
            .post_install(&mock, "mesh/charts/cert-authority", &status)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn registry_routes_webhook_components_and_falls_back() {
        let registry = HookRegistry::standard();
        let mock = MockCluster::new();
        let obj = webhook_config(None);
        let key = ResourceKey::from_object(&obj).unwrap();
        mock.put(obj);
        let mut status = ComponentStatus::new("mesh/charts/cert-authority");
        status.push_resource(installed_resource(&key));
        let err = registry
            .post_install(&mock, "mesh/charts/cert-authority", &status)
            .await
            .unwrap_err();
        assert!(err.is_not_ready());
        // unlisted component with no workloads: fallback gate passes
        let empty = ComponentStatus::new("mesh/charts/dashboard");
        assert!(registry
            .post_install(&mock, "mesh/charts/dashboard", &empty)
            .await
            .is_ok());
    }
}
