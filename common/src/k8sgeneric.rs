use crate::{
    controlplane::{ControlPlane, ControlPlaneStatus},
    resourcekey::ResourceKey,
    Error, Result, LAST_APPLIED_ANNOTATION,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams},
    core::GroupVersionKind,
    discovery::Scope,
    Client,
};
use serde_json::json;
use tracing::debug;

/// Field manager / server-side-apply identity of the operator.
pub static CLIENT_NAME: &str = "controller.stratum.io";

/// The orchestration API as seen by the reconciliation core. All calls are
/// cancellable through the surrounding task; none retries internally.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch an object by key; None when it does not exist.
    async fn get(&self, key: &ResourceKey) -> Result<Option<DynamicObject>>;
    /// Create a new object.
    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject>;
    /// Server-side apply of the desired state over an existing object.
    async fn apply(&self, key: &ResourceKey, desired: &DynamicObject) -> Result<DynamicObject>;
    /// Foreground-cascading delete; Ok(false) when the object was already
    /// gone, which callers treat as success.
    async fn delete(&self, key: &ResourceKey) -> Result<bool>;
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>>;
    async fn update_namespace(&self, ns: &Namespace) -> Result<Namespace>;
    /// Write back the ControlPlane status subresource.
    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ControlPlaneStatus,
    ) -> Result<()>;
}

/// Discovery-backed implementation over a real cluster.
#[derive(Clone)]
pub struct K8sCluster {
    client: Client,
}

impl K8sCluster {
    #[must_use]
    pub fn new(client: Client) -> K8sCluster {
        K8sCluster { client }
    }

    async fn dynamic_api(&self, key: &ResourceKey) -> Result<Api<DynamicObject>> {
        let (group, version) = match key.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", key.api_version.as_str()),
        };
        let gvk = GroupVersionKind::gvk(group, version, &key.kind);
        let (res, caps) = kube::discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(Error::KubeError)?;
        let api = match (&caps.scope, &key.namespace) {
            (Scope::Namespaced, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &res),
            _ => Api::all_with(self.client.clone(), &res),
        };
        Ok(api)
    }
}

#[async_trait]
impl ClusterApi for K8sCluster {
    async fn get(&self, key: &ResourceKey) -> Result<Option<DynamicObject>> {
        let api = self.dynamic_api(key).await?;
        api.get_opt(&key.name).await.map_err(Error::KubeError)
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ResourceKey::from_object(obj)?;
        let api = self.dynamic_api(&key).await?;
        api.create(&PostParams::default(), obj)
            .await
            .map_err(Error::KubeError)
    }

    async fn apply(&self, key: &ResourceKey, desired: &DynamicObject) -> Result<DynamicObject> {
        debug!(resource = %key, "applying desired state");
        let api = self.dynamic_api(key).await?;
        api.patch(
            &key.name,
            &PatchParams::apply(CLIENT_NAME).force(),
            &Patch::Apply(desired),
        )
        .await
        .map_err(Error::KubeError)
    }

    async fn delete(&self, key: &ResourceKey) -> Result<bool> {
        debug!(resource = %key, "deleting with foreground cascade");
        let api = self.dynamic_api(key).await?;
        match api.delete(&key.name, &DeleteParams::foreground()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 || ae.code == 410 => Ok(false),
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        let api = Api::<Namespace>::all(self.client.clone());
        api.get_opt(name).await.map_err(Error::KubeError)
    }

    async fn update_namespace(&self, ns: &Namespace) -> Result<Namespace> {
        let api = Api::<Namespace>::all(self.client.clone());
        let name = ns.metadata.name.clone().unwrap_or_default();
        api.replace(&name, &PostParams::default(), ns)
            .await
            .map_err(Error::KubeError)
    }

    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ControlPlaneStatus,
    ) -> Result<()> {
        let api = Api::<ControlPlane>::namespaced(self.client.clone(), namespace);
        let patch: Patch<serde_json::Value> = Patch::Merge(json!({
            "apiVersion": "stratum.io/v1",
            "kind": "ControlPlane",
            "status": status
        }));
        let ps = PatchParams::apply(CLIENT_NAME);
        api.patch_status(name, &ps, &patch)
            .await
            .map(|_| ())
            .map_err(Error::KubeError)
    }
}

pub fn set_label(obj: &mut DynamicObject, key: &str, value: &str) {
    obj.metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(key.to_string(), value.to_string());
}

pub fn set_annotation(obj: &mut DynamicObject, key: &str, value: &str) {
    obj.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(key.to_string(), value.to_string());
}

/// Canonical JSON of an object, excluding its own last-applied annotation so
/// the value is stable across passes.
pub fn canonical_json(obj: &DynamicObject) -> Result<String> {
    let mut obj = obj.clone();
    if let Some(annotations) = obj.metadata.annotations.as_mut() {
        annotations.remove(LAST_APPLIED_ANNOTATION);
        if annotations.is_empty() {
            obj.metadata.annotations = None;
        }
    }
    serde_json::to_string(&obj).map_err(Error::SerializationError)
}

/// Records the configuration about to be written so the next pass can detect
/// a no-op without a field-by-field comparison against server state.
pub fn stamp_last_applied(obj: &mut DynamicObject) -> Result<()> {
    let canonical = canonical_json(obj)?;
    set_annotation(obj, LAST_APPLIED_ANNOTATION, &canonical);
    Ok(())
}

/// Computes the patch that would bring the live object to the desired state,
/// or None when the desired state is already in effect. The comparison runs
/// against the live object's last-applied annotation when present, falling
/// back to the live object with server-populated fields stripped.
pub fn compute_patch(
    live: &DynamicObject,
    desired: &DynamicObject,
) -> Result<Option<json_patch::Patch>> {
    let desired_canonical = canonical_json(desired)?;
    let desired_value: serde_json::Value = serde_json::from_str(&desired_canonical)?;
    let base: serde_json::Value = match live
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(LAST_APPLIED_ANNOTATION))
    {
        Some(prev) if *prev == desired_canonical => return Ok(None),
        Some(prev) => serde_json::from_str(prev)?,
        None => strip_server_fields(serde_json::to_value(live)?),
    };
    let patch = json_patch::diff(&base, &desired_value);
    if patch.0.is_empty() {
        Ok(None)
    } else {
        Ok(Some(patch))
    }
}

// Drops the fields the API server owns before diffing against an object that
// was not written by this operator.
fn strip_server_fields(mut value: serde_json::Value) -> serde_json::Value {
    if let Some(obj) = value.as_object_mut() {
        obj.remove("status");
        if let Some(metadata) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            for field in [
                "creationTimestamp",
                "generation",
                "managedFields",
                "resourceVersion",
                "uid",
            ] {
                metadata.remove(field);
            }
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configmap(data: &str) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "mesh-config", "namespace": "mesh"},
            "data": {"mesh": data}
        }))
        .unwrap()
    }

    #[test]
    fn stamped_object_diffs_to_none_against_itself() {
        let mut desired = configmap("{}");
        stamp_last_applied(&mut desired).unwrap();
        // what the cluster would hand back, plus server-owned noise
        let mut live = desired.clone();
        live.metadata.resource_version = Some("42".to_string());
        live.metadata.uid = Some("abc".to_string());
        assert!(compute_patch(&live, &desired).unwrap().is_none());
    }

    #[test]
    fn changed_field_produces_a_patch() {
        let mut previous = configmap("{}");
        stamp_last_applied(&mut previous).unwrap();
        let mut desired = configmap("{\"mtls\":true}");
        stamp_last_applied(&mut desired).unwrap();
        let patch = compute_patch(&previous, &desired).unwrap();
        assert!(patch.is_some());
    }

    #[test]
    fn adopted_object_is_compared_after_stripping_server_fields() {
        // live object created by someone else: no last-applied annotation
        let mut live = configmap("{}");
        live.metadata.resource_version = Some("7".to_string());
        live.metadata.uid = Some("def".to_string());
        let mut desired = configmap("{}");
        stamp_last_applied(&mut desired).unwrap();
        // only difference left is the annotation we are about to add
        let patch = compute_patch(&live, &desired).unwrap();
        assert!(patch.is_some());
    }

    #[test]
    fn canonical_json_ignores_the_last_applied_annotation() {
        let plain = configmap("{}");
        let mut stamped = plain.clone();
        stamp_last_applied(&mut stamped).unwrap();
        assert_eq!(
            canonical_json(&plain).unwrap(),
            canonical_json(&stamped).unwrap()
        );
    }
}
