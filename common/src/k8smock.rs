//! In-memory stand-in for the cluster API, used by the reconciliation tests.
//! Every call is recorded so tests can assert exactly which writes a pass
//! performed.

use crate::{
    controlplane::ControlPlaneStatus, k8sgeneric::ClusterApi, resourcekey::ResourceKey, Error,
    Result,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::DynamicObject;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Mutex,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Get(ResourceKey),
    Create(ResourceKey),
    Apply(ResourceKey),
    Delete(ResourceKey),
    NamespaceUpdate(String),
    StatusUpdate,
}

impl Op {
    pub fn is_write(&self) -> bool {
        matches!(self, Op::Create(_) | Op::Apply(_) | Op::Delete(_))
    }
}

#[derive(Default)]
pub struct MockCluster {
    objects: Mutex<BTreeMap<ResourceKey, DynamicObject>>,
    namespaces: Mutex<BTreeMap<String, Namespace>>,
    statuses: Mutex<Vec<ControlPlaneStatus>>,
    ops: Mutex<Vec<Op>>,
    fail_create: Mutex<BTreeSet<ResourceKey>>,
    fail_delete: Mutex<BTreeSet<ResourceKey>>,
    fail_status_update: Mutex<bool>,
}

impl MockCluster {
    #[must_use]
    pub fn new() -> MockCluster {
        MockCluster::default()
    }

    #[must_use]
    pub fn with_namespace(self, name: &str) -> MockCluster {
        let mut ns = Namespace::default();
        ns.metadata.name = Some(name.to_string());
        self.namespaces
            .lock()
            .unwrap()
            .insert(name.to_string(), ns);
        self
    }

    /// Seeds or overwrites an object without recording an operation.
    pub fn put(&self, obj: DynamicObject) {
        let key = ResourceKey::from_object(&obj).expect("seeded object must carry identity");
        self.objects.lock().unwrap().insert(key, obj);
    }

    /// Sets the `status` section of a stored object, as the cluster would
    /// after the workload came up.
    pub fn set_status_field(&self, key: &ResourceKey, status: serde_json::Value) {
        let mut objects = self.objects.lock().unwrap();
        let obj = objects.get_mut(key).expect("object must exist");
        obj.data["status"] = status;
    }

    pub fn fail_create(&self, key: ResourceKey) {
        self.fail_create.lock().unwrap().insert(key);
    }

    pub fn fail_delete(&self, key: ResourceKey) {
        self.fail_delete.lock().unwrap().insert(key);
    }

    pub fn fail_status_update(&self) {
        *self.fail_status_update.lock().unwrap() = true;
    }

    pub fn object(&self, key: &ResourceKey) -> Option<DynamicObject> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn namespace(&self, name: &str) -> Option<Namespace> {
        self.namespaces.lock().unwrap().get(name).cloned()
    }

    pub fn last_status(&self) -> Option<ControlPlaneStatus> {
        self.statuses.lock().unwrap().last().cloned()
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    /// Drains the recorded operations, so a test can scope assertions to one
    /// pass.
    pub fn take_ops(&self) -> Vec<Op> {
        std::mem::take(&mut *self.ops.lock().unwrap())
    }

    pub fn writes(&self) -> Vec<Op> {
        self.ops().into_iter().filter(Op::is_write).collect()
    }

    fn record(&self, op: Op) {
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn get(&self, key: &ResourceKey) -> Result<Option<DynamicObject>> {
        self.record(Op::Get(key.clone()));
        Ok(self.objects.lock().unwrap().get(key).cloned())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ResourceKey::from_object(obj)?;
        self.record(Op::Create(key.clone()));
        if self.fail_create.lock().unwrap().contains(&key) {
            return Err(Error::Other(format!("create of {key} refused")));
        }
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&key) {
            return Err(Error::Other(format!("{key} already exists")));
        }
        objects.insert(key, obj.clone());
        Ok(obj.clone())
    }

    async fn apply(&self, key: &ResourceKey, desired: &DynamicObject) -> Result<DynamicObject> {
        self.record(Op::Apply(key.clone()));
        self.objects
            .lock()
            .unwrap()
            .insert(key.clone(), desired.clone());
        Ok(desired.clone())
    }

    async fn delete(&self, key: &ResourceKey) -> Result<bool> {
        self.record(Op::Delete(key.clone()));
        if self.fail_delete.lock().unwrap().contains(key) {
            return Err(Error::Other(format!("delete of {key} refused")));
        }
        Ok(self.objects.lock().unwrap().remove(key).is_some())
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        Ok(self.namespaces.lock().unwrap().get(name).cloned())
    }

    async fn update_namespace(&self, ns: &Namespace) -> Result<Namespace> {
        let name = ns.metadata.name.clone().unwrap_or_default();
        self.record(Op::NamespaceUpdate(name.clone()));
        self.namespaces.lock().unwrap().insert(name, ns.clone());
        Ok(ns.clone())
    }

    async fn update_status(
        &self,
        _namespace: &str,
        _name: &str,
        status: &ControlPlaneStatus,
    ) -> Result<()> {
        self.record(Op::StatusUpdate);
        if *self.fail_status_update.lock().unwrap() {
            return Err(Error::Other("status update refused".into()));
        }
        self.statuses.lock().unwrap().push(status.clone());
        Ok(())
    }
}
