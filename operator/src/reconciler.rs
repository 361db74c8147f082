//! The component orchestrator: one reconciliation pass over a ControlPlane,
//! walking components in dependency order and folding their outcomes into a
//! fresh status that is written back at the end of the pass.

use crate::hooks::HookRegistry;
use common::{
    controlplane::{update_reconcile_status, ConditionType, ControlPlane, ControlPlaneStatus},
    k8sgeneric::ClusterApi,
    renderer::{Renderer, Renderings, ADDON_COMPONENT, CORE_COMPONENT},
    Error, Result, IGNORE_NAMESPACE_LABEL, MEMBER_OF_LABEL,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use std::collections::BTreeSet;
use tracing::{error, info};

/// Hard install-order dependencies: the certificate authority must exist
/// before the components consuming its certificates, webhooks come up after
/// the workloads they configure.
pub static ORDERED_COMPONENTS: &[&str] = &[
    "mesh",
    "mesh/charts/cert-authority",
    "mesh/charts/security",
    "mesh/charts/telemetry",
    "mesh/charts/policy",
    "mesh/charts/discovery",
    "mesh/charts/gateways",
    "mesh/charts/injection-webhook",
    "mesh/charts/dashboard",
];

pub struct ControlPlaneReconciler<'a> {
    pub(crate) instance: ControlPlane,
    /// Status of the previous pass, used for diffing; never mutated.
    pub(crate) prior: ControlPlaneStatus,
    /// Status being built by this pass; written back when it ends.
    pub(crate) status: ControlPlaneStatus,
    pub(crate) api: &'a dyn ClusterApi,
    pub(crate) renderer: &'a dyn Renderer,
    pub(crate) hooks: &'a HookRegistry,
    pub(crate) owner_ref: OwnerReference,
    pub(crate) generation: i64,
    pub(crate) renderings: Renderings,
}

impl<'a> ControlPlaneReconciler<'a> {
    pub fn new(
        instance: ControlPlane,
        api: &'a dyn ClusterApi,
        renderer: &'a dyn Renderer,
        hooks: &'a HookRegistry,
    ) -> ControlPlaneReconciler<'a> {
        let prior = instance.status.clone().unwrap_or_default();
        let owner_ref = OwnerReference {
            api_version: "stratum.io/v1".to_string(),
            kind: "ControlPlane".to_string(),
            name: instance.name_any(),
            uid: instance.uid().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        };
        let generation = instance.metadata.generation.unwrap_or(0);
        ControlPlaneReconciler {
            instance,
            prior,
            status: ControlPlaneStatus::default(),
            api,
            renderer,
            hooks,
            owner_ref,
            generation,
            renderings: Renderings::new(),
        }
    }

    pub(crate) fn namespace(&self) -> String {
        self.instance.namespace().unwrap_or_default()
    }

    /// Runs one full reconciliation pass. A `ComponentNotReady` error means
    /// the pass should be re-invoked after a short delay; any other error is
    /// a hard failure. The new status is persisted in every outcome.
    pub async fn run(&mut self) -> Result<()> {
        // prepare to write a new reconciliation status
        let mut top = self.prior.status.clone();
        top.remove_condition(ConditionType::Reconciled);
        self.status = ControlPlaneStatus {
            status: top,
            components: Vec::new(),
        };

        // nothing is safe to reconcile from a partial rendering
        self.renderings = match self.renderer.render(&self.instance) {
            Ok(renderings) => renderings,
            Err(e) => {
                error!("rendering failed: {e}");
                update_reconcile_status(&mut self.status.status, Some(&e));
                self.persist_status().await;
                return Err(e);
            }
        };

        if let Err(e) = self.ensure_namespace_labels().await {
            return self.fail(e).await;
        }

        let mut processed: BTreeSet<String> = BTreeSet::new();

        // fixed install order first
        for component in ORDERED_COMPONENTS {
            processed.insert((*component).to_string());
            if let Err(e) = self.process_component(component).await {
                return self.fail(e).await;
            }
        }

        // any remaining rendered components, in rendering-map order
        let prefix = format!("{CORE_COMPONENT}/");
        let remaining: Vec<String> = self
            .renderings
            .keys()
            .filter(|name| name.starts_with(&prefix) && !processed.contains(*name))
            .cloned()
            .collect();
        for component in remaining {
            processed.insert(component.clone());
            if let Err(e) = self.process_component(&component).await {
                return self.fail(e).await;
            }
        }

        // the add-on runs last, rendered or not, so its removal still prunes
        processed.insert(ADDON_COMPONENT.to_string());
        if let Err(e) = self.process_component(ADDON_COMPONENT).await {
            return self.fail(e).await;
        }

        // components tracked by an earlier pass that vanished entirely
        let stale: Vec<String> = self
            .prior
            .components
            .iter()
            .map(|c| c.name.clone())
            .filter(|name| !processed.contains(name))
            .collect();
        for component in stale {
            if let Err(e) = self.process_component(&component).await {
                return self.fail(e).await;
            }
        }

        self.status.status.observed_generation = self.generation;
        update_reconcile_status(&mut self.status.status, None);
        self.persist_status().await;
        info!("reconciliation complete");
        Ok(())
    }

    /// Tears down everything the control plane ever tracked, in reverse of
    /// the recorded component order. Used by the finalizer.
    pub async fn teardown(&mut self) -> Result<()> {
        let mut top = self.prior.status.clone();
        top.remove_condition(ConditionType::Reconciled);
        self.status = ControlPlaneStatus {
            status: top,
            components: Vec::new(),
        };
        self.renderings = Renderings::new();

        let mut errors = Vec::new();
        let components: Vec<String> = self
            .prior
            .components
            .iter()
            .rev()
            .map(|c| c.name.clone())
            .collect();
        for component in components {
            if let Err(e) = self.process_component(&component).await {
                errors.push(e);
            }
        }
        self.status.status.observed_generation = self.generation;
        let result = common::aggregate(errors);
        if let Err(e) = &result {
            update_reconcile_status(&mut self.status.status, Some(e));
        }
        self.persist_status().await;
        result
    }

    async fn fail(&mut self, err: Error) -> Result<()> {
        self.status.status.observed_generation = self.generation;
        // not-ready is a wait, not a failure: the cleared Reconciled
        // condition stays cleared until the component comes up
        if !err.is_not_ready() {
            update_reconcile_status(&mut self.status.status, Some(&err));
        }
        self.persist_status().await;
        Err(err)
    }

    // A persistence failure never replaces the outcome of the pass.
    async fn persist_status(&self) {
        let name = self.instance.name_any();
        if let Err(e) = self
            .api
            .update_status(&self.namespace(), &name, &self.status)
            .await
        {
            error!("error updating ControlPlane status: {e}");
        }
    }

    /// Idempotent upsert of the administrative labels on the control plane
    /// namespace. Any read or write failure aborts the pass.
    async fn ensure_namespace_labels(&self) -> Result<()> {
        let name = self.namespace();
        let mut namespace = self
            .api
            .get_namespace(&name)
            .await
            .map_err(|e| Error::NamespaceError(name.clone(), e.to_string()))?
            .ok_or_else(|| Error::NamespaceError(name.clone(), "not found".to_string()))?;
        let labels = namespace.metadata.labels.get_or_insert_with(Default::default);
        let mut update = false;
        if labels.get(IGNORE_NAMESPACE_LABEL).map(String::as_str) != Some("ignore") {
            info!("adding {IGNORE_NAMESPACE_LABEL}=ignore label to namespace {name}");
            labels.insert(IGNORE_NAMESPACE_LABEL.to_string(), "ignore".to_string());
            update = true;
        }
        if labels.get(MEMBER_OF_LABEL).map(String::as_str) != Some(name.as_str()) {
            info!("adding {MEMBER_OF_LABEL} label to namespace {name}");
            labels.insert(MEMBER_OF_LABEL.to_string(), name.clone());
            update = true;
        }
        if update {
            self.api
                .update_namespace(&namespace)
                .await
                .map_err(|e| Error::NamespaceError(name.clone(), e.to_string()))?;
        }
        Ok(())
    }
}
