//! Manifest processing for one component: parse the rendered documents,
//! reconcile every object against live state, and prune whatever the
//! previous pass tracked that is no longer rendered. Errors are aggregated
//! per component; every processable object is attempted.

use crate::reconciler::ControlPlaneReconciler;
use common::{
    controlplane::{
        update_delete_status, update_reconcile_status, ComponentStatus, ConditionStatus,
        ConditionType, ResourceStatus,
    },
    k8sgeneric::{compute_patch, set_annotation, set_label, stamp_last_applied},
    renderer::Manifest,
    resourcekey::ResourceKey,
    yamlhandler, Error, Result, GENERATION_ANNOTATION, OWNER_LABEL,
};
use kube::api::DynamicObject;
use std::collections::BTreeSet;
use tracing::{debug, error, info, warn};

impl ControlPlaneReconciler<'_> {
    /// Reconciles one component. With no renderings and no tracked
    /// resources this is a no-op; with no renderings but tracked resources
    /// the deletion branch still runs, so a fully removed component is torn
    /// down rather than skipped.
    pub(crate) async fn process_component(&mut self, component: &str) -> Result<()> {
        let renderings = self.renderings.get(component).cloned().unwrap_or_default();
        let prior = self.prior.find_component(component).cloned();
        if renderings.is_empty() && prior.as_ref().map_or(true, |p| p.resources.is_empty()) {
            debug!(component, "no renderings for component");
            return Ok(());
        }

        info!(component, "reconciling component resources");
        let mut prior = prior.unwrap_or_else(|| ComponentStatus::new(component));
        prior.status.remove_condition(ConditionType::Reconciled);

        let (mut next, result) = self.process_manifests(&renderings, &prior).await;
        next.status.observed_generation = self.generation;

        if !renderings.is_empty() && result.is_ok() {
            if let Err(e) = self.hooks.post_install(self.api, component, &next).await {
                if e.is_not_ready() {
                    info!(component, "component is not ready yet: {e}");
                } else {
                    error!(component, "component post-processing failed: {e}");
                }
                return Err(e);
            }
        }

        if !next.resources.is_empty() || !renderings.is_empty() {
            self.status.components.push(next);
        }
        info!(component, "component reconciliation complete");
        result
    }

    async fn process_manifests(
        &mut self,
        renderings: &[Manifest],
        prior: &ComponentStatus,
    ) -> (ComponentStatus, Result<()>) {
        let mut errors: Vec<Error> = Vec::new();
        let mut seen: BTreeSet<ResourceKey> = BTreeSet::new();
        let mut next = ComponentStatus {
            name: prior.name.clone(),
            status: prior.status.clone(),
            resources: Vec::new(),
        };

        for manifest in renderings {
            if !manifest.name.ends_with(".yaml") {
                debug!(manifest = %manifest.name, "skipping rendering");
                continue;
            }
            debug!(manifest = %manifest.name, "processing resources from manifest");
            let (objects, parse_errors) = yamlhandler::parse_objects(&manifest.content);
            for e in parse_errors {
                error!(manifest = %manifest.name, "unable to parse object: {e}");
                errors.push(e);
            }
            for mut obj in objects {
                if let Err(e) = self.process_object(&mut obj, &mut seen, prior, &mut next).await {
                    errors.push(e);
                }
            }
        }

        self.prune_removed(&seen, prior, &mut next, &mut errors).await;

        let result = common::aggregate(errors);
        if !renderings.is_empty() {
            update_reconcile_status(&mut next.status, result.as_ref().err());
        } else {
            // absence of renderings means the component is being torn down
            update_delete_status(&mut next.status, result.as_ref().err());
        }
        (next, result)
    }

    async fn process_object(
        &self,
        obj: &mut DynamicObject,
        seen: &mut BTreeSet<ResourceKey>,
        prior: &ComponentStatus,
        next: &mut ComponentStatus,
    ) -> Result<()> {
        let key = ResourceKey::from_object(obj)?;
        let namespace = self.namespace();

        // cross-namespace and cluster-scoped objects cannot carry an owner
        // reference; the generation annotation is their only prune signal
        if obj.metadata.namespace.as_deref() == Some(namespace.as_str()) {
            obj.metadata.owner_references = Some(vec![self.owner_ref.clone()]);
        }
        set_label(obj, OWNER_LABEL, &namespace);
        set_annotation(obj, GENERATION_ANNOTATION, &self.generation.to_string());

        debug!(resource = %key, "beginning reconciliation of resource");
        seen.insert(key.clone());
        let resource = key.to_string();
        let mut status = prior
            .find_resource(&resource)
            .cloned()
            .unwrap_or_else(|| ResourceStatus::new(resource));

        if let Err(e) = self.hooks.object.pre_process(self.api, obj).await {
            error!(resource = %key, "error preprocessing object: {e}");
            update_reconcile_status(&mut status.status, Some(&e));
            next.push_resource(status);
            return Err(e);
        }

        if let Err(e) = stamp_last_applied(obj) {
            update_reconcile_status(&mut status.status, Some(&e));
            next.push_resource(status);
            return Err(e);
        }

        let mut changed = true;
        let result: Result<()> = match self.api.get(&key).await {
            Ok(None) => {
                info!(resource = %key, "creating resource");
                match self.api.create(obj).await {
                    Ok(_) => {
                        status.status.observed_generation = 1;
                        if let Err(e) = self.hooks.object.on_created(self.api, obj).await {
                            error!(resource = %key, "unexpected error occurred during postprocessing of new resource: {e}");
                        }
                        Ok(())
                    }
                    Err(e) => {
                        error!(resource = %key, "unexpected error occurred during creation of new resource: {e}");
                        Err(e)
                    }
                }
            }
            Ok(Some(live)) => match compute_patch(&live, obj) {
                Ok(Some(_patch)) => {
                    info!(resource = %key, "updating existing resource");
                    status.status.remove_condition(ConditionType::Reconciled);
                    self.api.apply(&key, obj).await.map(|_| ())
                }
                // a no-op diff produces no status churn
                Ok(None) => {
                    changed = false;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        if changed || result.is_err() {
            update_reconcile_status(&mut status.status, result.as_ref().err());
        }
        if let Err(e) = &result {
            error!(resource = %key, "error occurred reconciling resource: {e}");
        }
        next.push_resource(status);
        result
    }

    /// Deletes resources tracked by the previous pass but not rendered in
    /// this one, walking them last-declared-first. Successful deletions are
    /// dropped from the new status; failed ones are carried so the next pass
    /// retries them.
    async fn prune_removed(
        &self,
        seen: &BTreeSet<ResourceKey>,
        prior: &ComponentStatus,
        next: &mut ComponentStatus,
        errors: &mut Vec<Error>,
    ) {
        for status in prior.resources.iter().rev() {
            let key: ResourceKey = match status.resource.parse() {
                Ok(key) => key,
                Err(e) => {
                    warn!(resource = %status.resource, "dropping untracked status entry: {e}");
                    continue;
                }
            };
            if seen.contains(&key) {
                continue;
            }
            // explicitly-False Installed means it was never created or is
            // already deleted
            if status.status.get_condition(ConditionType::Installed).status
                == ConditionStatus::False
            {
                continue;
            }
            info!(resource = %key, "deleting resource");
            match self.api.delete(&key).await {
                Ok(_) => {
                    if let Err(e) = self.hooks.object.on_deleted(self.api, &key.to_stub()).await {
                        error!(resource = %key, "unexpected error occurred during cleanup of deleted resource: {e}");
                    }
                }
                Err(e) => {
                    error!(resource = %key, "error deleting resource: {e}");
                    let mut status = status.clone();
                    update_delete_status(&mut status.status, Some(&e));
                    next.push_resource(status);
                    errors.push(e);
                }
            }
        }
    }
}
