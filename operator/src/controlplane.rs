use crate::{
    events, hooks::HookRegistry, manager::Context, reconciler::ControlPlaneReconciler, telemetry,
    Error, Reconciler, Result, CONTROLPLANE_FINALIZER,
};
use async_trait::async_trait;
use chrono::Utc;
use common::{
    k8sgeneric::K8sCluster,
    renderer::{FileRenderer, StaticRenderer},
};
use kube::{
    api::{Api, ResourceExt},
    runtime::{
        controller::Action,
        events::Recorder,
        finalizer::{finalizer, Event as Finalizer},
    },
    Resource,
};
use std::{path::PathBuf, sync::Arc};
use tokio::time::Duration;
use tracing::{field, info, instrument, warn, Span};

pub use common::controlplane::{ControlPlane, ControlPlaneStatus};

/// Directory holding the rendered component charts.
pub static CHART_PATH_ENV: &str = "CHART_PATH";
static DEFAULT_CHART_PATH: &str = "/var/lib/stratum/charts";

#[instrument(skip(ctx, cp), fields(trace_id))]
pub async fn reconcile(cp: Arc<ControlPlane>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _mes = ctx.metrics.control_plane.count_and_measure(&trace_id);
    let ns = cp.namespace().unwrap(); // cp is namespace scoped
    let cps: Api<ControlPlane> = Api::namespaced(ctx.client.clone(), &ns);

    info!("Reconciling ControlPlane \"{}\" in {}", cp.name_any(), ns);
    finalizer(&cps, CONTROLPLANE_FINALIZER, cp, |event| async {
        match event {
            Finalizer::Apply(cp) => cp.reconcile(ctx.clone()).await,
            Finalizer::Cleanup(cp) => cp.cleanup(ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

pub fn error_policy(cp: Arc<ControlPlane>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.control_plane.reconcile_failure(&cp, error);
    Action::requeue(Duration::from_secs(5 * 60))
}

fn chart_path() -> PathBuf {
    PathBuf::from(
        std::env::var(CHART_PATH_ENV).unwrap_or_else(|_| DEFAULT_CHART_PATH.to_string()),
    )
}

#[async_trait]
impl Reconciler for ControlPlane {
    // Reconcile (for non-finalizer related changes)
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        ctx.diagnostics.write().await.last_event = Utc::now();
        let reporter = ctx.diagnostics.read().await.reporter.clone();
        let recorder = Recorder::new(ctx.client.clone(), reporter, self.object_ref(&()));
        let api = K8sCluster::new(ctx.client.clone());
        let renderer = FileRenderer::new(chart_path());
        let hooks = HookRegistry::standard();
        let mut pass = ControlPlaneReconciler::new(self.clone(), &api, &renderer, &hooks);
        match pass.run().await {
            Ok(()) => {
                recorder
                    .publish(events::install_succeeded())
                    .await
                    .map_err(Error::KubeError)?;
                // If no events were received, check back every 15 minutes
                Ok(Action::requeue(Duration::from_secs(15 * 60)))
            }
            Err(e) if e.is_not_ready() => {
                info!("{e}, checking back shortly");
                Ok(Action::requeue(Duration::from_secs(5)))
            }
            Err(e) => {
                let mut note = e.to_string();
                note.truncate(1023);
                recorder
                    .publish(events::install_failed(note))
                    .await
                    .map_err(Error::KubeError)?;
                Err(Error::ReconcileError(e))
            }
        }
    }

    // Reconcile with finalize cleanup (the object was deleted)
    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        ctx.diagnostics.write().await.last_event = Utc::now();
        let reporter = ctx.diagnostics.read().await.reporter.clone();
        let recorder = Recorder::new(ctx.client.clone(), reporter, self.object_ref(&()));
        let api = K8sCluster::new(ctx.client.clone());
        let renderer = StaticRenderer::new(Default::default());
        let hooks = HookRegistry::standard();
        let mut pass = ControlPlaneReconciler::new(self.clone(), &api, &renderer, &hooks);
        info!("Uninstalling ControlPlane \"{}\"", self.name_any());
        match pass.teardown().await {
            Ok(()) => {
                recorder
                    .publish(events::uninstall_succeeded())
                    .await
                    .map_err(Error::KubeError)?;
                Ok(Action::await_change())
            }
            Err(e) => Err(Error::ReconcileError(e)),
        }
    }
}
