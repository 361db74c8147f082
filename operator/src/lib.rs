use async_trait::async_trait;
use kube::runtime::controller::Action;
use manager::Context;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("Reconcile Error: {0}")]
    ReconcileError(#[source] common::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    #[must_use]
    pub fn metric_label(&self) -> String {
        format!("{self:?}")
            .split(['(', ' ', '{'])
            .next()
            .unwrap_or("other")
            .to_lowercase()
    }
}

#[async_trait]
pub trait Reconciler {
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action>;
    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action>;
}

pub static CONTROLPLANE_FINALIZER: &str = "controlplanes.stratum.io";

pub mod controlplane;
pub mod events;
pub mod hooks;
pub mod manifests;
pub mod reconciler;

/// State machinery for kube, as exposeable to actix
pub mod manager;
pub use manager::Manager;

/// Generated type, for crdgen
pub use common::controlplane::ControlPlane;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;
