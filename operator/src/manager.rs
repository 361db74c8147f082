use crate::{controlplane, Metrics};
use chrono::{DateTime, Utc};
use common::controlplane::ControlPlane;
use futures::{future::BoxFuture, FutureExt, StreamExt};
use kube::{
    api::{Api, ListParams},
    client::Client,
    runtime::{controller::Controller, events::Reporter, watcher::Config},
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

// Context for our reconciler
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: Reporter {
                controller: "stratum-controller".into(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }
}

/// Data owned by the Manager
#[derive(Clone, Default)]
pub struct Manager {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus registry and families
    metrics: Metrics,
}

/// Manager that owns a Controller for ControlPlane
impl Manager {
    /// Lifecycle initialization interface for app
    ///
    /// This returns a `Manager` that drives a `Controller` + a future to be awaited
    /// It is up to `main` to wait for the controller stream.
    pub async fn new() -> (Self, BoxFuture<'static, ()>) {
        let client = Client::try_default().await.expect("create client");
        let manager = Manager::default();
        let context = Arc::new(Context {
            client: client.clone(),
            metrics: manager.metrics.clone(),
            diagnostics: manager.diagnostics.clone(),
        });

        let cps = Api::<ControlPlane>::all(client);
        // Ensure CRD is installed before loop-watching
        let _r = cps
            .list(&ListParams::default().limit(1))
            .await
            .expect("is the crd installed? please run: cargo run --bin crdgen | kubectl apply -f -");

        // All good. Start controller and return its future.
        let controller = Controller::new(cps, Config::default().any_semantic())
            .run(controlplane::reconcile, controlplane::error_policy, context)
            .filter_map(|x| async move { std::result::Result::ok(x) })
            .for_each(|_| futures::future::ready(()))
            .boxed();

        (manager, controller)
    }

    /// Metrics getter
    #[must_use]
    pub fn metrics(&self) -> String {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.metrics.registry)
            .unwrap_or_default();
        buffer
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }
}
