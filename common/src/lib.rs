use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YamlError: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("K8s error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Rendering failed: {0}")]
    RenderError(String),

    #[error("Namespace {0}: {1}")]
    NamespaceError(String, String),

    #[error("Invalid manifest object: {0}")]
    InvalidObject(String),

    #[error("{kind} {name} not found")]
    UnknownResource { kind: String, name: String },

    #[error("component {component} not ready: {reason}")]
    ComponentNotReady { component: String, reason: String },

    #[error("{}", join_aggregate(.0))]
    Aggregate(Vec<Error>),

    #[error("Error: {0}")]
    Other(String),
}

impl Error {
    pub fn metric_label(&self) -> String {
        format!("{self:?}")
            .split(['(', ' ', '{'])
            .next()
            .unwrap_or("other")
            .to_lowercase()
    }

    /// True for the distinguished retryable "not ready" condition.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Error::ComponentNotReady { .. })
    }
}

fn join_aggregate(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Folds a list of recorded errors into a single outcome: no error for an
/// empty list, the error itself for one, an aggregate otherwise.
pub fn aggregate(errors: Vec<Error>) -> Result<()> {
    let mut errors = errors;
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(Error::Aggregate(errors)),
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Label placed on every managed object, valued with the control plane
/// namespace. Part of the prune contract.
pub static OWNER_LABEL: &str = "stratum.io/owner";
/// Annotation carrying the generation of the ControlPlane that last wrote an
/// object. Cross-namespace resources are pruned by this alone.
pub static GENERATION_ANNOTATION: &str = "stratum.io/generation";
/// Annotation holding the canonical JSON of the last applied configuration,
/// used for no-op detection between passes.
pub static LAST_APPLIED_ANNOTATION: &str = "stratum.io/last-applied";
/// Namespace label keeping sidecar injection away from the control plane.
pub static IGNORE_NAMESPACE_LABEL: &str = "stratum.io/ignore-namespace";
/// Namespace membership label, required for mesh networking.
pub static MEMBER_OF_LABEL: &str = "stratum.io/member-of";

pub mod controlplane;
pub mod k8sgeneric;
pub mod k8smock;
pub mod renderer;
pub mod resourcekey;
pub mod yamlhandler;
