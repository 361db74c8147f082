use crate::{controlplane::ControlPlane, Error, Result};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

/// Name of the component holding the core mesh resources. Its sub-charts are
/// rendered under `mesh/charts/<name>` keys.
pub static CORE_COMPONENT: &str = "mesh";
/// Name of the trailing add-on component, rendered only when enabled.
pub static ADDON_COMPONENT: &str = "metering";

/// A rendered manifest document. Only names ending in `.yaml` carry
/// resources; anything else (NOTES.txt and friends) is skipped downstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Manifest {
    pub name: String,
    pub content: String,
}

/// Component name to its ordered rendered manifests.
pub type Renderings = BTreeMap<String, Vec<Manifest>>;

/// Boundary to the template renderer. Rendering is a pure function of the
/// desired state; all failures are fatal for the pass since nothing can be
/// safely reconciled from a partial rendering.
pub trait Renderer: Send + Sync {
    fn render(&self, instance: &ControlPlane) -> Result<Renderings>;
}

/// Renderer returning a fixed set of manifests, for tests.
pub struct StaticRenderer {
    renderings: Renderings,
}

impl StaticRenderer {
    #[must_use]
    pub fn new(renderings: Renderings) -> StaticRenderer {
        StaticRenderer { renderings }
    }
}

impl Renderer for StaticRenderer {
    fn render(&self, _instance: &ControlPlane) -> Result<Renderings> {
        Ok(self.renderings.clone())
    }
}

/// Reads pre-rendered component manifests from a charts directory. Every
/// directory containing `.yaml` files becomes a component named by its path
/// relative to the root, e.g. `mesh/charts/cert-authority`. The metering
/// add-on tree is only picked up when its values enable it.
pub struct FileRenderer {
    root: PathBuf,
}

impl FileRenderer {
    #[must_use]
    pub fn new(root: PathBuf) -> FileRenderer {
        FileRenderer { root }
    }

    fn collect_tree(&self, component: &str, out: &mut Renderings, errors: &mut Vec<String>) {
        let dir = self.root.join(component);
        if !dir.is_dir() {
            errors.push(format!("chart directory {} is missing", dir.display()));
            return;
        }
        self.collect_dir(&dir, component, out, errors);
    }

    fn collect_dir(&self, dir: &Path, component: &str, out: &mut Renderings, errors: &mut Vec<String>) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                errors.push(format!("reading {}: {e}", dir.display()));
                return;
            }
        };
        let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
        paths.sort();
        for path in paths {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            if path.is_dir() {
                self.collect_dir(&path, &format!("{component}/{name}"), out, errors);
            } else if name.ends_with(".yaml") {
                match fs::read_to_string(&path) {
                    Ok(content) => out
                        .entry(component.to_string())
                        .or_default()
                        .push(Manifest { name, content }),
                    Err(e) => errors.push(format!("reading {}: {e}", path.display())),
                }
            }
        }
    }
}

impl Renderer for FileRenderer {
    fn render(&self, instance: &ControlPlane) -> Result<Renderings> {
        let mut out = Renderings::new();
        let mut errors = Vec::new();
        self.collect_tree(CORE_COMPONENT, &mut out, &mut errors);
        if is_enabled(instance.spec.metering.as_ref()) {
            self.collect_tree(ADDON_COMPONENT, &mut out, &mut errors);
        }
        if errors.is_empty() {
            Ok(out)
        } else {
            Err(Error::RenderError(errors.join("; ")))
        }
    }
}

/// A values block opts in only with an explicit `enabled: true`.
pub fn is_enabled(values: Option<&serde_json::Map<String, serde_json::Value>>) -> bool {
    values
        .and_then(|v| v.get("enabled"))
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}
