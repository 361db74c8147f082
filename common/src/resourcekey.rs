use crate::{Error, Result};
use kube::{api::DynamicObject, core::TypeMeta};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Canonical identity of an orchestration-API object. Two keys are equal iff
/// all four fields match; keys are the unit of diffing between passes.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceKey {
    pub api_version: String,
    pub kind: String,
    /// None for cluster-scoped objects
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    pub fn new(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> Self {
        ResourceKey {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn from_object(obj: &DynamicObject) -> Result<Self> {
        let types = obj
            .types
            .clone()
            .ok_or_else(|| Error::InvalidObject("object carries no apiVersion/kind".into()))?;
        if types.kind.is_empty() {
            return Err(Error::InvalidObject("object carries an empty kind".into()));
        }
        let name = obj
            .metadata
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                Error::InvalidObject(format!("{} object carries no name", types.kind))
            })?;
        Ok(ResourceKey {
            api_version: types.api_version,
            kind: types.kind,
            namespace: obj.metadata.namespace.clone(),
            name,
        })
    }

    /// Minimal object carrying only identity, for API lookups and deletes.
    pub fn to_stub(&self) -> DynamicObject {
        let mut obj = DynamicObject {
            types: Some(TypeMeta {
                api_version: self.api_version.clone(),
                kind: self.kind.clone(),
            }),
            metadata: Default::default(),
            data: serde_json::Value::Null,
        };
        obj.metadata.name = Some(self.name.clone());
        obj.metadata.namespace = self.namespace.clone();
        obj
    }
}

// Rendered as "apiVersion/kind/namespace/name" with an empty namespace
// segment for cluster-scoped objects. kind, namespace and name never contain
// a slash, so parsing splits from the right and whatever remains is the
// apiVersion (which may itself contain one).
impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.api_version,
            self.kind,
            self.namespace.as_deref().unwrap_or(""),
            self.name
        )
    }
}

impl FromStr for ResourceKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.rsplitn(4, '/');
        let name = parts.next().unwrap_or("");
        let namespace = parts.next();
        let kind = parts.next();
        let api_version = parts.next();
        match (api_version, kind, namespace) {
            (Some(api_version), Some(kind), Some(namespace))
                if !name.is_empty() && !kind.is_empty() && !api_version.is_empty() =>
            {
                Ok(ResourceKey {
                    api_version: api_version.to_string(),
                    kind: kind.to_string(),
                    namespace: if namespace.is_empty() {
                        None
                    } else {
                        Some(namespace.to_string())
                    },
                    name: name.to_string(),
                })
            }
            _ => Err(Error::InvalidObject(format!("malformed resource key {s:?}"))),
        }
    }
}
