use crate::{resourcekey::ResourceKey, Error};
use kube::api::DynamicObject;

/// Splits a rendered manifest into its YAML documents on `---` separator
/// lines. Documents are parsed individually so one malformed document never
/// takes down its siblings.
pub fn split_documents(content: &str) -> Vec<String> {
    let mut documents = Vec::new();
    let mut current = String::new();
    for line in content.lines() {
        if line.trim_end() == "---" {
            documents.push(std::mem::take(&mut current));
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    documents.push(current);
    documents.retain(|d| !d.trim().is_empty());
    documents
}

/// Parses every document of a rendered manifest into individual untyped
/// objects, flattening List kinds. Parse failures are returned alongside the
/// objects that did parse; processing never stops at the first bad document.
pub fn parse_objects(content: &str) -> (Vec<DynamicObject>, Vec<Error>) {
    let mut objects = Vec::new();
    let mut errors = Vec::new();
    for document in split_documents(content) {
        match parse_document(&document) {
            Ok(parsed) => objects.extend(parsed),
            Err(e) => errors.push(e),
        }
    }
    (objects, errors)
}

fn parse_document(document: &str) -> Result<Vec<DynamicObject>, Error> {
    let yaml: serde_yaml::Value = serde_yaml::from_str(document)?;
    if yaml.is_null() {
        return Ok(Vec::new());
    }
    let value = serde_json::to_value(&yaml)?;
    value_to_objects(value)
}

fn value_to_objects(value: serde_json::Value) -> Result<Vec<DynamicObject>, Error> {
    let kind = value
        .get("kind")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default();
    if kind.ends_with("List") && value.get("items").is_some() {
        let items = value
            .get("items")
            .and_then(serde_json::Value::as_array)
            .cloned()
            .ok_or_else(|| Error::InvalidObject(format!("{kind} items is not a list")))?;
        let mut objects = Vec::new();
        for item in items {
            objects.extend(value_to_objects(item)?);
        }
        return Ok(objects);
    }
    let obj: DynamicObject = serde_json::from_value(value)?;
    // reject objects we could never look up again
    ResourceKey::from_object(&obj)?;
    Ok(vec![obj])
}

#[cfg(test)]
mod tests {
    use super::*;

    static TWO_DOCS: &str = r#"---
apiVersion: v1
kind: ConfigMap
metadata:
  name: mesh-config
  namespace: mesh
data:
  mesh: "{}"
---
apiVersion: v1
kind: Service
metadata:
  name: discovery
  namespace: mesh
spec:
  ports:
    - port: 15010
"#;

    #[test]
    fn splits_and_parses_every_document() {
        let (objects, errors) = parse_objects(TWO_DOCS);
        assert!(errors.is_empty());
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].types.as_ref().unwrap().kind, "ConfigMap");
        assert_eq!(objects[1].types.as_ref().unwrap().kind, "Service");
    }

    #[test]
    fn empty_documents_are_skipped() {
        let (objects, errors) = parse_objects("---\n\n---\n# nothing here\n");
        assert!(errors.is_empty());
        assert!(objects.is_empty());
    }

    #[test]
    fn one_bad_document_does_not_stop_the_rest() {
        let content = format!("{TWO_DOCS}---\n{{ invalid: [\n");
        let (objects, errors) = parse_objects(&content);
        assert_eq!(objects.len(), 2);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn objects_without_a_name_are_errors() {
        let content = "apiVersion: v1\nkind: ConfigMap\ndata: {}\n";
        let (objects, errors) = parse_objects(content);
        assert!(objects.is_empty());
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn list_kinds_are_flattened_recursively() {
        let content = r#"
apiVersion: v1
kind: List
items:
  - apiVersion: v1
    kind: ConfigMap
    metadata:
      name: one
      namespace: mesh
  - apiVersion: v1
    kind: List
    items:
      - apiVersion: v1
        kind: ConfigMap
        metadata:
          name: two
          namespace: mesh
"#;
        let (objects, errors) = parse_objects(content);
        assert!(errors.is_empty());
        let names: Vec<_> = objects
            .iter()
            .map(|o| o.metadata.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["one", "two"]);
    }
}
