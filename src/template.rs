//! Workflow template builder.
//!
//! A [`PromptTemplate`] wraps a deep copy of an API-format workflow
//! (node id → `{class_type, inputs}`) together with named bindings:
//! input names map to dotted paths inside the workflow, output names
//! map to node ids whose results the caller wants back. Writing an
//! input value rewrites every bound path; path segments that collide
//! with prototype-like object keys are refused outright.
//!
//! All operations are copy-on-write: they return a new template and a
//! failed operation leaves the original untouched.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};

use crate::api::OsType;

/// Path segments that must never be traversed or created.
const RESERVED_SEGMENTS: [&str; 3] = ["__proto__", "prototype", "constructor"];

/// Errors raised by template operations.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    /// The name was not declared when the template was constructed.
    #[error("Unknown input or output name: {0:?}")]
    UnknownInput(String),

    /// The path is empty or contains a reserved segment.
    #[error("Invalid workflow path: {0:?}")]
    InvalidPath(String),
}

/// A workflow template with named input paths and output nodes.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    workflow: Value,
    inputs: HashMap<String, Vec<String>>,
    outputs: HashMap<String, Option<String>>,
    bypassed: HashSet<String>,
}

impl PromptTemplate {
    /// Create a template over a deep copy of `workflow`.
    ///
    /// Every input and output name starts with an empty binding; bind
    /// them with [`set_input_node`](Self::set_input_node) and
    /// [`set_output_node`](Self::set_output_node).
    pub fn new<I, O>(workflow: &Value, input_names: I, output_names: O) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
    {
        Self {
            workflow: workflow.clone(),
            inputs: input_names
                .into_iter()
                .map(|n| (n.into(), Vec::new()))
                .collect(),
            outputs: output_names
                .into_iter()
                .map(|n| (n.into(), None))
                .collect(),
            bypassed: HashSet::new(),
        }
    }

    /// Bind `name` to a single dotted path, replacing any previous
    /// binding.
    pub fn set_input_node(
        &self,
        name: &str,
        path: impl Into<String>,
    ) -> Result<Self, TemplateError> {
        self.replace_paths(name, vec![path.into()])
    }

    /// Bind `name` to several dotted paths at once, replacing any
    /// previous binding.
    pub fn set_input_paths(&self, name: &str, paths: &[&str]) -> Result<Self, TemplateError> {
        self.replace_paths(name, paths.iter().map(|p| p.to_string()).collect())
    }

    /// Add one more path to an existing binding.
    pub fn append_input_node(
        &self,
        name: &str,
        path: impl Into<String>,
    ) -> Result<Self, TemplateError> {
        let path = path.into();
        validate_path(&path)?;
        if !self.inputs.contains_key(name) {
            return Err(TemplateError::UnknownInput(name.to_string()));
        }

        let mut next = self.clone();
        next.inputs.get_mut(name).expect("checked above").push(path);
        Ok(next)
    }

    /// Declare which node's output is reported under `name`.
    pub fn set_output_node(
        &self,
        name: &str,
        node_id: impl Into<String>,
    ) -> Result<Self, TemplateError> {
        if !self.outputs.contains_key(name) {
            return Err(TemplateError::UnknownInput(name.to_string()));
        }

        let mut next = self.clone();
        next.outputs.insert(name.to_string(), Some(node_id.into()));
        Ok(next)
    }

    /// Mark a node to be skipped at submission.
    pub fn bypass(&self, node_id: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.bypassed.insert(node_id.into());
        next
    }

    /// Undo a previous [`bypass`](Self::bypass).
    pub fn reinstate(&self, node_id: &str) -> Self {
        let mut next = self.clone();
        next.bypassed.remove(node_id);
        next
    }

    /// Write `value` at every path bound to `name`.
    ///
    /// Missing intermediate objects are created; existing non-object
    /// intermediates are replaced.
    pub fn input(&self, name: &str, value: impl Into<Value>) -> Result<Self, TemplateError> {
        let paths = self
            .inputs
            .get(name)
            .ok_or_else(|| TemplateError::UnknownInput(name.to_string()))?
            .clone();
        for path in &paths {
            validate_path(path)?;
        }

        let value = value.into();
        let mut next = self.clone();
        for path in &paths {
            write_path(&mut next.workflow, path, value.clone());
        }
        Ok(next)
    }

    /// Write a filesystem path value, rewriting separators for the
    /// backend's OS.
    ///
    /// `Nt` turns forward slashes into backslashes, `Posix` does the
    /// reverse, `Unknown` writes the value untouched.
    pub fn input_path(&self, name: &str, value: &str, os: OsType) -> Result<Self, TemplateError> {
        let encoded = match os {
            OsType::Nt => value.replace('/', "\\"),
            OsType::Posix => value.replace('\\', "/"),
            OsType::Unknown => value.to_string(),
        };
        self.input(name, encoded)
    }

    /// The current workflow tree (inputs applied, bypass not yet).
    pub fn workflow(&self) -> &Value {
        &self.workflow
    }

    /// Paths currently bound to `name`.
    pub fn input_paths(&self, name: &str) -> Option<&[String]> {
        self.inputs.get(name).map(Vec::as_slice)
    }

    /// Declared output bindings that have a node assigned.
    pub fn output_nodes(&self) -> HashMap<String, String> {
        self.outputs
            .iter()
            .filter_map(|(name, node)| node.as_ref().map(|n| (name.clone(), n.clone())))
            .collect()
    }

    /// Node ids currently bypassed.
    pub fn bypassed(&self) -> &HashSet<String> {
        &self.bypassed
    }

    /// Produce the submission blob: a copy of the workflow with
    /// bypassed nodes pruned and references into them rewired to the
    /// pruned node's own first reference input, when one exists.
    pub fn finalize(&self) -> Value {
        let mut workflow = self.workflow.clone();
        if self.bypassed.is_empty() {
            return workflow;
        }

        let Some(nodes) = workflow.as_object_mut() else {
            return workflow;
        };

        // Resolve each bypassed node to the upstream reference it
        // passes through, following chains of bypassed nodes.
        let mut passthrough: HashMap<String, Option<Value>> = HashMap::new();
        for id in &self.bypassed {
            let resolved = resolve_passthrough(nodes, id, &self.bypassed, &mut HashSet::new());
            passthrough.insert(id.clone(), resolved);
        }

        for id in &self.bypassed {
            nodes.remove(id);
        }

        for node in nodes.values_mut() {
            let Some(inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) else {
                continue;
            };
            for input in inputs.values_mut() {
                let Some(target) = reference_target(input) else {
                    continue;
                };
                if let Some(Some(replacement)) = passthrough.get(&target) {
                    *input = replacement.clone();
                }
            }
        }

        workflow
    }

    fn replace_paths(&self, name: &str, paths: Vec<String>) -> Result<Self, TemplateError> {
        for path in &paths {
            validate_path(path)?;
        }
        if !self.inputs.contains_key(name) {
            return Err(TemplateError::UnknownInput(name.to_string()));
        }

        let mut next = self.clone();
        next.inputs.insert(name.to_string(), paths);
        Ok(next)
    }
}

/// Reject empty paths, empty segments, and reserved segments.
fn validate_path(path: &str) -> Result<(), TemplateError> {
    if path.is_empty() {
        return Err(TemplateError::InvalidPath(path.to_string()));
    }
    for segment in path.split('.') {
        if segment.is_empty() || RESERVED_SEGMENTS.contains(&segment) {
            return Err(TemplateError::InvalidPath(path.to_string()));
        }
    }
    Ok(())
}

/// Write `value` at a dotted path, creating intermediate objects.
fn write_path(root: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = root;

    for segment in &segments[..segments.len() - 1] {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current = current
            .as_object_mut()
            .expect("made an object above")
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    current
        .as_object_mut()
        .expect("made an object above")
        .insert(segments[segments.len() - 1].to_string(), value);
}

/// Is this input value a `[node_id, slot]` reference? Returns the
/// upstream node id if so.
fn reference_target(input: &Value) -> Option<String> {
    let arr = input.as_array()?;
    if arr.len() != 2 {
        return None;
    }
    let id = arr[0].as_str()?;
    arr[1].as_i64()?;
    Some(id.to_string())
}

/// The reference a bypassed node forwards: its first reference-valued
/// input, chased through further bypassed nodes.
fn resolve_passthrough(
    nodes: &Map<String, Value>,
    id: &str,
    bypassed: &HashSet<String>,
    visiting: &mut HashSet<String>,
) -> Option<Value> {
    if !visiting.insert(id.to_string()) {
        // Reference cycle through bypassed nodes.
        return None;
    }

    let inputs = nodes.get(id)?.get("inputs")?.as_object()?;
    let first_ref = inputs.values().find_map(|v| {
        reference_target(v).map(|target| (target, v.clone()))
    })?;

    let (target, reference) = first_ref;
    if bypassed.contains(&target) {
        resolve_passthrough(nodes, &target, bypassed, visiting)
    } else {
        Some(reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_workflow() -> Value {
        json!({
            "3": {
                "class_type": "KSampler",
                "inputs": { "seed": 0, "model": ["4", 0], "latent_image": ["5", 0] }
            },
            "4": {
                "class_type": "CheckpointLoaderSimple",
                "inputs": { "ckpt_name": "default.safetensors" }
            },
            "5": {
                "class_type": "EmptyLatentImage",
                "inputs": { "width": 512, "height": 512 }
            },
            "9": {
                "class_type": "SaveImage",
                "inputs": { "images": ["3", 0] }
            }
        })
    }

    #[test]
    fn constructor_deep_copies_the_workflow() {
        let original = sample_workflow();
        let template = PromptTemplate::new(&original, ["seed"], ["images"])
            .set_input_node("seed", "3.inputs.seed")
            .unwrap()
            .input("seed", 42)
            .unwrap();

        // The caller's workflow is untouched.
        assert_eq!(original["3"]["inputs"]["seed"], 0);
        assert_eq!(template.workflow()["3"]["inputs"]["seed"], 42);
    }

    #[test]
    fn input_writes_every_bound_path() {
        let template = PromptTemplate::new(&sample_workflow(), ["size"], [] as [&str; 0])
            .set_input_paths("size", &["5.inputs.width", "5.inputs.height"])
            .unwrap()
            .input("size", 768)
            .unwrap();

        assert_eq!(template.workflow()["5"]["inputs"]["width"], 768);
        assert_eq!(template.workflow()["5"]["inputs"]["height"], 768);
    }

    #[test]
    fn append_input_node_concatenates() {
        let template = PromptTemplate::new(&sample_workflow(), ["seed"], [] as [&str; 0])
            .set_input_node("seed", "3.inputs.seed")
            .unwrap()
            .append_input_node("seed", "5.inputs.width")
            .unwrap();

        assert_eq!(
            template.input_paths("seed").unwrap(),
            ["3.inputs.seed", "5.inputs.width"]
        );
    }

    #[test]
    fn input_creates_missing_intermediates() {
        let template = PromptTemplate::new(&json!({}), ["extra"], [] as [&str; 0])
            .set_input_node("extra", "10.inputs.text")
            .unwrap()
            .input("extra", "hello")
            .unwrap();

        assert_eq!(template.workflow()["10"]["inputs"]["text"], "hello");
    }

    #[test]
    fn unknown_input_name_rejected() {
        let template = PromptTemplate::new(&sample_workflow(), ["seed"], [] as [&str; 0]);
        assert!(matches!(
            template.input("steps", 20),
            Err(TemplateError::UnknownInput(_))
        ));
    }

    #[test]
    fn prototype_like_segments_rejected() {
        let template = PromptTemplate::new(&sample_workflow(), ["seed"], [] as [&str; 0]);
        for path in [
            "__proto__.inputs.seed",
            "3.constructor.seed",
            "3.inputs.prototype",
        ] {
            assert!(
                matches!(
                    template.set_input_node("seed", path),
                    Err(TemplateError::InvalidPath(_))
                ),
                "path {path:?} should be refused"
            );
        }
        // The template is unchanged after the failures.
        assert!(template.input_paths("seed").unwrap().is_empty());
    }

    #[test]
    fn empty_path_segment_rejected() {
        let template = PromptTemplate::new(&sample_workflow(), ["seed"], [] as [&str; 0]);
        assert!(template.set_input_node("seed", "3..seed").is_err());
        assert!(template.set_input_node("seed", "").is_err());
    }

    #[test]
    fn nt_encoding_rewrites_forward_slashes() {
        let template = PromptTemplate::new(&sample_workflow(), ["checkpoint"], [] as [&str; 0])
            .set_input_node("checkpoint", "4.inputs.ckpt_name")
            .unwrap()
            .input_path("checkpoint", "models/sd/v1.safetensors", OsType::Nt)
            .unwrap();

        assert_eq!(
            template.workflow()["4"]["inputs"]["ckpt_name"],
            "models\\sd\\v1.safetensors"
        );
    }

    #[test]
    fn posix_encoding_rewrites_backslashes() {
        let template = PromptTemplate::new(&sample_workflow(), ["checkpoint"], [] as [&str; 0])
            .set_input_node("checkpoint", "4.inputs.ckpt_name")
            .unwrap()
            .input_path("checkpoint", "models\\sd\\v1.safetensors", OsType::Posix)
            .unwrap();

        assert_eq!(
            template.workflow()["4"]["inputs"]["ckpt_name"],
            "models/sd/v1.safetensors"
        );
    }

    #[test]
    fn unknown_os_leaves_value_untouched() {
        let template = PromptTemplate::new(&sample_workflow(), ["checkpoint"], [] as [&str; 0])
            .set_input_node("checkpoint", "4.inputs.ckpt_name")
            .unwrap()
            .input_path("checkpoint", "a/b\\c", OsType::Unknown)
            .unwrap();

        assert_eq!(template.workflow()["4"]["inputs"]["ckpt_name"], "a/b\\c");
    }

    #[test]
    fn output_binding_and_lookup() {
        let template = PromptTemplate::new(&sample_workflow(), [] as [&str; 0], ["images"])
            .set_output_node("images", "9")
            .unwrap();

        assert_eq!(template.output_nodes()["images"], "9");
        assert!(template.set_output_node("nope", "9").is_err());
    }

    #[test]
    fn finalize_prunes_bypassed_nodes() {
        let template = PromptTemplate::new(&sample_workflow(), [] as [&str; 0], [] as [&str; 0])
            .bypass("5");
        let finalized = template.finalize();

        assert!(finalized.get("5").is_none());
        assert!(finalized.get("3").is_some());
        // The original template still holds the node.
        assert!(template.workflow().get("5").is_some());
    }

    #[test]
    fn finalize_rewires_references_through_bypassed_nodes() {
        // 9.images -> 3; bypassing 3 forwards 9.images to 3's first
        // reference input in key order (latent_image -> node 5).
        let template = PromptTemplate::new(&sample_workflow(), [] as [&str; 0], [] as [&str; 0])
            .bypass("3");
        let finalized = template.finalize();

        assert!(finalized.get("3").is_none());
        assert_eq!(finalized["9"]["inputs"]["images"], json!(["5", 0]));
    }

    #[test]
    fn reinstate_restores_a_bypassed_node() {
        let template = PromptTemplate::new(&sample_workflow(), [] as [&str; 0], [] as [&str; 0])
            .bypass("5")
            .reinstate("5");
        assert!(template.finalize().get("5").is_some());
    }

    #[test]
    fn clone_yields_independent_templates() {
        let base = PromptTemplate::new(&sample_workflow(), ["seed"], [] as [&str; 0])
            .set_input_node("seed", "3.inputs.seed")
            .unwrap();
        let a = base.input("seed", 1).unwrap();
        let b = base.input("seed", 2).unwrap();

        assert_eq!(a.workflow()["3"]["inputs"]["seed"], 1);
        assert_eq!(b.workflow()["3"]["inputs"]["seed"], 2);
        assert_eq!(base.workflow()["3"]["inputs"]["seed"], 0);
    }
}
