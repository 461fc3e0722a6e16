//! Tree loading.
//!
//! [`load_tree`] walks the server's node records from a root path, fetching
//! every set of siblings concurrently, and builds a [`SceneTree`]. It never
//! touches the render surface: mesh loads come back as [`MeshRequest`]s tagged
//! with the tree's generation, so the session can drop results that arrive
//! after the tree was replaced.

use std::cell::RefCell;
use std::collections::HashMap;

use futures::future::{join_all, FutureExt, LocalBoxFuture};
use serde::Deserialize;
use thiserror::Error;

use crate::diagnostics::Diagnostic;
use crate::mesh_asset::{decoder_for, ColorHint, Coloring, MeshAsset, MeshError};
use crate::node::{Context, Generation, SceneNode, SceneTree};
use crate::operations::RawOperation;
use crate::reloader::BuildStatus;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LoadError {
    #[error("request to {url} failed: {message}")]
    Network { url: String, message: String },
    #[error("invalid node at {path}: {reason}")]
    InvalidNode { path: String, reason: String },
    #[error("cannot decode response for {path}: {message}")]
    Decode { path: String, message: String },
    #[error(transparent)]
    Mesh(#[from] MeshError),
}

impl LoadError {
    pub fn network(url: impl Into<String>, message: impl ToString) -> Self {
        LoadError::Network {
            url: url.into(),
            message: message.to_string(),
        }
    }

    fn invalid(path: &str, reason: impl Into<String>) -> Self {
        LoadError::InvalidNode {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

/// Where node records, meshes and build status come from.
///
/// Implementations only move bytes; decoding happens in this module.
#[allow(async_fn_in_trait)]
pub trait NodeSource {
    /// JSON record of the node at `path`.
    async fn fetch_record(&self, path: &str) -> Result<String, LoadError>;

    /// Raw model file `model` of the node at `path`.
    async fn fetch_mesh(&self, path: &str, model: &str) -> Result<Vec<u8>, LoadError>;

    /// JSON build status.
    async fn fetch_build_status(&self) -> Result<String, LoadError>;

    /// Store `code` as the source of the node at `path`.
    async fn save_code(&self, path: &str, code: &str) -> Result<(), LoadError>;
}

/// A node record as sent by the server.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeRecord {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    /// Canonical path; the requested path is used when absent.
    pub path: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub children: Vec<String>,
    pub mtime: Option<f64>,
    #[serde(default)]
    pub operations: Vec<RawOperation>,
    pub color: Option<ColorHint>,
    pub code: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Leaf,
    Fusion,
    Assembly,
}

impl NodeRecord {
    pub fn from_json(path: &str, text: &str) -> Result<Self, LoadError> {
        serde_json::from_str(text).map_err(|e| LoadError::Decode {
            path: path.to_string(),
            message: e.to_string(),
        })
    }

    pub fn record_kind(&self, path: &str) -> Result<RecordKind, LoadError> {
        match self.kind.as_str() {
            "Leaf" | "LeafNode" => Ok(RecordKind::Leaf),
            "Fusion" | "FusionNode" => Ok(RecordKind::Fusion),
            "Assembly" | "AssemblyNode" => Ok(RecordKind::Assembly),
            other => Err(LoadError::invalid(path, format!("unknown node type `{}`", other))),
        }
    }

    fn model(&self, path: &str) -> Result<String, LoadError> {
        self.model
            .clone()
            .ok_or_else(|| LoadError::invalid(path, format!("{} node without a model", self.kind)))
    }
}

pub fn decode_build_status(text: &str) -> Result<BuildStatus, LoadError> {
    serde_json::from_str(text).map_err(|e| LoadError::Decode {
        path: "build status".to_string(),
        message: e.to_string(),
    })
}

/// A mesh to fetch and attach to the node at `path`.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshRequest {
    pub generation: Generation,
    pub path: String,
    pub model: String,
    pub color: Option<ColorHint>,
}

/// Result of a successful [`load_tree`].
#[derive(Debug)]
pub struct LoadedTree {
    pub tree: SceneTree,
    pub mesh_requests: Vec<MeshRequest>,
    /// Expression errors from the initial evaluation.
    pub diagnostics: Vec<Diagnostic>,
}

/// Load the tree rooted at `root_path`.
///
/// The whole load fails if any node fails; partially built subtrees are dropped.
pub async fn load_tree<S: NodeSource>(
    source: &S,
    root_path: &str,
    context: Context,
) -> Result<LoadedTree, LoadError> {
    log::info!("Loading tree at {} (generation {})", root_path, context.generation.0);
    let (root, diagnostics) = load_subtree(source, root_path.to_string(), context.time).await?;

    let mut mesh_requests = Vec::new();
    root.walk(&mut |node, _| {
        if let Some(model) = node.kind.model() {
            mesh_requests.push(MeshRequest {
                generation: context.generation,
                path: node.path.clone(),
                model: model.to_string(),
                color: node.color.clone(),
            });
        }
    });
    log::info!(
        "Loaded {} nodes, {} meshes to fetch",
        root.node_count(),
        mesh_requests.len()
    );

    Ok(LoadedTree {
        tree: SceneTree::new(root, context),
        mesh_requests,
        diagnostics,
    })
}

fn load_subtree<S: NodeSource>(
    source: &S,
    path: String,
    time: f64,
) -> LocalBoxFuture<'_, Result<(SceneNode, Vec<Diagnostic>), LoadError>> {
    async move {
        let text = source.fetch_record(&path).await?;
        let record = NodeRecord::from_json(&path, &text)?;
        let kind = record.record_kind(&path)?;
        let node_path = record.path.clone().unwrap_or_else(|| path.clone());
        let mut diagnostics = Vec::new();

        let node = match kind {
            RecordKind::Leaf => SceneNode::leaf(record.name.clone(), node_path, record.model(&path)?),
            RecordKind::Fusion | RecordKind::Assembly => {
                let pending = record
                    .children
                    .iter()
                    .map(|child| load_subtree(source, child_path(&node_path, child), time));
                let results = join_all(pending).await;

                let mut children = Vec::with_capacity(results.len());
                let mut failure = None;
                for result in results {
                    match result {
                        Ok((child, child_diagnostics)) => {
                            children.push(child);
                            diagnostics.extend(child_diagnostics);
                        }
                        Err(err) if failure.is_none() => failure = Some(err),
                        Err(err) => log::warn!("Additional failure under {}: {}", node_path, err),
                    }
                }
                if let Some(err) = failure {
                    return Err(err);
                }

                if kind == RecordKind::Fusion {
                    SceneNode::fusion(record.name.clone(), node_path, record.model(&path)?, children)
                } else {
                    SceneNode::assembly(record.name.clone(), node_path, children)
                }
            }
        };

        let mut node = node
            .with_color(record.color)
            .with_mtime(record.mtime)
            .with_code(record.code);
        node.set_operation_layers(&record.operations, 0, time, &mut diagnostics);
        Ok((node, diagnostics))
    }
    .boxed_local()
}

/// Resolve a child entry against its parent's path.
pub fn child_path(parent: &str, child: &str) -> String {
    if child.starts_with('/') {
        child.to_string()
    } else if parent.ends_with('/') {
        format!("{}{}", parent, child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Fetch, decode and color the mesh for `request`.
pub async fn fetch_mesh_asset<S: NodeSource>(source: &S, request: &MeshRequest) -> Result<MeshAsset, LoadError> {
    let bytes = source.fetch_mesh(&request.path, &request.model).await?;
    build_mesh(request, &bytes)
}

pub fn build_mesh(request: &MeshRequest, bytes: &[u8]) -> Result<MeshAsset, LoadError> {
    let decoder = decoder_for(&request.model)?;
    let mut asset = decoder.decode(&request.path, bytes)?;
    asset.apply_coloring(Coloring::from_hint(request.color.as_ref()));
    Ok(asset)
}

/// Server URLs, relative to `base` (empty in the browser, an origin natively).
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoints {
    pub base: String,
    pub api_prefix: String,
    pub build_status_path: String,
}

impl Endpoints {
    pub fn new(base: &str, api_prefix: &str, build_status_path: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            api_prefix: api_prefix.trim_end_matches('/').to_string(),
            build_status_path: build_status_path.to_string(),
        }
    }

    /// `bust` defeats HTTP caches; callers pass the current time in milliseconds.
    pub fn record_url(&self, path: &str, bust: i64) -> String {
        format!("{}{}{}?t={}", self.base, self.api_prefix, path, bust)
    }

    pub fn mesh_url(&self, path: &str, model: &str, bust: i64) -> String {
        format!(
            "{}{}{}/{}?t={}",
            self.base,
            self.api_prefix,
            path.trim_end_matches('/'),
            model,
            bust
        )
    }

    pub fn save_url(&self, path: &str) -> String {
        format!("{}{}{}", self.base, self.api_prefix, path)
    }

    pub fn build_status_url(&self) -> String {
        format!("{}{}", self.base, self.build_status_path)
    }
}

/// A [`NodeSource`] serving fixed content from memory.
#[derive(Debug, Default)]
pub struct MemorySource {
    records: HashMap<String, String>,
    meshes: HashMap<String, Vec<u8>>,
    build_status: RefCell<String>,
    saved: RefCell<Vec<(String, String)>>,
    requests: RefCell<Vec<String>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            build_status: RefCell::new(r#"{"error": "", "tstamp": 0}"#.to_string()),
            ..Default::default()
        }
    }

    pub fn insert_record(&mut self, path: &str, json: impl Into<String>) {
        self.records.insert(path.to_string(), json.into());
    }

    pub fn remove_record(&mut self, path: &str) {
        self.records.remove(path);
    }

    pub fn insert_mesh(&mut self, path: &str, model: &str, bytes: Vec<u8>) {
        self.meshes.insert(format!("{}/{}", path, model), bytes);
    }

    pub fn set_build_status(&self, json: impl Into<String>) {
        *self.build_status.borrow_mut() = json.into();
    }

    /// `(path, code)` pairs received by [`NodeSource::save_code`].
    pub fn saved(&self) -> Vec<(String, String)> {
        self.saved.borrow().clone()
    }

    /// Every path or mesh key requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.borrow().clone()
    }
}

impl NodeSource for MemorySource {
    async fn fetch_record(&self, path: &str) -> Result<String, LoadError> {
        self.requests.borrow_mut().push(path.to_string());
        self.records
            .get(path)
            .cloned()
            .ok_or_else(|| LoadError::network(path, "404 Not Found"))
    }

    async fn fetch_mesh(&self, path: &str, model: &str) -> Result<Vec<u8>, LoadError> {
        let key = format!("{}/{}", path, model);
        self.requests.borrow_mut().push(key.clone());
        self.meshes
            .get(&key)
            .cloned()
            .ok_or_else(|| LoadError::network(key, "404 Not Found"))
    }

    async fn fetch_build_status(&self) -> Result<String, LoadError> {
        Ok(self.build_status.borrow().clone())
    }

    async fn save_code(&self, path: &str, code: &str) -> Result<(), LoadError> {
        if !self.records.contains_key(path) {
            return Err(LoadError::network(path, "404 Not Found"));
        }
        self.saved.borrow_mut().push((path.to_string(), code.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeKind;
    use crate::operations::Operation;

    fn source() -> MemorySource {
        let mut source = MemorySource::new();
        source.insert_record(
            "/arm",
            r##"{"type": "FusionNode", "name": "arm", "path": "/arm", "model": "arm.stl",
                "children": ["hand", "/extra"], "operations": [["r", "$t*360", [0, 0, 1]]],
                "color": "#ff0000"}"##,
        );
        source.insert_record(
            "/arm/hand",
            r#"{"type": "Leaf", "name": "hand", "model": "hand.stl", "operations": [["t", ["1", "0", "0"]]]}"#,
        );
        source.insert_record(
            "/extra",
            r#"{"type": "Assembly", "name": "extra", "children": [], "operations": [], "code": "cube(1);"}"#,
        );
        source
    }

    #[test]
    fn test_child_path() {
        assert_eq!(child_path("/a", "b"), "/a/b");
        assert_eq!(child_path("/", "b"), "/b");
        assert_eq!(child_path("/a", "/x/y"), "/x/y");
    }

    #[test]
    fn test_load_tree() {
        let source = source();
        let loaded = pollster::block_on(load_tree(&source, "/arm", Context::new(Generation(4), 0.25))).unwrap();

        let root = loaded.tree.root();
        assert_eq!(root.kind, NodeKind::Fusion { model: "arm.stl".into() });
        assert_eq!(root.children().len(), 2);

        let hand = root.find("/arm/hand").unwrap();
        assert_eq!(
            hand.evaluated_layers(),
            &[
                vec![Operation::Translate([1.0, 0.0, 0.0])],
                vec![Operation::Rotate { degrees: 90.0, axis: [0.0, 0.0, 1.0] }],
            ]
        );
        assert_eq!(root.find("/extra").unwrap().code.as_deref(), Some("cube(1);"));

        let requests: Vec<_> = loaded.mesh_requests.iter().map(|r| (r.path.as_str(), r.generation)).collect();
        assert_eq!(requests, vec![("/arm", Generation(4)), ("/arm/hand", Generation(4))]);
        assert_eq!(loaded.mesh_requests[0].color, Some(ColorHint::Name("#ff0000".into())));
        assert!(loaded.diagnostics.is_empty());
    }

    #[test]
    fn test_missing_child_fails_whole_load() {
        let mut source = source();
        source.remove_record("/extra");
        let result = pollster::block_on(load_tree(&source, "/arm", Context::new(Generation(1), 0.0)));
        assert!(matches!(result, Err(LoadError::Network { .. })));
        // Sibling fetches still ran to completion.
        assert!(source.requests().contains(&"/arm/hand".to_string()));
    }

    #[test]
    fn test_invalid_records() {
        let mut source = MemorySource::new();
        source.insert_record("/a", r#"{"type": "Sphere", "name": "a"}"#);
        source.insert_record("/b", r#"{"type": "Leaf", "name": "b"}"#);
        source.insert_record("/c", "not json");

        let load = |path| pollster::block_on(load_tree(&source, path, Context::new(Generation(1), 0.0)));
        assert!(matches!(load("/a"), Err(LoadError::InvalidNode { .. })));
        assert!(matches!(load("/b"), Err(LoadError::InvalidNode { .. })));
        assert!(matches!(load("/c"), Err(LoadError::Decode { .. })));
    }

    #[test]
    fn test_bad_expression_is_a_diagnostic() {
        let mut source = MemorySource::new();
        source.insert_record(
            "/a",
            r#"{"type": "Leaf", "name": "a", "model": "a.stl", "operations": [["r", "norm(1)", [1, 0, 0]]]}"#,
        );
        let loaded = pollster::block_on(load_tree(&source, "/a", Context::new(Generation(1), 0.0))).unwrap();
        assert_eq!(loaded.diagnostics.len(), 1);
        assert_eq!(
            loaded.tree.root().evaluated_layers()[0],
            vec![Operation::Rotate { degrees: 0.0, axis: [1.0, 0.0, 0.0] }]
        );
    }

    #[test]
    fn test_endpoints() {
        let endpoints = Endpoints::new("http://localhost:8000/", "/api", "/_build_error");
        assert_eq!(endpoints.record_url("/arm", 17), "http://localhost:8000/api/arm?t=17");
        assert_eq!(endpoints.mesh_url("/arm", "arm.stl", 17), "http://localhost:8000/api/arm/arm.stl?t=17");
        assert_eq!(endpoints.save_url("/arm"), "http://localhost:8000/api/arm");
        assert_eq!(endpoints.build_status_url(), "http://localhost:8000/_build_error");
    }

    #[test]
    fn test_unsupported_model_format() {
        let request = MeshRequest {
            generation: Generation(1),
            path: "/a".into(),
            model: "a.step".into(),
            color: None,
        };
        assert!(matches!(build_mesh(&request, b""), Err(LoadError::Mesh(MeshError::UnsupportedFormat(_)))));
    }
}
