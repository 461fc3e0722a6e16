//! The node tree and its transform layers.
//!
//! A node's mesh pose is always fully determined by its evaluated layers: the
//! mesh enters the surface with an identity pose and every layer is applied on
//! top. Moving to a new time unapplies the old values exactly, then applies the
//! new ones, so repeated ticks never accumulate error beyond floating point.
//!
//! Layers cascade from ancestors. A node stores its own operations at index 0
//! and the ancestor `k` levels up stores its operations at index `k`; nothing
//! else composes transforms between nodes.

use std::collections::HashSet;

use serde::Serialize;

use crate::diagnostics::{Diagnostic, ErrorSink};
use crate::mesh_asset::ColorHint;
use crate::operations::{apply_layers, evaluate_operations, unapply_layers, Operation, RawOperation};
use crate::scene_graph::{MeshHandle, Pose, RenderSurface};

/// Identifier of one loaded tree. Results tagged with an older generation are stale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Generation(pub u64);

impl Generation {
    pub fn next(self) -> Self {
        Generation(self.0 + 1)
    }
}

/// Shared state of one tree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Context {
    /// Normalized animation time in `[0, 1)`.
    pub time: f64,
    pub generation: Generation,
}

impl Context {
    pub fn new(generation: Generation, time: f64) -> Self {
        Self { time, generation }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// A mesh with no children.
    Leaf { model: String },
    /// A mesh together with child nodes.
    Fusion { model: String },
    /// Grouping only.
    Assembly,
}

impl NodeKind {
    pub fn model(&self) -> Option<&str> {
        match self {
            NodeKind::Leaf { model } | NodeKind::Fusion { model } => Some(model),
            NodeKind::Assembly => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Leaf { .. } => "leaf",
            NodeKind::Fusion { .. } => "fusion",
            NodeKind::Assembly => "assembly",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "handle", rename_all = "snake_case")]
pub enum MeshState {
    /// Assemblies carry no mesh.
    None,
    Unloaded,
    Loaded(MeshHandle),
}

#[derive(Debug, Clone)]
pub struct SceneNode {
    pub name: String,
    pub path: String,
    pub kind: NodeKind,
    pub color: Option<ColorHint>,
    /// Freshness marker from the server.
    pub mtime: Option<f64>,
    /// Source text of the node, if the server sent it.
    pub code: Option<String>,
    children: Vec<SceneNode>,
    operation_layers: Vec<Vec<RawOperation>>,
    evaluated_layers: Vec<Vec<Operation>>,
    mesh: Option<MeshHandle>,
}

impl SceneNode {
    fn new(name: String, path: String, kind: NodeKind, children: Vec<SceneNode>) -> Self {
        Self {
            name,
            path,
            kind,
            color: None,
            mtime: None,
            code: None,
            children,
            operation_layers: Vec::new(),
            evaluated_layers: Vec::new(),
            mesh: None,
        }
    }

    pub fn leaf(name: impl Into<String>, path: impl Into<String>, model: impl Into<String>) -> Self {
        Self::new(name.into(), path.into(), NodeKind::Leaf { model: model.into() }, Vec::new())
    }

    pub fn fusion(
        name: impl Into<String>,
        path: impl Into<String>,
        model: impl Into<String>,
        children: Vec<SceneNode>,
    ) -> Self {
        Self::new(name.into(), path.into(), NodeKind::Fusion { model: model.into() }, children)
    }

    pub fn assembly(name: impl Into<String>, path: impl Into<String>, children: Vec<SceneNode>) -> Self {
        Self::new(name.into(), path.into(), NodeKind::Assembly, children)
    }

    pub fn with_color(mut self, color: Option<ColorHint>) -> Self {
        self.color = color;
        self
    }

    pub fn with_mtime(mut self, mtime: Option<f64>) -> Self {
        self.mtime = mtime;
        self
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }

    pub fn children(&self) -> &[SceneNode] {
        &self.children
    }

    pub fn operation_layers(&self) -> &[Vec<RawOperation>] {
        &self.operation_layers
    }

    pub fn evaluated_layers(&self) -> &[Vec<Operation>] {
        &self.evaluated_layers
    }

    pub fn mesh(&self) -> Option<MeshHandle> {
        self.mesh
    }

    pub fn mesh_state(&self) -> MeshState {
        match (&self.kind, self.mesh) {
            (NodeKind::Assembly, _) => MeshState::None,
            (_, Some(handle)) => MeshState::Loaded(handle),
            (_, None) => MeshState::Unloaded,
        }
    }

    /// Store `ops` at layer `depth` and evaluate them at `time`, then cascade
    /// to every descendant at `depth + 1`.
    ///
    /// Operations that fail to evaluate take the identity of the same tag and
    /// the error is pushed to `diagnostics`. The surface is not touched; a mesh
    /// attached later picks up the layers.
    pub fn set_operation_layers(
        &mut self,
        ops: &[RawOperation],
        depth: usize,
        time: f64,
        diagnostics: &mut Vec<Diagnostic>,
    ) {
        if self.operation_layers.len() <= depth {
            self.operation_layers.resize_with(depth + 1, Vec::new);
            self.evaluated_layers.resize_with(depth + 1, Vec::new);
        }

        let evaluated = ops
            .iter()
            .map(|op| {
                op.evaluate(time).unwrap_or_else(|err| {
                    diagnostics.push(Diagnostic::expression(&self.path, &err));
                    op.identity()
                })
            })
            .collect();
        self.operation_layers[depth] = ops.to_vec();
        self.evaluated_layers[depth] = evaluated;

        for child in &mut self.children {
            child.set_operation_layers(ops, depth + 1, time, diagnostics);
        }
    }

    /// Apply the current layers to this node's mesh and every descendant's.
    pub fn apply_operations(&self, surface: &mut dyn RenderSurface) {
        if let Some(pose) = mesh_pose(self.mesh, surface) {
            apply_layers(&self.evaluated_layers, pose);
        }
        for child in &self.children {
            child.apply_operations(surface);
        }
    }

    /// Exact inverse of [`SceneNode::apply_operations`].
    pub fn unapply_operations(&self, surface: &mut dyn RenderSurface) {
        if let Some(pose) = mesh_pose(self.mesh, surface) {
            unapply_layers(&self.evaluated_layers, pose);
        }
        for child in &self.children {
            child.unapply_operations(surface);
        }
    }

    /// Move this subtree to `time`.
    ///
    /// Each node updates atomically: if any of its expressions fails, the
    /// failure goes to `diagnostics` and the node keeps its previous values.
    pub fn set_time(&mut self, time: f64, surface: &mut dyn RenderSurface, diagnostics: &mut Vec<Diagnostic>) {
        let reevaluated: Result<Vec<_>, _> = self
            .operation_layers
            .iter()
            .map(|layer| evaluate_operations(layer, time))
            .collect();

        match reevaluated {
            Ok(layers) => {
                if let Some(pose) = mesh_pose(self.mesh, surface) {
                    unapply_layers(&self.evaluated_layers, pose);
                    apply_layers(&layers, pose);
                }
                self.evaluated_layers = layers;
            }
            Err(err) => diagnostics.push(Diagnostic::expression(&self.path, &err)),
        }

        for child in &mut self.children {
            child.set_time(time, surface, diagnostics);
        }
    }

    /// Install `handle` as this node's mesh and pose it with the current layers.
    ///
    /// A previous mesh is removed from the surface first. Assemblies cannot
    /// hold a mesh; the handle is removed and `false` returned.
    pub fn attach_mesh(&mut self, handle: MeshHandle, surface: &mut dyn RenderSurface) -> bool {
        if self.kind.model().is_none() {
            surface.remove_mesh(handle);
            return false;
        }
        if let Some(previous) = self.mesh.replace(handle) {
            surface.remove_mesh(previous);
        }
        if let Some(pose) = surface.pose_mut(handle) {
            apply_layers(&self.evaluated_layers, pose);
        }
        true
    }

    /// Remove every mesh in this subtree from the surface.
    pub fn release_meshes(&mut self, surface: &mut dyn RenderSurface) {
        if let Some(handle) = self.mesh.take() {
            surface.remove_mesh(handle);
        }
        for child in &mut self.children {
            child.release_meshes(surface);
        }
    }

    pub fn find(&self, path: &str) -> Option<&SceneNode> {
        if self.path == path {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(path))
    }

    pub fn find_mut(&mut self, path: &str) -> Option<&mut SceneNode> {
        if self.path == path {
            return Some(self);
        }
        self.children.iter_mut().find_map(|c| c.find_mut(path))
    }

    /// Visit nodes depth first, parents before children. The root is at depth 0.
    pub fn walk(&self, visit: &mut impl FnMut(&SceneNode, usize)) {
        self.walk_at(0, visit);
    }

    fn walk_at(&self, depth: usize, visit: &mut impl FnMut(&SceneNode, usize)) {
        visit(self, depth);
        for child in &self.children {
            child.walk_at(depth + 1, visit);
        }
    }

    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(SceneNode::node_count).sum::<usize>()
    }

    pub fn summary(&self) -> NodeSummary {
        NodeSummary {
            name: self.name.clone(),
            path: self.path.clone(),
            kind: self.kind.label(),
            model: self.kind.model().map(str::to_string),
            mesh: self.mesh_state(),
            layers: self.evaluated_layers.clone(),
            children: self.children.iter().map(SceneNode::summary).collect(),
        }
    }
}

fn mesh_pose(mesh: Option<MeshHandle>, surface: &mut dyn RenderSurface) -> Option<&mut Pose> {
    match mesh {
        Some(handle) => surface.pose_mut(handle),
        None => None,
    }
}

/// Serializable snapshot of a subtree.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    pub name: String,
    pub path: String,
    pub kind: &'static str,
    pub model: Option<String>,
    pub mesh: MeshState,
    pub layers: Vec<Vec<Operation>>,
    pub children: Vec<NodeSummary>,
}

/// A loaded tree with its context.
#[derive(Debug)]
pub struct SceneTree {
    root: SceneNode,
    context: Context,
    /// Expression errors already reported for this generation.
    reported: HashSet<String>,
}

impl SceneTree {
    pub fn new(root: SceneNode, context: Context) -> Self {
        Self {
            root,
            context,
            reported: HashSet::new(),
        }
    }

    pub fn root(&self) -> &SceneNode {
        &self.root
    }

    pub fn context(&self) -> Context {
        self.context
    }

    pub fn generation(&self) -> Generation {
        self.context.generation
    }

    pub fn time(&self) -> f64 {
        self.context.time
    }

    /// Advance the whole tree to `time`, reporting new expression errors.
    pub fn set_time(&mut self, time: f64, surface: &mut dyn RenderSurface, errors: &mut dyn ErrorSink) {
        self.context.time = time;
        let mut diagnostics = Vec::new();
        self.root.set_time(time, surface, &mut diagnostics);
        self.report(diagnostics, errors);
    }

    /// Forward diagnostics to the sink, each distinct message once per tree.
    pub fn report(&mut self, diagnostics: Vec<Diagnostic>, errors: &mut dyn ErrorSink) {
        for diagnostic in diagnostics {
            if self.reported.insert(diagnostic.to_string()) {
                errors.report(&diagnostic);
            }
        }
    }

    /// Attach a freshly inserted mesh to the node at `path`.
    ///
    /// Returns `false`, with the mesh removed again, when no mesh-bearing node
    /// has that path.
    pub fn attach_mesh(&mut self, path: &str, handle: MeshHandle, surface: &mut dyn RenderSurface) -> bool {
        match self.root.find_mut(path) {
            Some(node) => node.attach_mesh(handle, surface),
            None => {
                surface.remove_mesh(handle);
                false
            }
        }
    }

    /// Release every mesh of this tree.
    pub fn retire(mut self, surface: &mut dyn RenderSurface) {
        self.root.release_meshes(surface);
    }
}
