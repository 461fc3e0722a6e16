//! Render surface for loaded node meshes.
//!
//! The core never draws anything. It inserts meshes into a [`RenderSurface`],
//! removes them when their node is destroyed or reloaded, and mutates each
//! mesh's [`Pose`] while the node is loaded. [`SceneGraph`] is the in-memory
//! surface used by the browser binding, the CLI and the tests: the host
//! renderer drains its change log and reads poses every frame.

use std::collections::HashMap;
use std::sync::Arc;

use glam::{DMat4, DQuat, DVec3};
use serde::Serialize;

use crate::mesh_asset::MeshAsset;

/// Unique identifier for a mesh on the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MeshHandle(pub u64);

/// Placement of a mesh: a position plus an orientation about the mesh origin.
///
/// Rotations premultiply the orientation and leave the position untouched;
/// translations move the position. This is the pose model the server's
/// operation lists are written against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: DVec3,
    pub orientation: DQuat,
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            position: DVec3::ZERO,
            orientation: DQuat::IDENTITY,
        }
    }
}

impl Pose {
    /// Rotate by `radians` about `axis`. A zero axis leaves the pose unchanged.
    pub fn rotate(&mut self, axis: [f64; 3], radians: f64) {
        let axis = DVec3::from_array(axis).normalize_or_zero();
        if axis == DVec3::ZERO {
            return;
        }
        self.orientation = DQuat::from_axis_angle(axis, radians) * self.orientation;
    }

    pub fn translate(&mut self, offset: DVec3) {
        self.position += offset;
    }

    /// Model matrix for renderers.
    pub fn matrix(&self) -> DMat4 {
        DMat4::from_rotation_translation(self.orientation, self.position)
    }

    pub fn abs_diff_eq(&self, other: &Pose, max_abs_diff: f64) -> bool {
        self.position.abs_diff_eq(other.position, max_abs_diff)
            && (self.orientation.abs_diff_eq(other.orientation, max_abs_diff)
                || self.orientation.abs_diff_eq(-other.orientation, max_abs_diff))
    }
}

/// What the core needs from the rendering engine.
pub trait RenderSurface {
    /// Add a mesh to the displayed scene with an identity pose.
    fn insert_mesh(&mut self, path: &str, asset: MeshAsset) -> MeshHandle;

    /// Remove a mesh. Returns false if the handle is unknown.
    fn remove_mesh(&mut self, handle: MeshHandle) -> bool;

    fn pose(&self, handle: MeshHandle) -> Option<&Pose>;

    fn pose_mut(&mut self, handle: MeshHandle) -> Option<&mut Pose>;
}

/// A mesh on the surface.
#[derive(Debug, Clone)]
pub struct MeshInstance {
    /// Path of the node that owns this mesh.
    pub path: String,
    pub asset: Arc<MeshAsset>,
    pub pose: Pose,
    pub visible: bool,
}

/// Change notifications for the host renderer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SceneEvent {
    Inserted { handle: MeshHandle, path: String },
    Removed { handle: MeshHandle, path: String },
}

/// In-memory render surface.
#[derive(Debug)]
pub struct SceneGraph {
    meshes: HashMap<MeshHandle, MeshInstance>,
    /// Insertion order, for stable iteration.
    order: Vec<MeshHandle>,
    events: Vec<SceneEvent>,
    next_id: u64,
}

impl SceneGraph {
    pub fn new() -> Self {
        Self {
            meshes: HashMap::new(),
            order: Vec::new(),
            events: Vec::new(),
            next_id: 1,
        }
    }

    fn new_handle(&mut self) -> MeshHandle {
        let handle = MeshHandle(self.next_id);
        self.next_id += 1;
        handle
    }

    pub fn get(&self, handle: MeshHandle) -> Option<&MeshInstance> {
        self.meshes.get(&handle)
    }

    /// Meshes in insertion order.
    pub fn meshes(&self) -> impl Iterator<Item = (MeshHandle, &MeshInstance)> {
        self.order
            .iter()
            .filter_map(|&handle| self.meshes.get(&handle).map(|m| (handle, m)))
    }

    /// The mesh owned by the node at `path`, if any.
    pub fn find_by_path(&self, path: &str) -> Option<(MeshHandle, &MeshInstance)> {
        self.meshes().find(|(_, mesh)| mesh.path == path)
    }

    pub fn len(&self) -> usize {
        self.meshes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }

    pub fn set_visible(&mut self, handle: MeshHandle, visible: bool) -> bool {
        match self.meshes.get_mut(&handle) {
            Some(mesh) => {
                mesh.visible = visible;
                true
            }
            None => false,
        }
    }

    /// Take the change log accumulated since the last call.
    pub fn drain_events(&mut self) -> Vec<SceneEvent> {
        std::mem::take(&mut self.events)
    }

    /// Remove every mesh.
    pub fn clear(&mut self) {
        for handle in self.order.clone() {
            self.remove_mesh(handle);
        }
    }
}

impl Default for SceneGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderSurface for SceneGraph {
    fn insert_mesh(&mut self, path: &str, asset: MeshAsset) -> MeshHandle {
        let handle = self.new_handle();
        self.meshes.insert(
            handle,
            MeshInstance {
                path: path.to_string(),
                asset: Arc::new(asset),
                pose: Pose::default(),
                visible: true,
            },
        );
        self.order.push(handle);
        self.events.push(SceneEvent::Inserted {
            handle,
            path: path.to_string(),
        });
        handle
    }

    fn remove_mesh(&mut self, handle: MeshHandle) -> bool {
        let Some(mesh) = self.meshes.remove(&handle) else {
            return false;
        };
        self.order.retain(|&h| h != handle);
        self.events.push(SceneEvent::Removed {
            handle,
            path: mesh.path,
        });
        true
    }

    fn pose(&self, handle: MeshHandle) -> Option<&Pose> {
        self.meshes.get(&handle).map(|m| &m.pose)
    }

    fn pose_mut(&mut self, handle: MeshHandle) -> Option<&mut Pose> {
        self.meshes.get_mut(&handle).map(|m| &mut m.pose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset() -> MeshAsset {
        MeshAsset::from_triangles("tri", &[[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]])
    }

    #[test]
    fn test_insert_and_remove() {
        let mut scene = SceneGraph::new();
        let id = scene.insert_mesh("/root/leaf", asset());

        assert_eq!(scene.len(), 1);
        assert_eq!(scene.pose(id), Some(&Pose::default()));
        assert_eq!(scene.find_by_path("/root/leaf").map(|(h, _)| h), Some(id));

        assert!(scene.remove_mesh(id));
        assert!(!scene.remove_mesh(id));
        assert!(scene.is_empty());

        let events = scene.drain_events();
        assert_eq!(
            events,
            vec![
                SceneEvent::Inserted { handle: id, path: "/root/leaf".to_string() },
                SceneEvent::Removed { handle: id, path: "/root/leaf".to_string() },
            ]
        );
        assert!(scene.drain_events().is_empty());
    }

    #[test]
    fn test_handles_are_unique() {
        let mut scene = SceneGraph::new();
        let a = scene.insert_mesh("/a", asset());
        scene.remove_mesh(a);
        let b = scene.insert_mesh("/a", asset());
        assert_ne!(a, b);
    }

    #[test]
    fn test_rotation_keeps_position() {
        let mut pose = Pose::default();
        pose.translate(DVec3::new(1.0, 0.0, 0.0));
        pose.rotate([0.0, 0.0, 2.0], std::f64::consts::FRAC_PI_2);

        assert_eq!(pose.position, DVec3::new(1.0, 0.0, 0.0));
        let rotated = pose.orientation * DVec3::X;
        assert!(rotated.abs_diff_eq(DVec3::Y, 1e-12));
    }

    #[test]
    fn test_zero_axis_is_ignored() {
        let mut pose = Pose::default();
        pose.rotate([0.0, 0.0, 0.0], 1.0);
        assert_eq!(pose, Pose::default());
    }
}
