pub mod expression;
pub mod operations;
pub mod scene_graph;
pub mod mesh_asset;
pub mod diagnostics;
pub mod node;
pub mod loader;
pub mod animator;
pub mod reloader;
pub mod viewer;

#[cfg(not(target_arch = "wasm32"))]
pub mod http;
#[cfg(not(target_arch = "wasm32"))]
pub mod cli;

#[cfg(target_arch = "wasm32")]
pub mod wasm;
