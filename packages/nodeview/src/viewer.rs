//! Viewer session: one render surface, one error sink, at most one tree.
//!
//! Loading is split into steps so hosts that cannot hold the session across
//! an `await` (the browser binding) can drive it piecewise:
//!
//! 1. [`Viewer::begin_load`] allocates a generation,
//! 2. the host runs [`load_tree`] with [`Viewer::load_context`],
//! 3. [`Viewer::install_tree`] swaps the tree in and returns mesh requests,
//! 4. each finished mesh goes through [`Viewer::land_mesh`].
//!
//! Any result tagged with a generation other than the newest is dropped.
//! Native callers can use [`Viewer::reload_with`] which runs all four.

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::animator::Animator;
use crate::diagnostics::{Diagnostic, DiagnosticKind, ErrorSink};
use crate::loader::{
    decode_build_status, fetch_mesh_asset, load_tree, Endpoints, LoadError, LoadedTree, MeshRequest, NodeSource,
};
use crate::mesh_asset::MeshAsset;
use crate::node::{Context, Generation, SceneTree};
use crate::reloader::{BuildStatus, Reconnect, ReconnectPolicy, ReloadDecision, Reloader};
use crate::scene_graph::RenderSurface;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Prefix of the node API, e.g. `/api`.
    pub api_prefix: String,
    /// Path of the root node.
    pub root_path: String,
    pub build_status_path: String,
    pub reload_channel_path: String,
    /// Frames in one animation loop; 0 keeps the scene still.
    pub frames_per_loop: u32,
    pub ticks_per_second: f64,
    pub reconnect: ReconnectPolicy,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            api_prefix: "/api".to_string(),
            root_path: "/".to_string(),
            build_status_path: "/_build_error".to_string(),
            reload_channel_path: "/ws/reload".to_string(),
            frames_per_loop: 0,
            ticks_per_second: 0.0,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ViewerConfig {
    /// Endpoints relative to `base`, an origin such as `http://localhost:8000`
    /// or empty for same-origin requests.
    pub fn endpoints(&self, base: &str) -> Endpoints {
        Endpoints::new(base, &self.api_prefix, &self.build_status_path)
    }
}

pub struct Viewer<S: RenderSurface, E: ErrorSink> {
    config: ViewerConfig,
    surface: S,
    errors: E,
    tree: Option<SceneTree>,
    animator: Animator,
    reloader: Reloader,
    /// Newest generation handed out.
    generation: Generation,
    /// Last time given to [`Viewer::set_time`]; new trees start here.
    time: f64,
}

impl<S: RenderSurface, E: ErrorSink> Viewer<S, E> {
    pub fn new(config: ViewerConfig, surface: S, errors: E) -> Self {
        let mut animator = Animator::new();
        animator.configure(config.frames_per_loop, config.ticks_per_second);
        let reloader = Reloader::new(config.reconnect);
        Self {
            config,
            surface,
            errors,
            tree: None,
            animator,
            reloader,
            generation: Generation::default(),
            time: 0.0,
        }
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn errors(&self) -> &E {
        &self.errors
    }

    pub fn errors_mut(&mut self) -> &mut E {
        &mut self.errors
    }

    pub fn tree(&self) -> Option<&SceneTree> {
        self.tree.as_ref()
    }

    pub fn animator(&self) -> &Animator {
        &self.animator
    }

    /// Newest generation handed out by [`Viewer::begin_load`].
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn begin_load(&mut self) -> Generation {
        self.generation = self.generation.next();
        log::debug!("Starting load generation {}", self.generation.0);
        self.generation
    }

    /// Context for a tree being loaded as `generation`: starts at the displayed time.
    pub fn load_context(&self, generation: Generation) -> Context {
        Context::new(generation, self.time)
    }

    /// Make a finished load current. Returns the meshes to fetch for it.
    pub fn install_tree(
        &mut self,
        generation: Generation,
        result: Result<LoadedTree, LoadError>,
    ) -> Vec<MeshRequest> {
        if generation != self.generation {
            log::debug!(
                "Discarding tree of generation {} (current {})",
                generation.0,
                self.generation.0
            );
            return Vec::new();
        }

        let loaded = match result {
            Ok(loaded) => loaded,
            Err(err) => {
                self.errors
                    .set_error(&format!("Cannot load {}: {}", self.config.root_path, err));
                self.errors.report(&Diagnostic::load(&self.config.root_path, &err));
                return Vec::new();
            }
        };

        if let Some(previous) = self.tree.take() {
            previous.retire(&mut self.surface);
        }
        let LoadedTree {
            mut tree,
            mesh_requests,
            diagnostics,
        } = loaded;
        tree.report(diagnostics, &mut self.errors);
        log::info!("Installed tree generation {}", generation.0);
        self.tree = Some(tree);
        mesh_requests
    }

    /// Attach a fetched mesh. Returns true when it was inserted.
    pub fn land_mesh(&mut self, request: &MeshRequest, result: Result<MeshAsset, LoadError>) -> bool {
        let Some(tree) = self.tree.as_mut().filter(|t| t.generation() == request.generation) else {
            log::debug!(
                "Discarding mesh for {} from generation {}",
                request.path,
                request.generation.0
            );
            return false;
        };

        match result {
            Ok(asset) => {
                let handle = self.surface.insert_mesh(&request.path, asset);
                tree.attach_mesh(&request.path, handle, &mut self.surface)
            }
            Err(err) => {
                tree.report(vec![Diagnostic::mesh(&request.path, &err)], &mut self.errors);
                false
            }
        }
    }

    /// Drive the clock from the host's frame callback. True when the scene moved.
    pub fn frame(&mut self, timestamp_ms: f64) -> bool {
        match self.animator.on_frame(timestamp_ms) {
            Some(time) => {
                self.set_time(time);
                true
            }
            None => false,
        }
    }

    /// Advance one animation frame without waiting for the clock.
    pub fn step(&mut self) -> f64 {
        let time = self.animator.step();
        self.set_time(time);
        time
    }

    pub fn set_time(&mut self, time: f64) {
        self.time = time;
        if let Some(tree) = self.tree.as_mut() {
            tree.set_time(time, &mut self.surface, &mut self.errors);
        }
    }

    pub fn configure_animation(&mut self, frames_per_loop: u32, ticks_per_second: f64) {
        self.config.frames_per_loop = frames_per_loop;
        self.config.ticks_per_second = ticks_per_second;
        self.animator.configure(frames_per_loop, ticks_per_second);
    }

    /// A push-channel message arrived. True when the build status should be checked.
    pub fn handle_push(&self, text: &str) -> bool {
        self.reloader.on_message(text)
    }

    /// True when the tree should be reloaded.
    pub fn handle_build_status(&mut self, status: &BuildStatus) -> bool {
        match self.reloader.reconcile(status, &mut self.errors) {
            ReloadDecision::Reload => true,
            ReloadDecision::Freeze => {
                self.errors
                    .report(&Diagnostic::new(DiagnosticKind::Build, None, status.error.as_str()));
                false
            }
        }
    }

    /// Start or stop watching the push channel.
    pub fn set_watching(&mut self, watching: bool) {
        if watching {
            self.reloader.resume();
        } else {
            self.reloader.stop();
        }
    }

    pub fn is_watching(&self) -> bool {
        self.reloader.is_watching()
    }

    pub fn channel_opened(&mut self) {
        self.reloader.on_open();
    }

    pub fn channel_closed(&mut self) -> Reconnect {
        let next = self.reloader.on_close();
        if next == Reconnect::GiveUp {
            let message = "Lost connection to the build server";
            self.errors.set_error(message);
            self.errors.report(&Diagnostic::offline(message));
        }
        next
    }

    /// Load the root tree and all its meshes from `source`.
    pub async fn reload_with<N: NodeSource>(&mut self, source: &N) -> Result<(), LoadError> {
        let generation = self.begin_load();
        let context = self.load_context(generation);
        let result = load_tree(source, &self.config.root_path, context).await;
        let failure = result.as_ref().err().cloned();

        let requests = self.install_tree(generation, result);
        if let Some(err) = failure {
            return Err(err);
        }

        let meshes = join_all(requests.iter().map(|r| fetch_mesh_asset(source, r))).await;
        for (request, mesh) in requests.iter().zip(meshes) {
            self.land_mesh(request, mesh);
        }
        Ok(())
    }

    /// Check the build status and reload if it calls for it. True when reloaded.
    pub async fn sync_with<N: NodeSource>(&mut self, source: &N) -> Result<bool, LoadError> {
        let status = decode_build_status(&source.fetch_build_status().await?)?;
        if !self.handle_build_status(&status) {
            return Ok(false);
        }
        self.reload_with(source).await?;
        Ok(true)
    }

    /// Send edited source text for the node at `path`.
    pub async fn save_code<N: NodeSource>(&self, source: &N, path: &str, code: &str) -> Result<(), LoadError> {
        save_code(source, path, code).await
    }
}

pub async fn save_code<N: NodeSource>(source: &N, path: &str, code: &str) -> Result<(), LoadError> {
    source.save_code(path, code).await?;
    log::info!("Saved {} bytes of code for {}", code.len(), path);
    Ok(())
}
