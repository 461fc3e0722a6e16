use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use serde::Serialize;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::{future_to_promise, spawn_local, JsFuture};
use web_sys::{CloseEvent, Headers, MessageEvent, Request, RequestInit, Response, WebSocket};

use crate::diagnostics::ErrorLog;
use crate::loader::{decode_build_status, fetch_mesh_asset, load_tree, Endpoints, LoadError, NodeSource};
use crate::reloader::{channel_url, Reconnect};
use crate::scene_graph::{MeshHandle, SceneGraph};
use crate::viewer::{save_code, Viewer, ViewerConfig};

/// Same-origin `fetch` source.
struct FetchSource {
    endpoints: Endpoints,
}

fn js_error(url: &str, value: JsValue) -> LoadError {
    let message = value.as_string().unwrap_or_else(|| format!("{:?}", value));
    LoadError::network(url, message)
}

fn cache_bust() -> i64 {
    js_sys::Date::now() as i64
}

async fn fetch(url: &str, init: &RequestInit) -> Result<Response, LoadError> {
    let window = web_sys::window().ok_or_else(|| LoadError::network(url, "no window"))?;
    let request = Request::new_with_str_and_init(url, init).map_err(|e| js_error(url, e))?;
    let value = JsFuture::from(window.fetch_with_request(&request))
        .await
        .map_err(|e| js_error(url, e))?;
    let response: Response = value.dyn_into().map_err(|e| js_error(url, e))?;
    if !response.ok() {
        return Err(LoadError::network(
            url,
            format!("HTTP {} {}", response.status(), response.status_text()),
        ));
    }
    Ok(response)
}

async fn get_text(url: &str) -> Result<String, LoadError> {
    let init = RequestInit::new();
    init.set_method("GET");
    let response = fetch(url, &init).await?;
    let text = JsFuture::from(response.text().map_err(|e| js_error(url, e))?)
        .await
        .map_err(|e| js_error(url, e))?;
    text.as_string()
        .ok_or_else(|| LoadError::network(url, "response body is not text"))
}

impl NodeSource for FetchSource {
    async fn fetch_record(&self, path: &str) -> Result<String, LoadError> {
        get_text(&self.endpoints.record_url(path, cache_bust())).await
    }

    async fn fetch_mesh(&self, path: &str, model: &str) -> Result<Vec<u8>, LoadError> {
        let url = self.endpoints.mesh_url(path, model, cache_bust());
        let init = RequestInit::new();
        init.set_method("GET");
        let response = fetch(&url, &init).await?;
        let buffer = JsFuture::from(response.array_buffer().map_err(|e| js_error(&url, e))?)
            .await
            .map_err(|e| js_error(&url, e))?;
        Ok(js_sys::Uint8Array::new(&buffer).to_vec())
    }

    async fn fetch_build_status(&self) -> Result<String, LoadError> {
        get_text(&self.endpoints.build_status_url()).await
    }

    async fn save_code(&self, path: &str, code: &str) -> Result<(), LoadError> {
        let url = self.endpoints.save_url(path);
        let headers = Headers::new().map_err(|e| js_error(&url, e))?;
        headers
            .set("Content-Type", "text/plain; charset=utf-8")
            .map_err(|e| js_error(&url, e))?;
        let init = RequestInit::new();
        init.set_method("POST");
        init.set_headers(&headers);
        init.set_body(&JsValue::from_str(code));
        fetch(&url, &init).await?;
        Ok(())
    }
}

/// The open push channel. Dropping it drops its callbacks.
struct Channel {
    socket: WebSocket,
    _on_open: Closure<dyn FnMut(JsValue)>,
    _on_message: Closure<dyn FnMut(MessageEvent)>,
    _on_close: Closure<dyn FnMut(CloseEvent)>,
}

impl Channel {
    fn shutdown(&self) {
        self.socket.set_onopen(None);
        self.socket.set_onmessage(None);
        self.socket.set_onclose(None);
        let _ = self.socket.close();
    }
}

struct ViewerContext {
    viewer: Viewer<SceneGraph, ErrorLog>,
    channel: Option<Channel>,
}

#[derive(Serialize)]
struct MeshPose<'a> {
    handle: MeshHandle,
    path: &'a str,
    /// Column-major model matrix.
    matrix: [f32; 16],
    visible: bool,
}

#[wasm_bindgen]
pub struct WasmViewer {
    inner: Rc<RefCell<ViewerContext>>,
    source: Rc<FetchSource>,
}

#[wasm_bindgen]
pub fn init_panic_hook() {
    console_error_panic_hook::set_once();
    let _ = console_log::init_with_level(log::Level::Info);
}

#[wasm_bindgen]
impl WasmViewer {
    /// `config_json` is a `ViewerConfig`; missing fields take their defaults.
    #[wasm_bindgen(constructor)]
    pub fn new(config_json: &str) -> Result<WasmViewer, JsValue> {
        init_panic_hook();
        let config: ViewerConfig = if config_json.trim().is_empty() {
            ViewerConfig::default()
        } else {
            serde_json::from_str(config_json)
                .map_err(|e| JsValue::from_str(&format!("Invalid viewer config: {}", e)))?
        };
        let source = FetchSource {
            endpoints: config.endpoints(""),
        };
        Ok(WasmViewer {
            inner: Rc::new(RefCell::new(ViewerContext {
                viewer: Viewer::new(config, SceneGraph::new(), ErrorLog::new()),
                channel: None,
            })),
            source: Rc::new(source),
        })
    }

    /// Load the tree and open the reload channel.
    pub fn start(&self) -> Result<(), JsValue> {
        self.inner.borrow_mut().viewer.set_watching(true);
        self.reload();
        connect(&self.inner, &self.source)
    }

    pub fn reload(&self) {
        spawn_local(reload(self.inner.clone(), self.source.clone()));
    }

    /// Close the reload channel. A reconnect already scheduled does nothing.
    pub fn stop(&self) {
        let mut context = self.inner.borrow_mut();
        context.viewer.set_watching(false);
        if let Some(channel) = context.channel.take() {
            channel.shutdown();
        }
    }

    /// Call from `requestAnimationFrame`. Returns true when poses changed.
    pub fn frame(&self, timestamp_ms: f64) -> bool {
        self.inner.borrow_mut().viewer.frame(timestamp_ms)
    }

    pub fn configure_animation(&self, frames_per_loop: u32, ticks_per_second: f64) {
        self.inner
            .borrow_mut()
            .viewer
            .configure_animation(frames_per_loop, ticks_per_second);
    }

    pub fn set_time(&self, time: f64) {
        self.inner.borrow_mut().viewer.set_time(time);
    }

    /// Mesh insertions and removals since the last call.
    pub fn take_scene_events_json(&self) -> String {
        let events = self.inner.borrow_mut().viewer.surface_mut().drain_events();
        serde_json::to_string(&events).unwrap_or_else(|_| "[]".to_string())
    }

    /// Interleaved position, normal and RGBA color, ten floats per vertex.
    pub fn mesh_vertices(&self, handle: u64) -> Vec<f32> {
        let inner = self.inner.borrow();
        inner
            .viewer
            .surface()
            .get(MeshHandle(handle))
            .map(|mesh| bytemuck::cast_slice::<_, f32>(mesh.asset.vertices.as_slice()).to_vec())
            .unwrap_or_default()
    }

    pub fn mesh_indices(&self, handle: u64) -> Vec<u32> {
        let inner = self.inner.borrow();
        inner
            .viewer
            .surface()
            .get(MeshHandle(handle))
            .map(|mesh| mesh.asset.indices.clone())
            .unwrap_or_default()
    }

    pub fn poses_json(&self) -> String {
        let inner = self.inner.borrow();
        let poses: Vec<MeshPose> = inner
            .viewer
            .surface()
            .meshes()
            .map(|(handle, mesh)| MeshPose {
                handle,
                path: &mesh.path,
                matrix: mesh.pose.matrix().as_mat4().to_cols_array(),
                visible: mesh.visible,
            })
            .collect();
        serde_json::to_string(&poses).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn tree_json(&self) -> Option<String> {
        let inner = self.inner.borrow();
        let tree = inner.viewer.tree()?;
        serde_json::to_string(&tree.root().summary()).ok()
    }

    /// Source text of the node at `path`, if the server sent it.
    pub fn node_code(&self, path: &str) -> Option<String> {
        let inner = self.inner.borrow();
        inner.viewer.tree()?.root().find(path)?.code.clone()
    }

    pub fn current_error(&self) -> Option<String> {
        self.inner.borrow().viewer.errors().current().map(str::to_string)
    }

    pub fn take_diagnostics_json(&self) -> String {
        let diagnostics = self.inner.borrow_mut().viewer.errors_mut().drain();
        serde_json::to_string(&diagnostics).unwrap_or_else(|_| "[]".to_string())
    }

    /// Resolves once the server accepted the code.
    pub fn save_code(&self, path: String, code: String) -> js_sys::Promise {
        let source = self.source.clone();
        future_to_promise(async move {
            save_code(source.as_ref(), &path, &code)
                .await
                .map(|_| JsValue::TRUE)
                .map_err(|e| JsValue::from_str(&e.to_string()))
        })
    }
}

async fn reload(inner: Rc<RefCell<ViewerContext>>, source: Rc<FetchSource>) {
    let (generation, context, root) = {
        let mut ctx = inner.borrow_mut();
        let generation = ctx.viewer.begin_load();
        let context = ctx.viewer.load_context(generation);
        (generation, context, ctx.viewer.config().root_path.clone())
    };

    let result = load_tree(source.as_ref(), &root, context).await;
    let requests = inner.borrow_mut().viewer.install_tree(generation, result);

    for request in requests {
        let inner = inner.clone();
        let source = source.clone();
        spawn_local(async move {
            let mesh = fetch_mesh_asset(source.as_ref(), &request).await;
            inner.borrow_mut().viewer.land_mesh(&request, mesh);
        });
    }
}

async fn check_build(inner: Rc<RefCell<ViewerContext>>, source: Rc<FetchSource>) {
    let status = match source.fetch_build_status().await {
        Ok(text) => decode_build_status(&text),
        Err(err) => Err(err),
    };
    let status = match status {
        Ok(status) => status,
        Err(err) => {
            log::error!("Build status check failed: {}", err);
            return;
        }
    };

    let should_reload = inner.borrow_mut().viewer.handle_build_status(&status);
    if should_reload {
        reload(inner, source).await;
    }
}

fn connect(inner: &Rc<RefCell<ViewerContext>>, source: &Rc<FetchSource>) -> Result<(), JsValue> {
    if !inner.borrow().viewer.is_watching() {
        log::debug!("Reload channel stopped, not connecting");
        return Ok(());
    }
    let window = web_sys::window().ok_or_else(|| JsValue::from_str("no window"))?;
    let href = window.location().href()?;
    let url = channel_url(&href, &inner.borrow().viewer.config().reload_channel_path)
        .map_err(|e| JsValue::from_str(&format!("Invalid page URL {}: {}", href, e)))?;

    let socket = match WebSocket::new(&url) {
        Ok(socket) => socket,
        Err(err) => {
            log::warn!("Cannot open {}: {:?}", url, err);
            channel_lost(inner, source);
            return Ok(());
        }
    };

    let on_open = {
        let inner = inner.clone();
        Closure::<dyn FnMut(JsValue)>::new(move |_: JsValue| {
            inner.borrow_mut().viewer.channel_opened();
        })
    };
    socket.set_onopen(Some(on_open.as_ref().unchecked_ref()));

    let on_message = {
        let inner = inner.clone();
        let source = source.clone();
        Closure::<dyn FnMut(MessageEvent)>::new(move |event: MessageEvent| {
            let Some(text) = event.data().as_string() else {
                return;
            };
            if inner.borrow().viewer.handle_push(&text) {
                spawn_local(check_build(inner.clone(), source.clone()));
            }
        })
    };
    socket.set_onmessage(Some(on_message.as_ref().unchecked_ref()));

    let on_close = {
        let inner = inner.clone();
        let source = source.clone();
        Closure::<dyn FnMut(CloseEvent)>::new(move |_event: CloseEvent| {
            channel_lost(&inner, &source);
        })
    };
    socket.set_onclose(Some(on_close.as_ref().unchecked_ref()));

    log::info!("Watching {}", url);
    let previous = inner.borrow_mut().channel.replace(Channel {
        socket,
        _on_open: on_open,
        _on_message: on_message,
        _on_close: on_close,
    });
    if let Some(previous) = previous {
        previous.shutdown();
    }
    Ok(())
}

fn channel_lost(inner: &Rc<RefCell<ViewerContext>>, source: &Rc<FetchSource>) {
    match inner.borrow_mut().viewer.channel_closed() {
        Reconnect::Retry(delay) => schedule_reconnect(inner.clone(), source.clone(), delay),
        Reconnect::GiveUp => log::error!("Reload channel offline"),
        Reconnect::Stopped => {}
    }
}

fn schedule_reconnect(inner: Rc<RefCell<ViewerContext>>, source: Rc<FetchSource>, delay: Duration) {
    let Some(window) = web_sys::window() else {
        return;
    };
    // The old channel is replaced from the timer, never from inside its own callback.
    let callback = Closure::once_into_js(move || {
        if let Err(err) = connect(&inner, &source) {
            log::error!("Reconnect failed: {:?}", err);
        }
    });
    let millis = delay.as_millis().min(i32::MAX as u128) as i32;
    if let Err(err) = window.set_timeout_with_callback_and_timeout_and_arguments_0(callback.unchecked_ref(), millis) {
        log::error!("Cannot schedule reconnect: {:?}", err);
    }
}
