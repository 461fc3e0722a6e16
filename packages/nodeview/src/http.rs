//! Blocking HTTP node source for native builds.

use crate::loader::{Endpoints, LoadError, NodeSource};

/// Largest model file accepted.
const MAX_MESH_BYTES: u64 = 256 * 1024 * 1024;

pub struct HttpSource {
    endpoints: Endpoints,
}

impl HttpSource {
    pub fn new(endpoints: Endpoints) -> Self {
        Self { endpoints }
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    fn get_text(&self, url: &str) -> Result<String, LoadError> {
        log::debug!("GET {}", url);
        ureq::get(url)
            .call()
            .map_err(|e| LoadError::network(url, e))?
            .into_body()
            .read_to_string()
            .map_err(|e| LoadError::network(url, e))
    }
}

/// Cache-bust marker: wall clock milliseconds.
fn cache_bust() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl NodeSource for HttpSource {
    async fn fetch_record(&self, path: &str) -> Result<String, LoadError> {
        self.get_text(&self.endpoints.record_url(path, cache_bust()))
    }

    async fn fetch_mesh(&self, path: &str, model: &str) -> Result<Vec<u8>, LoadError> {
        let url = self.endpoints.mesh_url(path, model, cache_bust());
        log::debug!("GET {}", url);
        ureq::get(&url)
            .call()
            .map_err(|e| LoadError::network(&url, e))?
            .into_body()
            .with_config()
            .limit(MAX_MESH_BYTES)
            .read_to_vec()
            .map_err(|e| LoadError::network(&url, e))
    }

    async fn fetch_build_status(&self) -> Result<String, LoadError> {
        self.get_text(&self.endpoints.build_status_url())
    }

    async fn save_code(&self, path: &str, code: &str) -> Result<(), LoadError> {
        let url = self.endpoints.save_url(path);
        log::debug!("POST {}", url);
        ureq::post(&url)
            .header("Content-Type", "text/plain; charset=utf-8")
            .send(code)
            .map_err(|e| LoadError::network(&url, e))?;
        Ok(())
    }
}
