//! Error surfacing for the viewer.
//!
//! Two channels exist. The *banner* is the single current build error shown
//! over the scene ([`ErrorSink::set_error`] / [`ErrorSink::clear_error`]).
//! Everything else is a non-fatal [`Diagnostic`], a stable JSON-serializable
//! record the UI can list without access to Rust logs.

use std::collections::VecDeque;

use serde::Serialize;

use crate::expression::ExprError;
use crate::loader::LoadError;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// A transform expression failed to parse or evaluate.
    Expression,
    /// A mesh could not be fetched or decoded.
    Mesh,
    /// A node record could not be loaded.
    Load,
    /// The build process reported an error.
    Build,
    /// The push channel gave up reconnecting.
    Offline,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// Path of the node concerned, when there is one.
    pub path: Option<String>,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, path: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn expression(path: &str, err: &ExprError) -> Self {
        Self::new(DiagnosticKind::Expression, Some(path), err.to_string())
    }

    pub fn mesh(path: &str, err: &LoadError) -> Self {
        Self::new(DiagnosticKind::Mesh, Some(path), err.to_string())
    }

    pub fn load(path: &str, err: &LoadError) -> Self {
        Self::new(DiagnosticKind::Load, Some(path), err.to_string())
    }

    pub fn offline(message: impl Into<String>) -> Self {
        Self::new(DiagnosticKind::Offline, None, message)
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{}: {}", path, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Where errors go. Threaded explicitly through every tree walk.
pub trait ErrorSink {
    /// Show `message` as the current error, replacing any previous one.
    fn set_error(&mut self, message: &str);

    fn clear_error(&mut self);

    /// Record a non-fatal diagnostic.
    fn report(&mut self, diagnostic: &Diagnostic) {
        log::warn!("{}", diagnostic);
    }
}

/// Default capacity of [`ErrorLog`]'s diagnostic queue.
pub const MAX_QUEUED_DIAGNOSTICS: usize = 32;

/// In-memory sink: the current banner plus the most recent diagnostics.
#[derive(Debug)]
pub struct ErrorLog {
    current: Option<String>,
    diagnostics: VecDeque<Diagnostic>,
    capacity: usize,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::with_capacity(MAX_QUEUED_DIAGNOSTICS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            current: None,
            diagnostics: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn diagnostics(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter()
    }

    /// Take queued diagnostics, oldest first.
    pub fn drain(&mut self) -> Vec<Diagnostic> {
        self.diagnostics.drain(..).collect()
    }
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorSink for ErrorLog {
    fn set_error(&mut self, message: &str) {
        log::error!("{}", message);
        self.current = Some(message.to_string());
    }

    fn clear_error(&mut self) {
        self.current = None;
    }

    fn report(&mut self, diagnostic: &Diagnostic) {
        log::warn!("{}", diagnostic);
        if self.capacity == 0 {
            return;
        }
        if self.diagnostics.len() == self.capacity {
            self.diagnostics.pop_front();
        }
        self.diagnostics.push_back(diagnostic.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_banner_replaces_and_clears() {
        let mut log = ErrorLog::new();
        log.set_error("first");
        log.set_error("second");
        assert_eq!(log.current(), Some("second"));
        log.clear_error();
        assert_eq!(log.current(), None);
    }

    #[test]
    fn test_queue_is_bounded() {
        let mut log = ErrorLog::with_capacity(2);
        for i in 0..3 {
            log.report(&Diagnostic::new(DiagnosticKind::Mesh, Some("/a"), format!("m{i}")));
        }
        let messages: Vec<_> = log.drain().into_iter().map(|d| d.message).collect();
        assert_eq!(messages, vec!["m1", "m2"]);
        assert_eq!(log.diagnostics().count(), 0);
    }

    #[test]
    fn test_serialized_shape() {
        let d = Diagnostic::expression("/root/arm", &ExprError::UnknownFunction("cross".into()));
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["kind"], "expression");
        assert_eq!(json["path"], "/root/arm");
        assert_eq!(json["message"], d.message);
        assert_eq!(d.to_string(), format!("/root/arm: {}", d.message));
    }
}
