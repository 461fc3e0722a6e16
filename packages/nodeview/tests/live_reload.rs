//! Build-notification handling against an in-memory server.
//!
//! Run with: cargo test --test live_reload

use nodeview::diagnostics::{DiagnosticKind, ErrorLog};
use nodeview::loader::MemorySource;
use nodeview::scene_graph::SceneGraph;
use nodeview::viewer::{Viewer, ViewerConfig};

fn server() -> MemorySource {
    let mut source = MemorySource::new();
    source.insert_record(
        "/part",
        r#"{"type": "Assembly", "name": "part", "children": [], "operations": []}"#,
    );
    source
}

fn viewer() -> Viewer<SceneGraph, ErrorLog> {
    let config = ViewerConfig {
        root_path: "/part".to_string(),
        ..Default::default()
    };
    Viewer::new(config, SceneGraph::new(), ErrorLog::new())
}

fn root_loads(source: &MemorySource) -> usize {
    source.requests().iter().filter(|p| p.as_str() == "/part").count()
}

/// Deliver one push message the way the browser binding does.
fn notify(viewer: &mut Viewer<SceneGraph, ErrorLog>, source: &MemorySource, message: &str) -> bool {
    if !viewer.handle_push(message) {
        return false;
    }
    pollster::block_on(viewer.sync_with(source)).unwrap()
}

#[test]
fn test_one_reload_per_clean_notification() {
    let source = server();
    let mut viewer = viewer();
    pollster::block_on(viewer.reload_with(&source)).unwrap();
    assert_eq!(root_loads(&source), 1);

    for expected in 2..=4 {
        assert!(notify(&mut viewer, &source, "reload"));
        assert_eq!(root_loads(&source), expected);
    }
    assert_eq!(viewer.generation().0, 4);
}

#[test]
fn test_other_messages_are_ignored() {
    let source = server();
    let mut viewer = viewer();
    assert!(!notify(&mut viewer, &source, "hello"));
    assert_eq!(root_loads(&source), 0);
}

#[test]
fn test_build_error_is_shown_once() {
    let source = server();
    let mut viewer = viewer();
    pollster::block_on(viewer.reload_with(&source)).unwrap();

    source.set_build_status(r#"{"error": "line 3: syntax error", "tstamp": 42.0}"#);
    assert!(!notify(&mut viewer, &source, "reload"));
    assert_eq!(viewer.errors().current(), Some("line 3: syntax error"));
    assert_eq!(root_loads(&source), 1);
    // The old tree stays on screen.
    assert!(viewer.tree().is_some());

    // Same failed build again: the error is cleared and the tree reloaded.
    assert!(notify(&mut viewer, &source, "reload"));
    assert_eq!(viewer.errors().current(), None);
    assert_eq!(root_loads(&source), 2);

    // A new failure is shown again.
    source.set_build_status(r#"{"error": "line 9: unknown module", "tstamp": 43.0}"#);
    assert!(!notify(&mut viewer, &source, "reload"));
    assert_eq!(viewer.errors().current(), Some("line 9: unknown module"));

    source.set_build_status(r#"{"error": "", "tstamp": 44.0}"#);
    assert!(notify(&mut viewer, &source, "reload"));
    assert_eq!(viewer.errors().current(), None);
}

#[test]
fn test_malformed_status_is_an_error() {
    let source = server();
    let mut viewer = viewer();
    source.set_build_status("<html>502</html>");
    assert!(pollster::block_on(viewer.sync_with(&source)).is_err());
    assert_eq!(root_loads(&source), 0);
}

#[test]
fn test_expression_errors_reported_once_per_tree() {
    let mut source = MemorySource::new();
    source.insert_record(
        "/part",
        r#"{"type": "Assembly", "name": "part", "children": ["bolt"],
            "operations": [["r", "lookup($t, 1)", [0, 0, 1]]]}"#,
    );
    source.insert_record(
        "/part/bolt",
        r#"{"type": "Assembly", "name": "bolt", "children": [], "operations": []}"#,
    );

    let mut viewer = viewer();
    viewer.configure_animation(10, 0.0);
    pollster::block_on(viewer.reload_with(&source)).unwrap();
    for _ in 0..20 {
        viewer.step();
    }

    // One diagnostic per affected node, not per tick.
    let diagnostics = viewer.errors_mut().drain();
    assert_eq!(diagnostics.len(), 2);
    assert!(diagnostics.iter().all(|d| d.kind == DiagnosticKind::Expression));

    // A new tree is a new generation and reports again.
    pollster::block_on(viewer.reload_with(&source)).unwrap();
    assert_eq!(viewer.errors_mut().drain().len(), 2);
}
