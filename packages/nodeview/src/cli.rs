use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use crate::diagnostics::ErrorLog;
use crate::http::HttpSource;
use crate::loader::{decode_build_status, load_tree, NodeSource};
use crate::node::Generation;
use crate::scene_graph::SceneGraph;
use crate::viewer::{save_code, Viewer, ViewerConfig};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Origin of the model server
    #[arg(long, global = true, default_value = "http://localhost:8000")]
    server: String,

    /// Viewer configuration as JSON
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Root node path (overrides the configuration)
    #[arg(long, global = true)]
    root: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the node tree and print it as JSON
    Tree,

    /// Load the tree and its meshes, run the animation and print mesh poses
    Animate {
        /// Frames in one animation loop
        #[arg(long, default_value_t = 24)]
        frames: u32,

        /// Number of ticks to run
        #[arg(long, default_value_t = 1)]
        ticks: u32,
    },

    /// Print the current build status
    Status,

    /// Upload a file as the source code of a node
    Save {
        /// Node path
        #[arg(long)]
        path: String,

        /// File holding the new code
        #[arg(long)]
        file: PathBuf,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            serde_json::from_str::<ViewerConfig>(&text)
                .with_context(|| format!("Invalid config {}", path.display()))?
        }
        None => ViewerConfig::default(),
    };
    if let Some(root) = cli.root {
        config.root_path = root;
    }
    let source = HttpSource::new(config.endpoints(&cli.server));

    match cli.command {
        Commands::Tree => pollster::block_on(print_tree(&source, &config)),
        Commands::Animate { frames, ticks } => pollster::block_on(animate(&source, config, frames, ticks)),
        Commands::Status => pollster::block_on(print_status(&source)),
        Commands::Save { path, file } => {
            let code = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            pollster::block_on(save_code(&source, &path, &code))?;
            println!("Saved {} to {}", file.display(), path);
            Ok(())
        }
    }
}

async fn print_tree(source: &HttpSource, config: &ViewerConfig) -> Result<()> {
    let context = crate::node::Context::new(Generation(1), 0.0);
    let loaded = load_tree(source, &config.root_path, context).await?;
    for diagnostic in &loaded.diagnostics {
        eprintln!("warning: {}", diagnostic);
    }
    println!("{}", serde_json::to_string_pretty(&loaded.tree.root().summary())?);
    Ok(())
}

async fn animate(source: &HttpSource, config: ViewerConfig, frames: u32, ticks: u32) -> Result<()> {
    let mut viewer = Viewer::new(config, SceneGraph::new(), ErrorLog::new());
    viewer.configure_animation(frames, 0.0);
    viewer.reload_with(source).await?;

    for _ in 0..ticks {
        viewer.step();
    }

    for diagnostic in viewer.errors_mut().drain() {
        eprintln!("warning: {}", diagnostic);
    }

    let poses: Vec<_> = viewer
        .surface()
        .meshes()
        .map(|(handle, mesh)| {
            json!({
                "handle": handle,
                "path": mesh.path,
                "position": mesh.pose.position.to_array(),
                "orientation": mesh.pose.orientation.to_array(),
                "triangles": mesh.asset.triangle_count(),
            })
        })
        .collect();
    let output = json!({ "time": viewer.animator().time(), "meshes": poses });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn print_status(source: &HttpSource) -> Result<()> {
    let status = decode_build_status(&source.fetch_build_status().await?)?;
    if status.is_clean() {
        println!("Build OK (tstamp {})", status.tstamp);
    } else {
        println!("Build failed (tstamp {}):\n{}", status.tstamp, status.error);
    }
    Ok(())
}
