use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod client;

#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "Local container engine: supervise containers, pull and build images")]
#[command(version, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, env = "KEEL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Engine API address used by client commands
    #[arg(long, env = "KEEL_HOST", default_value = "http://127.0.0.1:2377")]
    pub host: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the engine and serve its API
    Serve {
        /// Listen address, overriding the config file
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// List containers
    Ps {
        /// Only containers in this status (`running`, `exited`, `Up 2 hours`...)
        #[arg(short, long)]
        status: Option<String>,
    },

    /// List images
    Images,

    /// Create and start a container
    Run {
        /// Image to run (`repository[:tag]` or id)
        image: String,

        /// Container name
        #[arg(short, long)]
        name: Option<String>,

        /// Port mappings (host:container[/proto])
        #[arg(short, long)]
        ports: Vec<String>,

        /// Environment variables (KEY=VALUE)
        #[arg(short, long)]
        env: Vec<String>,

        /// Restart policy: no, always, on-failure, unless-stopped
        #[arg(long)]
        restart: Option<String>,

        /// Memory limit (e.g. 256m)
        #[arg(short, long)]
        memory: Option<String>,

        /// Command to run instead of the image default
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Start stopped containers
    Start {
        /// Container IDs
        containers: Vec<String>,
    },

    /// Stop running containers
    Stop {
        /// Container IDs
        containers: Vec<String>,
    },

    /// Remove containers
    Rm {
        /// Container IDs
        containers: Vec<String>,
    },

    /// Pause running containers
    Pause {
        /// Container IDs
        containers: Vec<String>,
    },

    /// Resume paused containers
    Unpause {
        /// Container IDs
        containers: Vec<String>,
    },

    /// Show details of a container
    Inspect {
        /// Container ID
        container: String,
    },

    /// Pull an image
    Pull {
        /// Image reference (`repository[:tag]`)
        image: String,
    },

    /// Remove images
    Rmi {
        /// Image references or ids
        images: Vec<String>,
    },

    /// Build an image from a context directory
    Build {
        /// Path to build context
        #[arg(default_value = ".")]
        path: String,

        /// Image tag
        #[arg(short, long)]
        tag: String,
    },

    /// Run a command in a running container
    Exec {
        /// Container ID
        container: String,

        /// Command line
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Show container output
    Logs {
        /// Container ID
        container: String,

        /// Keep streaming new output
        #[arg(short, long)]
        follow: bool,
    },

    /// Engine statistics
    Stats,

    /// Stream change and progress events
    Events,
}
