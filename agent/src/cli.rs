//! Command-line surface: `tunnel-agent [flags] <port> [<port> ...]`.
//!
//! Each positional argument is parsed as a `u16`; clap already makes a
//! non-integer argument a fatal invocation error (its own exit code is
//! remapped to 1 by `main`).

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "tunnel-agent", about = "Expose local ports through the tunnel edge")]
pub struct Cli {
    /// Local TCP ports to register and expose, e.g. `tunnel-agent 3000 8080`.
    #[arg(required = true)]
    pub ports: Vec<u16>,

    /// Edge base URL. Overrides `WORKER_URL` when given explicitly.
    #[arg(long)]
    pub worker_url: Option<String>,

    /// Path to the optional plugin config file.
    #[arg(long)]
    pub config: Option<std::path::PathBuf>,
}

/// Default edge base URL when neither `--worker-url` nor `WORKER_URL` is set.
pub const DEFAULT_WORKER_URL: &str = "https://tunnel.example.dev";

impl Cli {
    pub fn resolve_worker_url(&self) -> String {
        self.worker_url
            .clone()
            .or_else(|| std::env::var("WORKER_URL").ok())
            .unwrap_or_else(|| DEFAULT_WORKER_URL.to_string())
    }
}
