use clap::{Parser, Subcommand};

/// Sidekick — transparent Anthropic API proxy with usage analytics
#[derive(Parser)]
#[command(name = "sidekick", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the proxy server
    Serve {
        /// Port to bind (overrides PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },
}
