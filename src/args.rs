use clap::Parser;
use std::path::PathBuf;

use roomlink::config;

#[derive(Parser, Debug)]
#[command(name = "roomlink")]
#[command(author = "Roomlink Team")]
#[command(version = "0.1.0")]
#[command(about = "WebRTC media room client", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/roomlink.toml")]
    pub config: PathBuf,

    /// Room server WebSocket URL (overrides config)
    #[arg(short, long)]
    pub server: Option<String>,

    /// Room to join
    #[arg(short, long)]
    pub room: String,

    /// Participant name
    #[arg(short, long)]
    pub user: String,

    /// Ask the server to loop the published stream back
    #[arg(long, action)]
    pub loopback: bool,

    /// Join without announcing a webcam
    #[arg(long, action)]
    pub no_webcam: bool,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }
}
