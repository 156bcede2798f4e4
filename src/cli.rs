use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "gatemini-core", version, about = "MCP aggregating proxy engine")]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "config/gatemini.yaml")]
    pub config: PathBuf,
}
