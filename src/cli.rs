use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(
    name = "forgegate",
    version,
    about = "Load-balancing gateway for a pool of image/video generation backends"
)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "config/forgegate.yaml")]
    pub config: PathBuf,
}
