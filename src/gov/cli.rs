use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "govmaster", version, about = "process governor and job supervisor daemon")]
pub struct Args {
    /// Path to master config YAML
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    pub config: PathBuf,
}
