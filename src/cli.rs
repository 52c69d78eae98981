use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Verbosity {
    Silent,
    Normal,
    Loud,
}

impl Verbosity {
    pub fn default_filter(self) -> &'static str {
        match self {
            Self::Silent => "error",
            Self::Normal => "warn",
            Self::Loud => "debug",
        }
    }
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "mmp-ops",
    version,
    about = "Operations tool for the Manage My Prison application on Cloud Platform."
)]
pub struct CliArgs {
    /// Logging level; loud also prints full error details
    #[arg(long, value_enum, global = true, default_value_t = Verbosity::Normal)]
    pub verbosity: Verbosity,

    /// tracing filter (for example: info,mmp_ops=debug)
    #[arg(long, global = true)]
    pub log_filter: Option<String>,

    /// Settings file (defaults to $MMP_OPS_CONFIG, ./mmp-ops.yaml, ~/.config/mmp-ops/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

impl CliArgs {
    pub fn log_filter(&self) -> &str {
        self.log_filter
            .as_deref()
            .unwrap_or(self.verbosity.default_filter())
    }
}
