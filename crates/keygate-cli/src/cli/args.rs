use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::logging::LogFormat;

#[derive(Parser)]
#[command(
    name = "keygate",
    version,
    about = "Verify container image cosign signatures against public keys kept in a Kubernetes secret"
)]
pub struct Cli {
    /// Log line format (logs go to stderr)
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text, env = "KEYGATE_LOG_FORMAT")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Verify the configured image against every key in the secret
    Verify(VerifyArgs),
    /// List the keys decoded from the secret or a PEM file
    Keys(KeysArgs),
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Verification config (cosignConfig.yaml)
    #[arg(long, short)]
    pub config: PathBuf,

    /// Kubeconfig to read the key secret with (overrides config and KEYGATE_KUBECONFIG)
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Read keys from a local PEM file instead of the cluster secret
    #[arg(long)]
    pub key_file: Option<PathBuf>,

    /// Overall budget in seconds (overrides timeoutSecs)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Budget per key attempt in seconds (overrides attemptTimeoutSecs)
    #[arg(long)]
    pub attempt_timeout: Option<u64>,

    /// Report a failed verification but exit 0
    #[arg(long)]
    pub warn_only: bool,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

#[derive(Args, Debug)]
pub struct KeysArgs {
    /// Verification config naming the key secret
    #[arg(long, short, required_unless_present = "key_file", conflicts_with = "key_file")]
    pub config: Option<PathBuf>,

    /// Local PEM file
    #[arg(long)]
    pub key_file: Option<PathBuf>,

    /// Kubeconfig to read the key secret with
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}
