use clap::Parser;

/// OpenAI-compatible tool-calling gateway for local inference backends.
#[derive(Debug, Parser)]
#[command(name = "toolgate", version)]
pub struct Args {
    /// Log filter string, e.g. "info" or "gateway=debug,ragdocs=debug".
    #[arg(long, env = "TOOLGATE_LOG", default_value = "info")]
    pub log: String,

    /// Load and validate the configuration, then exit.
    #[arg(long)]
    pub config_check: bool,
}
