//! Command-line argument parsing.

use clap::Parser;

/// vmfleet daemon - keeps a fleet of hypervisor endpoints in sync
#[derive(Parser, Debug, Default)]
#[command(name = "vmfleetd")]
#[command(about = "vmfleet daemon - multi-server virtualization state engine")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long, env = "VMFLEET_CONFIG")]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Log output format (pretty, json)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,

    /// Extra endpoint as NAME=URI, connected at startup. Repeatable.
    #[arg(short, long = "endpoint", value_name = "NAME=URI")]
    pub endpoints: Vec<String>,

    /// Override connection.connect_timeout_secs
    #[arg(long)]
    pub connect_timeout: Option<u64>,

    /// Override stats.report_interval_secs (0 disables the reporter)
    #[arg(long)]
    pub stats_interval: Option<u64>,

    /// Enable development mode (mock hypervisors with demo data)
    #[arg(long)]
    pub dev: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    pub check_config: bool,
}
