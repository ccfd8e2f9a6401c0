use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    Agent(AgentArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct AgentArgs {
    /// Name of the node this agent announces from
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// Autonomous system number of the local FRR speaker
    #[arg(long, env = "BGP_ASN", default_value_t = 65001)]
    pub bgp_asn: u32,

    /// Install a Null0 static for each VIP so bgpd has an origin to redistribute
    #[arg(long, env = "FRR_ENSURE_STATIC", default_value_t = true, action = ArgAction::Set)]
    pub frr_ensure_static: bool,

    /// Path to the vtysh binary
    #[arg(long, env = "VTYSH_PATH", default_value = "/usr/bin/vtysh")]
    pub vtysh_path: PathBuf,

    /// Upper bound in seconds on watch age before the streams re-list
    #[arg(long, default_value_t = 300)]
    pub resync_seconds: u32,

    /// Seconds between periodic reconciles when no events arrive
    #[arg(long, default_value_t = 30)]
    pub loop_interval_seconds: u64,

    /// Path to a kubeconfig; in-cluster configuration is used when unset
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Health and metrics listener
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub health_address: SocketAddr,
}
