use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::frr::{IpFamily, Prefix, Speaker};
use crate::{Error, Result};

/// Binaries the driver is allowed to execute.
const VTYSH_ALLOWLIST: &[&str] = &["/usr/bin/vtysh", "/sbin/vtysh", "/usr/sbin/vtysh"];

/// Wall-clock bound for a single vtysh invocation.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Programs the local FRR speaker through its vtysh CLI. Each announce or
/// withdraw is a single invocation entering `configure terminal`.
pub struct Vtysh {
    bin: PathBuf,
    asn: u32,
    ensure_static: bool,
}

impl Vtysh {
    pub fn new(bin: &Path, asn: u32, ensure_static: bool) -> Result<Self> {
        if !bin.is_absolute() {
            return Err(Error::VtyshPathNotAbsolute(bin.display().to_string()));
        }
        if !VTYSH_ALLOWLIST.iter().any(|allowed| Path::new(allowed) == bin) {
            return Err(Error::VtyshPathNotAllowed(bin.display().to_string()));
        }
        Ok(Self {
            bin: bin.to_path_buf(),
            asn,
            ensure_static,
        })
    }

    fn announce_commands(&self, prefix: &Prefix) -> Vec<String> {
        let mut cmds = Vec::new();
        if self.ensure_static {
            cmds.push(format!(
                "{} route {} Null0",
                route_keyword(prefix.family()),
                prefix
            ));
        }
        cmds.extend(self.network_commands(prefix, ""));
        cmds
    }

    fn withdraw_commands(&self, prefix: &Prefix) -> Vec<String> {
        let mut cmds = self.network_commands(prefix, "no ");
        if self.ensure_static {
            cmds.push(format!(
                "no {} route {} Null0",
                route_keyword(prefix.family()),
                prefix
            ));
        }
        cmds
    }

    fn network_commands(&self, prefix: &Prefix, no: &str) -> Vec<String> {
        vec![
            format!("router bgp {}", self.asn),
            format!(" address-family {} unicast", prefix.family().as_str()),
            format!("  {no}network {prefix}"),
            " exit-address-family".to_string(),
        ]
    }

    async fn configure(&self, cmds: &[String]) -> Result<()> {
        let mut args: Vec<&str> = vec!["-c", "configure terminal"];
        for cmd in cmds {
            // Commands are assembled from parsed IPs and an integer ASN, so
            // an unsafe payload here is a programming error.
            debug_assert!(command_is_safe(cmd), "generated unsafe command {cmd:?}");
            if !command_is_safe(cmd) {
                return Err(Error::UnsafeCommand(cmd.clone()));
            }
            args.push("-c");
            args.push(cmd.as_str());
        }
        self.exec(&args).await.map(|_| ())
    }

    async fn exec(&self, args: &[&str]) -> Result<String> {
        debug!("running {} {:?}", self.bin.display(), args);
        let output = tokio::time::timeout(
            COMMAND_TIMEOUT,
            Command::new(&self.bin).args(args).kill_on_drop(true).output(),
        )
        .await
        .map_err(|_| Error::VtyshTimeout(COMMAND_TIMEOUT))??;

        if !output.status.success() {
            return Err(Error::VtyshFailed {
                status: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Speaker for Vtysh {
    async fn announce(&self, prefix: &Prefix) -> Result<()> {
        self.configure(&self.announce_commands(prefix)).await
    }

    async fn withdraw(&self, prefix: &Prefix) -> Result<()> {
        self.configure(&self.withdraw_commands(prefix)).await
    }

    async fn list_announced(&self) -> Result<BTreeSet<Prefix>> {
        let config = self.exec(&["-c", "show running-config"]).await?;
        Ok(parse_network_statements(&config))
    }
}

fn route_keyword(family: IpFamily) -> &'static str {
    match family {
        IpFamily::V4 => "ip",
        IpFamily::V6 => "ipv6",
    }
}

fn command_is_safe(cmd: &str) -> bool {
    !cmd.is_empty()
        && cmd.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, ' ' | '/' | '.' | ':' | ',' | '-' | '_')
        })
}

/// Pulls `network <prefix>` statements out of a running-config dump. Lines
/// that fail to parse are skipped.
fn parse_network_statements(config: &str) -> BTreeSet<Prefix> {
    config
        .lines()
        .filter_map(|line| line.trim().strip_prefix("network "))
        .filter_map(|rest| rest.trim().parse().ok())
        .collect()
}
