pub mod vtysh;

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use async_trait::async_trait;

use crate::{Error, Result};

/// Canonical `<ip>/<len>` announcement key. VIPs are always host routes:
/// `/32` for IPv4, `/128` for IPv6.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Prefix {
    ip: IpAddr,
    len: u8,
}

impl Prefix {
    pub fn host(ip: IpAddr) -> Self {
        let len = match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Self { ip, len }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn prefix_len(&self) -> u8 {
        self.len
    }

    pub fn family(&self) -> IpFamily {
        match self.ip {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.len)
    }
}

impl FromStr for Prefix {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((ip, len)) = s.split_once('/') else {
            return Err(Error::PrefixParse(s.into()));
        };
        let ip: IpAddr = ip.parse().map_err(|_| Error::PrefixParse(s.into()))?;
        let len: u8 = len.parse().map_err(|_| Error::PrefixParse(s.into()))?;
        let max = match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if len > max {
            return Err(Error::PrefixParse(s.into()));
        }
        Ok(Self { ip, len })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpFamily::V4 => "ipv4",
            IpFamily::V6 => "ipv6",
        }
    }
}

/// Control channel to the local BGP speaker. The production implementation
/// drives vtysh; tests substitute an in-memory fake.
#[async_trait]
pub trait Speaker: Send + Sync {
    /// Instruct the speaker to originate `prefix`. Re-announcing an
    /// already-announced prefix is a no-op success.
    async fn announce(&self, prefix: &Prefix) -> Result<()>;

    /// Instruct the speaker to stop originating `prefix`. Idempotent.
    async fn withdraw(&self, prefix: &Prefix) -> Result<()>;

    /// Best-effort view of the prefixes the speaker currently originates.
    async fn list_announced(&self) -> Result<BTreeSet<Prefix>>;
}
