pub mod agent;
pub mod config;
pub mod controller;
pub mod frr;
pub mod http;
pub mod kubernetes;
pub mod metrics;

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),

    #[error("kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("kube config inference error: {0}")]
    InferConfig(#[from] kube::config::InferConfigError),

    #[error("failed to create store: {0}")]
    StoreCreation(String),

    #[error("vtysh path must be absolute: {0}")]
    VtyshPathNotAbsolute(String),

    #[error("vtysh path not in allowlist: {0}")]
    VtyshPathNotAllowed(String),

    #[error("unsafe characters in vtysh command: {0:?}")]
    UnsafeCommand(String),

    #[error("vtysh exited with status {status}: stdout={stdout:?} stderr={stderr:?}")]
    VtyshFailed {
        status: i32,
        stdout: String,
        stderr: String,
    },

    #[error("vtysh timed out after {0:?}")]
    VtyshTimeout(Duration),

    #[error("invalid prefix {0:?}")]
    PrefixParse(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
