use ross_bridge::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("network stack setup failed: {0}")]
    Setup(String),

    #[error("conflict with existing route")]
    Conflict,

    #[error("bridge already exists")]
    BridgeExists,

    #[error("bridges disabled")]
    BridgesDisabled,

    #[error("bridge not found")]
    BridgeNotFound,

    #[error("invalid subnet: {0}")]
    InvalidSubnet(String),

    #[error("forward already exists: {0}")]
    DuplicateForward(String),

    #[error("forward not found: {0}")]
    UnknownForward(String),

    #[error("invalid proxy: {0}")]
    InvalidProxy(String),

    #[error("invalid forward spec: {0}")]
    InvalidForwardSpec(String),

    #[error("guest unreachable: {0}")]
    GuestUnreachable(String),

    #[error("nat flow already exists: {0}")]
    DuplicateFlow(String),

    #[error("no free nat port")]
    PortsExhausted,

    #[error("network closed")]
    Closed,

    #[error("cancelled")]
    Cancelled,

    #[error("timed out")]
    Timeout,

    #[error("bridge error: {0}")]
    Bridge(BridgeError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<BridgeError> for NetError {
    fn from(e: BridgeError) -> Self {
        match e {
            BridgeError::Conflict => NetError::Conflict,
            BridgeError::InvalidSubnet(s) => NetError::InvalidSubnet(s),
            other => NetError::Bridge(other),
        }
    }
}

impl From<nix::Error> for NetError {
    fn from(e: nix::Error) -> Self {
        NetError::Io(std::io::Error::from(e))
    }
}

impl From<tokio::time::error::Elapsed> for NetError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        NetError::Timeout
    }
}
