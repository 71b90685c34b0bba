use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("conflict with existing route")]
    Conflict,

    #[error("invalid subnet: {0}")]
    InvalidSubnet(String),

    #[error("invalid prefix: {0}")]
    InvalidPrefix(String),

    #[error("invalid mac address: {0}")]
    InvalidMac(String),

    #[error("native bridge error: {0}")]
    Native(String),

    #[error("bridge index out of range: {0}")]
    IndexOutOfRange(usize),

    #[error("route table error: {0}")]
    RouteTable(String),

    #[error("route monitor closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<nix::Error> for BridgeError {
    fn from(e: nix::Error) -> Self {
        BridgeError::Io(std::io::Error::from(e))
    }
}
