use std::net::Ipv4Addr;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed DHCP datagram: {0}")]
    Malformed(String),

    #[error("No lease recorded for {0}")]
    NotFound(String),

    #[error("A lease already exists for {0}")]
    AlreadyExists(String),

    #[error("Lease for {0} is static")]
    StaticViolation(String),

    #[error("Address {0} is held by another active lease")]
    Conflict(Ipv4Addr),

    #[error("No available addresses in pool")]
    PoolExhausted,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Socket error: {0}")]
    Socket(String),
}

pub type Result<T> = std::result::Result<T, Error>;
