pub mod clock;
pub mod config;
pub mod error;
pub mod lease;
pub mod options;
pub mod packet;
pub mod pool;
pub mod server;

pub use clock::{Clock, SharedClock, SystemClock};
pub use config::{Config, ConfiguredOption, OptionMode};
pub use error::{Error, Result};
pub use lease::{Lease, LeaseEvent, LeaseStatus, LeaseTable};
pub use options::{DhcpOption, MessageType, RelayAgentInformation};
pub use packet::DhcpPacket;
pub use pool::AddressPool;
pub use server::{DhcpServer, Status, Transport, UdpTransport};
