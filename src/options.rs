use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const SUB_OPTION_CIRCUIT_ID: u8 = 1;
const SUB_OPTION_REMOTE_ID: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    Pad = 0,
    SubnetMask = 1,
    Router = 3,
    DnsServer = 6,
    HostName = 12,
    DomainName = 15,
    BroadcastAddress = 28,
    RequestedIpAddress = 50,
    LeaseTime = 51,
    MessageType = 53,
    ServerIdentifier = 54,
    ParameterRequestList = 55,
    MaximumMessageSize = 57,
    RenewalTime = 58,
    RebindingTime = 59,
    ClientIdentifier = 61,
    RelayAgentInformation = 82,
    End = 255,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pad),
            1 => Ok(Self::SubnetMask),
            3 => Ok(Self::Router),
            6 => Ok(Self::DnsServer),
            12 => Ok(Self::HostName),
            15 => Ok(Self::DomainName),
            28 => Ok(Self::BroadcastAddress),
            50 => Ok(Self::RequestedIpAddress),
            51 => Ok(Self::LeaseTime),
            53 => Ok(Self::MessageType),
            54 => Ok(Self::ServerIdentifier),
            55 => Ok(Self::ParameterRequestList),
            57 => Ok(Self::MaximumMessageSize),
            58 => Ok(Self::RenewalTime),
            59 => Ok(Self::RebindingTime),
            61 => Ok(Self::ClientIdentifier),
            82 => Ok(Self::RelayAgentInformation),
            255 => Ok(Self::End),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Decline => write!(f, "DECLINE"),
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
            Self::Release => write!(f, "RELEASE"),
            Self::Inform => write!(f, "INFORM"),
        }
    }
}

/// Relay Agent Information option (82), RFC 3046.
///
/// Sub-options 1 (circuit id) and 2 (remote id) are surfaced; everything
/// else is skipped during parsing, but the raw value is kept so replies
/// echo the option byte-identically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayAgentInformation {
    pub circuit_id: Option<Vec<u8>>,
    pub remote_id: Option<Vec<u8>>,
    raw: Vec<u8>,
}

impl RelayAgentInformation {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut circuit_id = None;
        let mut remote_id = None;
        let mut index = 0;

        while index < data.len() {
            let code = data[index];
            let Some(&length) = data.get(index + 1) else {
                return Err(Error::Malformed(
                    "relay sub-option length missing".to_string(),
                ));
            };
            let length = length as usize;

            if index + 2 + length > data.len() {
                return Err(Error::Malformed(
                    "relay sub-option overruns option value".to_string(),
                ));
            }

            let value = &data[index + 2..index + 2 + length];
            match code {
                SUB_OPTION_CIRCUIT_ID => circuit_id = Some(value.to_vec()),
                SUB_OPTION_REMOTE_ID => remote_id = Some(value.to_vec()),
                _ => {}
            }

            index += 2 + length;
        }

        Ok(Self {
            circuit_id,
            remote_id,
            raw: data.to_vec(),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DhcpOption {
    SubnetMask(Ipv4Addr),
    Router(Vec<Ipv4Addr>),
    DnsServer(Vec<Ipv4Addr>),
    HostName(String),
    DomainName(String),
    BroadcastAddress(Ipv4Addr),
    RequestedIpAddress(Ipv4Addr),
    LeaseTime(u32),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    ParameterRequestList(Vec<u8>),
    MaximumMessageSize(u16),
    RenewalTime(u32),
    RebindingTime(u32),
    ClientIdentifier(Vec<u8>),
    RelayAgentInformation(RelayAgentInformation),
    Unknown(u8, Vec<u8>),
}

fn single_addr(code: OptionCode, data: &[u8]) -> Result<Ipv4Addr> {
    if data.len() != 4 {
        return Err(Error::Malformed(format!(
            "option {} expects 4 bytes, got {}",
            code as u8,
            data.len()
        )));
    }
    Ok(Ipv4Addr::new(data[0], data[1], data[2], data[3]))
}

fn addr_list(code: OptionCode, data: &[u8]) -> Result<Vec<Ipv4Addr>> {
    if data.len() % 4 != 0 || data.is_empty() {
        return Err(Error::Malformed(format!(
            "option {} expects a multiple of 4 bytes, got {}",
            code as u8,
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(4)
        .map(|chunk| Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]))
        .collect())
}

fn be_u32(code: OptionCode, data: &[u8]) -> Result<u32> {
    if data.len() != 4 {
        return Err(Error::Malformed(format!(
            "option {} expects 4 bytes, got {}",
            code as u8,
            data.len()
        )));
    }
    Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

impl DhcpOption {
    pub fn parse(code: u8, data: &[u8]) -> Result<Self> {
        match OptionCode::try_from(code) {
            Ok(OptionCode::SubnetMask) => {
                Ok(Self::SubnetMask(single_addr(OptionCode::SubnetMask, data)?))
            }
            Ok(OptionCode::Router) => Ok(Self::Router(addr_list(OptionCode::Router, data)?)),
            Ok(OptionCode::DnsServer) => {
                Ok(Self::DnsServer(addr_list(OptionCode::DnsServer, data)?))
            }
            Ok(OptionCode::HostName) => {
                Ok(Self::HostName(String::from_utf8_lossy(data).to_string()))
            }
            Ok(OptionCode::DomainName) => {
                Ok(Self::DomainName(String::from_utf8_lossy(data).to_string()))
            }
            Ok(OptionCode::BroadcastAddress) => Ok(Self::BroadcastAddress(single_addr(
                OptionCode::BroadcastAddress,
                data,
            )?)),
            Ok(OptionCode::RequestedIpAddress) => Ok(Self::RequestedIpAddress(single_addr(
                OptionCode::RequestedIpAddress,
                data,
            )?)),
            Ok(OptionCode::LeaseTime) => Ok(Self::LeaseTime(be_u32(OptionCode::LeaseTime, data)?)),
            Ok(OptionCode::MessageType) => {
                if data.len() != 1 {
                    return Err(Error::Malformed("invalid message type length".to_string()));
                }
                let message_type = MessageType::try_from(data[0]).map_err(|value| {
                    Error::Malformed(format!("unknown message type: {}", value))
                })?;
                Ok(Self::MessageType(message_type))
            }
            Ok(OptionCode::ServerIdentifier) => Ok(Self::ServerIdentifier(single_addr(
                OptionCode::ServerIdentifier,
                data,
            )?)),
            Ok(OptionCode::ParameterRequestList) => Ok(Self::ParameterRequestList(data.to_vec())),
            Ok(OptionCode::MaximumMessageSize) => {
                if data.len() != 2 {
                    return Err(Error::Malformed(
                        "invalid maximum message size length".to_string(),
                    ));
                }
                Ok(Self::MaximumMessageSize(u16::from_be_bytes([
                    data[0], data[1],
                ])))
            }
            Ok(OptionCode::RenewalTime) => {
                Ok(Self::RenewalTime(be_u32(OptionCode::RenewalTime, data)?))
            }
            Ok(OptionCode::RebindingTime) => Ok(Self::RebindingTime(be_u32(
                OptionCode::RebindingTime,
                data,
            )?)),
            Ok(OptionCode::ClientIdentifier) => Ok(Self::ClientIdentifier(data.to_vec())),
            Ok(OptionCode::RelayAgentInformation) => Ok(Self::RelayAgentInformation(
                RelayAgentInformation::parse(data)?,
            )),
            Ok(OptionCode::Pad) | Ok(OptionCode::End) => Err(Error::Malformed(
                "pad/end must not be parsed as options".to_string(),
            )),
            Err(unknown_code) => Ok(Self::Unknown(unknown_code, data.to_vec())),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::SubnetMask(_) => OptionCode::SubnetMask as u8,
            Self::Router(_) => OptionCode::Router as u8,
            Self::DnsServer(_) => OptionCode::DnsServer as u8,
            Self::HostName(_) => OptionCode::HostName as u8,
            Self::DomainName(_) => OptionCode::DomainName as u8,
            Self::BroadcastAddress(_) => OptionCode::BroadcastAddress as u8,
            Self::RequestedIpAddress(_) => OptionCode::RequestedIpAddress as u8,
            Self::LeaseTime(_) => OptionCode::LeaseTime as u8,
            Self::MessageType(_) => OptionCode::MessageType as u8,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier as u8,
            Self::ParameterRequestList(_) => OptionCode::ParameterRequestList as u8,
            Self::MaximumMessageSize(_) => OptionCode::MaximumMessageSize as u8,
            Self::RenewalTime(_) => OptionCode::RenewalTime as u8,
            Self::RebindingTime(_) => OptionCode::RebindingTime as u8,
            Self::ClientIdentifier(_) => OptionCode::ClientIdentifier as u8,
            Self::RelayAgentInformation(_) => OptionCode::RelayAgentInformation as u8,
            Self::Unknown(code, _) => *code,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        fn tlv(code: u8, value: &[u8]) -> Vec<u8> {
            let mut result = vec![code, value.len() as u8];
            result.extend_from_slice(value);
            result
        }

        match self {
            Self::SubnetMask(addr) => tlv(self.code(), &addr.octets()),
            Self::Router(addrs) | Self::DnsServer(addrs) => {
                let mut value = Vec::with_capacity(addrs.len() * 4);
                for addr in addrs {
                    value.extend_from_slice(&addr.octets());
                }
                tlv(self.code(), &value)
            }
            Self::HostName(name) | Self::DomainName(name) => tlv(self.code(), name.as_bytes()),
            Self::BroadcastAddress(addr)
            | Self::RequestedIpAddress(addr)
            | Self::ServerIdentifier(addr) => tlv(self.code(), &addr.octets()),
            Self::LeaseTime(seconds) | Self::RenewalTime(seconds) | Self::RebindingTime(seconds) => {
                tlv(self.code(), &seconds.to_be_bytes())
            }
            Self::MessageType(message_type) => tlv(self.code(), &[*message_type as u8]),
            Self::ParameterRequestList(params) => tlv(self.code(), params),
            Self::MaximumMessageSize(size) => tlv(self.code(), &size.to_be_bytes()),
            Self::ClientIdentifier(data) => tlv(self.code(), data),
            Self::RelayAgentInformation(info) => tlv(self.code(), info.as_bytes()),
            Self::Unknown(code, data) => tlv(*code, data),
        }
    }
}
