use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, info, warn};

use crate::clock::{SharedClock, SystemClock};
use crate::config::{Config, OptionMode, sanitize_hostname};
use crate::error::{Error, Result};
use crate::lease::{Lease, LeaseEvent, LeaseStatus, LeaseTable};
use crate::options::{DhcpOption, MessageType, OptionCode};
use crate::packet::{BOOTREQUEST, DhcpPacket, format_hex};
use crate::pool::AddressPool;

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;
const RECV_BUFFER_SIZE: usize = 1500;
const SWEEP_INTERVAL_SECS: u64 = 1;

/// Datagram endpoint the engine receives from and replies through.
///
/// Abstracting the socket keeps the protocol logic testable; production
/// code uses [`UdpTransport`].
pub trait Transport: Send + Sync {
    /// The concrete local address, when one is bound. Used as the server
    /// identifier fallback.
    fn local_ipv4(&self) -> Option<Ipv4Addr>;

    fn recv_from(
        &self,
        buffer: &mut [u8],
    ) -> impl Future<Output = std::io::Result<(usize, SocketAddr)>> + Send;

    fn send_to(
        &self,
        buffer: &[u8],
        target: SocketAddr,
    ) -> impl Future<Output = std::io::Result<usize>> + Send;
}

/// Broadcast-capable UDP socket bound to the server endpoint.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub fn bind(endpoint: SocketAddr) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|error| Error::Socket(format!("failed to create socket: {}", error)))?;

        socket
            .set_reuse_address(true)
            .map_err(|error| Error::Socket(format!("failed to set SO_REUSEADDR: {}", error)))?;

        socket
            .set_broadcast(true)
            .map_err(|error| Error::Socket(format!("failed to set SO_BROADCAST: {}", error)))?;

        socket
            .set_nonblocking(true)
            .map_err(|error| Error::Socket(format!("failed to set non-blocking: {}", error)))?;

        socket
            .bind(&endpoint.into())
            .map_err(|error| Error::Socket(format!("failed to bind to {}: {}", endpoint, error)))?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|error| Error::Socket(format!("failed to register socket: {}", error)))?;

        Ok(Self { socket })
    }
}

impl Transport for UdpTransport {
    fn local_ipv4(&self) -> Option<Ipv4Addr> {
        match self.socket.local_addr() {
            Ok(SocketAddr::V4(addr)) if !addr.ip().is_unspecified() => Some(*addr.ip()),
            _ => None,
        }
    }

    async fn recv_from(&self, buffer: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buffer).await
    }

    async fn send_to(&self, buffer: &[u8], target: SocketAddr) -> std::io::Result<usize> {
        self.socket.send_to(buffer, target).await
    }
}

/// Server liveness, published on a watch channel. `reason` carries the
/// fault that forced a shutdown; it is `None` after a clean stop.
#[derive(Debug, Clone, Default)]
pub struct Status {
    pub active: bool,
    pub reason: Option<String>,
}

struct Reply {
    packet: DhcpPacket,
    destination: SocketAddr,
}

/// The DHCP protocol engine.
///
/// Owns the lease table and address pool, dispatches inbound messages,
/// and routes replies to relay agents, unicast clients or broadcast.
/// `leases_sync` serializes end-to-end handling of one datagram so that
/// read-then-mutate sequences stay consistent; the table and pool guard
/// their own invariants with internal locks underneath it.
pub struct DhcpServer<T: Transport> {
    config: Arc<Config>,
    pool: Arc<AddressPool>,
    leases: Arc<LeaseTable>,
    transport: T,
    server_identifier: Ipv4Addr,
    broadcast_address: Ipv4Addr,
    leases_sync: Mutex<()>,
    status_tx: watch::Sender<Status>,
    shutdown_tx: watch::Sender<bool>,
}

impl DhcpServer<UdpTransport> {
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let transport = UdpTransport::bind(config.endpoint)?;
        Self::with_transport(config, transport, Arc::new(SystemClock)).await
    }
}

impl<T: Transport> DhcpServer<T> {
    pub async fn with_transport(config: Config, transport: T, clock: SharedClock) -> Result<Self> {
        config.validate()?;

        let pool = Arc::new(AddressPool::new(&config.pool_range)?);
        let leases = Arc::new(LeaseTable::new(
            Arc::clone(&pool),
            clock,
            config.default_lease_time_seconds,
        ));

        if !config.initial_leases.is_empty() {
            let loaded = leases.load(config.initial_leases.clone()).await;
            info!(loaded, "restored persisted leases");
        }

        let server_identifier = config
            .server_identifier()
            .or_else(|| transport.local_ipv4())
            .ok_or_else(|| {
                Error::InvalidConfig(
                    "cannot determine server identifier: configure option 54 or bind a concrete address"
                        .to_string(),
                )
            })?;
        let broadcast_address = config.broadcast_address().unwrap_or(Ipv4Addr::BROADCAST);

        let (status_tx, _) = watch::channel(Status::default());
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            pool = %config.pool_range,
            %server_identifier,
            lease_time = config.default_lease_time_seconds,
            "DHCP server configured"
        );

        Ok(Self {
            config: Arc::new(config),
            pool,
            leases,
            transport,
            server_identifier,
            broadcast_address,
            leases_sync: Mutex::new(()),
            status_tx,
            shutdown_tx,
        })
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    pub fn lease_events(&self) -> broadcast::Receiver<LeaseEvent> {
        self.leases.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<Status> {
        self.status_tx.subscribe()
    }

    /// Requests shutdown; `run` returns after the current datagram.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Receive loop plus the 1-second expiry sweeper. Returns when
    /// [`stop`](Self::stop) is called or the socket fails.
    pub async fn run(&self) -> Result<()> {
        self.status_tx.send_replace(Status {
            active: true,
            reason: None,
        });
        info!(endpoint = %self.config.endpoint, "DHCP server ready and listening");

        let sweeper = {
            let leases = Arc::clone(&self.leases);
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => leases.sweep_expired().await,
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };

        let mut shutdown = self.shutdown_tx.subscribe();
        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        let result = loop {
            tokio::select! {
                _ = shutdown.changed() => break Ok(()),
                received = self.transport.recv_from(&mut buffer) => match received {
                    Ok((size, source)) => self.handle_datagram(&buffer[..size], source).await,
                    Err(error) => break Err(Error::Socket(format!("receive failed: {}", error))),
                },
            }
        };

        sweeper.abort();
        let reason = result.as_ref().err().map(|error| error.to_string());
        self.status_tx.send_replace(Status {
            active: false,
            reason,
        });
        result
    }

    async fn handle_datagram(&self, data: &[u8], source: SocketAddr) {
        let _guard = self.leases_sync.lock().await;

        let packet = match DhcpPacket::parse(data) {
            Ok(packet) => packet,
            Err(error) => {
                warn!(%source, %error, "dropping malformed datagram");
                return;
            }
        };

        if packet.op != BOOTREQUEST {
            return;
        }

        let Some(message_type) = packet.message_type() else {
            warn!(%source, "dropping datagram without a message type option");
            return;
        };

        let client = packet.hardware_address();
        info!(
            %message_type,
            %client,
            %source,
            broadcast = packet.is_broadcast(),
            "handling message"
        );

        let outcome = match message_type {
            MessageType::Discover => self.handle_discover(&packet).await,
            MessageType::Request => self.handle_request(&packet).await,
            MessageType::Decline => self.handle_decline(&packet).await,
            MessageType::Release => self.handle_release(&packet).await,
            MessageType::Inform => self.handle_inform(&packet).await,
            other => {
                debug!(message_type = %other, "ignoring server-to-client message");
                Ok(None)
            }
        };

        match outcome {
            Ok(Some(reply)) => {
                let reply_type = reply.packet.message_type();
                let encoded = reply.packet.encode(self.config.minimum_packet_size);
                match self.transport.send_to(&encoded, reply.destination).await {
                    Ok(_) => {
                        if let Some(message_type) = reply_type {
                            info!(
                                %message_type,
                                %client,
                                destination = %reply.destination,
                                "sent reply"
                            );
                        }
                    }
                    Err(error) => {
                        warn!(%error, destination = %reply.destination, "failed to send reply");
                    }
                }
            }
            Ok(None) => {}
            Err(error) => warn!(%client, %error, "dropping message after handler error"),
        }
    }

    async fn handle_discover(&self, request: &DhcpPacket) -> Result<Option<Reply>> {
        let hwaddr = request.hardware_address();
        let extras = self.configured_reply_options(request);

        let lease = match self.leases.get_by_hwaddr(&hwaddr).await {
            Some(mut lease) => {
                lease.status = LeaseStatus::Offered;
                lease.options = extras.clone();
                absorb_client_fields(&mut lease, request);
                self.leases.update(&lease).await?
            }
            None => {
                let Some(address) = self.leases.allocate_any().await else {
                    debug!(client = %hwaddr, "pool exhausted, dropping DISCOVER");
                    return Ok(None);
                };
                let mut lease = self.leases.create(&hwaddr).await?;
                lease.address = address;
                lease.status = LeaseStatus::Offered;
                lease.options = extras.clone();
                absorb_client_fields(&mut lease, request);
                self.leases.update(&lease).await?
            }
        };

        Ok(Some(self.reply(
            request,
            MessageType::Offer,
            lease.address,
            Some(lease.lease_time_seconds),
            extras,
        )))
    }

    async fn handle_request(&self, request: &DhcpPacket) -> Result<Option<Reply>> {
        let hwaddr = request.hardware_address();

        if let Some(server_id) = request.server_identifier() {
            self.handle_request_selecting(request, &hwaddr, server_id)
                .await
        } else if request.ciaddr != Ipv4Addr::UNSPECIFIED {
            self.handle_request_renewal(request, &hwaddr).await
        } else if let Some(requested) = request.requested_ip() {
            self.handle_request_init_reboot(request, &hwaddr, requested)
                .await
        } else {
            debug!(client = %hwaddr, "REQUEST carries no server id, ciaddr or requested address");
            Ok(None)
        }
    }

    /// REQUEST answering one of our OFFERs (or someone else's).
    async fn handle_request_selecting(
        &self,
        request: &DhcpPacket,
        hwaddr: &str,
        server_id: Ipv4Addr,
    ) -> Result<Option<Reply>> {
        if server_id != self.server_identifier {
            // The client chose another server: forget the outstanding offer.
            if let Some(lease) = self.leases.get_by_hwaddr(hwaddr).await
                && lease.status == LeaseStatus::Offered
                && let Err(error) = self.leases.remove(&lease).await
            {
                debug!(client = %hwaddr, %error, "could not discard superseded offer");
            }
            return Ok(None);
        }

        match self.leases.get_by_hwaddr(hwaddr).await {
            Some(lease) if lease.status == LeaseStatus::Offered => {
                if request.requested_ip() == Some(lease.address) {
                    let extras = self.configured_reply_options(request);
                    let mut bound = lease;
                    bound.status = LeaseStatus::Bound;
                    bound.options = extras.clone();
                    absorb_client_fields(&mut bound, request);
                    let bound = self.leases.update(&bound).await?;
                    Ok(Some(self.reply(
                        request,
                        MessageType::Ack,
                        bound.address,
                        Some(bound.lease_time_seconds),
                        extras,
                    )))
                } else {
                    if let Err(error) = self.leases.remove(&lease).await {
                        debug!(client = %hwaddr, %error, "could not remove lease after mismatched REQUEST");
                    }
                    Ok(Some(self.nak(request)))
                }
            }
            _ => Ok(Some(self.nak(request))),
        }
    }

    /// REQUEST with ciaddr set: the client is RENEWING or REBINDING.
    async fn handle_request_renewal(
        &self,
        request: &DhcpPacket,
        hwaddr: &str,
    ) -> Result<Option<Reply>> {
        let ciaddr = request.ciaddr;

        match self.leases.get_by_hwaddr(hwaddr).await {
            Some(lease) if lease.address == ciaddr => {
                let extras = self.configured_reply_options(request);
                let mut bound = lease;
                bound.status = LeaseStatus::Bound;
                bound.options = extras.clone();
                absorb_client_fields(&mut bound, request);
                let bound = self.leases.update(&bound).await?;
                Ok(Some(self.reply(
                    request,
                    MessageType::Ack,
                    bound.address,
                    Some(bound.lease_time_seconds),
                    extras,
                )))
            }
            Some(lease) if lease.is_static => Ok(Some(self.nak(request))),
            Some(lease) => {
                // The client insists on a different address than its lease.
                self.leases.remove(&lease).await?;
                match self.leases.allocate_specific(ciaddr).await {
                    Some(address) => {
                        let extras = self.configured_reply_options(request);
                        let mut fresh = self.leases.create(hwaddr).await?;
                        fresh.address = address;
                        fresh.status = LeaseStatus::Bound;
                        fresh.options = extras.clone();
                        absorb_client_fields(&mut fresh, request);
                        let bound = self.leases.update(&fresh).await?;
                        Ok(Some(self.reply(
                            request,
                            MessageType::Ack,
                            bound.address,
                            Some(bound.lease_time_seconds),
                            extras,
                        )))
                    }
                    None => {
                        debug!(client = %hwaddr, address = %ciaddr, "cannot re-bind renewing client, dropping");
                        Ok(None)
                    }
                }
            }
            None => match self.leases.allocate_specific(ciaddr).await {
                Some(address) => {
                    // Offer rather than ACK: an unknown renewing client is
                    // forced back through SELECTING before we commit.
                    let extras = self.configured_reply_options(request);
                    let mut fresh = self.leases.create(hwaddr).await?;
                    fresh.address = address;
                    fresh.status = LeaseStatus::Offered;
                    fresh.options = extras.clone();
                    absorb_client_fields(&mut fresh, request);
                    let offered = self.leases.update(&fresh).await?;
                    Ok(Some(self.reply(
                        request,
                        MessageType::Offer,
                        offered.address,
                        Some(offered.lease_time_seconds),
                        extras,
                    )))
                }
                None => Ok(Some(self.nak(request))),
            },
        }
    }

    /// REQUEST with neither server id nor ciaddr: INIT-REBOOT.
    async fn handle_request_init_reboot(
        &self,
        request: &DhcpPacket,
        hwaddr: &str,
        requested: Ipv4Addr,
    ) -> Result<Option<Reply>> {
        match self.leases.get_by_hwaddr(hwaddr).await {
            Some(lease) if lease.status == LeaseStatus::Bound && lease.address == requested => {
                let extras = self.configured_reply_options(request);
                let mut bound = lease;
                bound.status = LeaseStatus::Bound;
                bound.options = extras.clone();
                absorb_client_fields(&mut bound, request);
                let bound = self.leases.update(&bound).await?;
                Ok(Some(self.reply(
                    request,
                    MessageType::Ack,
                    bound.address,
                    Some(bound.lease_time_seconds),
                    extras,
                )))
            }
            Some(lease) => {
                if let Err(error) = self.leases.remove(&lease).await {
                    debug!(client = %hwaddr, %error, "could not remove stale lease");
                }
                Ok(Some(self.nak(request)))
            }
            None => Ok(Some(self.nak(request))),
        }
    }

    async fn handle_decline(&self, request: &DhcpPacket) -> Result<Option<Reply>> {
        if request.server_identifier() != Some(self.server_identifier) {
            return Ok(None);
        }

        let hwaddr = request.hardware_address();
        if let Some(lease) = self.leases.get_by_hwaddr(&hwaddr).await {
            let address = lease.address;
            match self.leases.remove(&lease).await {
                Ok(_) => {
                    if request.requested_ip() == Some(address) {
                        // Redundant with remove(); marking twice is harmless.
                        self.pool.mark_unused(address).await;
                    }
                    warn!(client = %hwaddr, %address, "client declined address");
                }
                Err(error) => {
                    debug!(client = %hwaddr, %error, "could not remove declined lease");
                }
            }
        }
        Ok(None)
    }

    async fn handle_release(&self, request: &DhcpPacket) -> Result<Option<Reply>> {
        if request.server_identifier() != Some(self.server_identifier) {
            return Ok(None);
        }

        let hwaddr = request.hardware_address();
        if let Some(lease) = self.leases.get_by_hwaddr(&hwaddr).await {
            if request.ciaddr == lease.address {
                let mut released = lease;
                released.status = LeaseStatus::Released;
                let released = self.leases.update(&released).await?;
                info!(client = %hwaddr, address = %released.address, "lease released");
            } else if let Err(error) = self.leases.remove(&lease).await {
                debug!(client = %hwaddr, %error, "could not remove lease after mismatched RELEASE");
            }
        }
        Ok(None)
    }

    async fn handle_inform(&self, request: &DhcpPacket) -> Result<Option<Reply>> {
        if request.ciaddr == Ipv4Addr::UNSPECIFIED {
            debug!("INFORM without ciaddr, dropping");
            return Ok(None);
        }

        let extras = self.configured_reply_options(request);
        let packet = self.build_reply(request, MessageType::Ack, Ipv4Addr::UNSPECIFIED, None, extras);
        let destination = SocketAddr::new(IpAddr::V4(request.ciaddr), DHCP_CLIENT_PORT);
        Ok(Some(Reply {
            packet,
            destination,
        }))
    }

    /// Configured options the reply should carry: `Force` options always,
    /// `Optional` ones when the parameter request list names them. Server
    /// identifier and lease time are owned by the reply builder.
    fn configured_reply_options(&self, request: &DhcpPacket) -> Vec<DhcpOption> {
        let requested = request.parameter_request_list().unwrap_or(&[]);
        let mut options: Vec<DhcpOption> = Vec::new();

        for configured in &self.config.options {
            let code = configured.option.code();
            if code == OptionCode::ServerIdentifier as u8 || code == OptionCode::LeaseTime as u8 {
                continue;
            }
            let wanted = configured.mode == OptionMode::Force || requested.contains(&code);
            if wanted && !options.iter().any(|option| option.code() == code) {
                options.push(configured.option.clone());
            }
        }
        options
    }

    fn build_reply(
        &self,
        request: &DhcpPacket,
        message_type: MessageType,
        your_ip: Ipv4Addr,
        lease_time: Option<u32>,
        extras: Vec<DhcpOption>,
    ) -> DhcpPacket {
        let mut options = vec![DhcpOption::ServerIdentifier(self.server_identifier)];
        if let Some(seconds) = lease_time {
            options.push(DhcpOption::LeaseTime(seconds));
        }
        options.extend(extras);
        if let Some(info) = request.relay_agent_information() {
            options.push(DhcpOption::RelayAgentInformation(info.clone()));
        }
        DhcpPacket::create_reply(request, message_type, your_ip, self.server_identifier, options)
    }

    fn reply(
        &self,
        request: &DhcpPacket,
        message_type: MessageType,
        your_ip: Ipv4Addr,
        lease_time: Option<u32>,
        extras: Vec<DhcpOption>,
    ) -> Reply {
        Reply {
            packet: self.build_reply(request, message_type, your_ip, lease_time, extras),
            destination: self.reply_destination(request, message_type),
        }
    }

    fn nak(&self, request: &DhcpPacket) -> Reply {
        Reply {
            packet: self.build_reply(
                request,
                MessageType::Nak,
                Ipv4Addr::UNSPECIFIED,
                None,
                Vec::new(),
            ),
            destination: self.reply_destination(request, MessageType::Nak),
        }
    }

    /// RFC 2131 §4.1: relay agents take precedence, then the client's
    /// current address, then broadcast. NAKs never unicast to ciaddr.
    fn reply_destination(&self, request: &DhcpPacket, message_type: MessageType) -> SocketAddr {
        if message_type == MessageType::Nak {
            return if request.giaddr != Ipv4Addr::UNSPECIFIED {
                SocketAddr::new(IpAddr::V4(request.giaddr), DHCP_SERVER_PORT)
            } else {
                SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DHCP_CLIENT_PORT)
            };
        }

        if request.giaddr != Ipv4Addr::UNSPECIFIED {
            SocketAddr::new(IpAddr::V4(request.giaddr), DHCP_SERVER_PORT)
        } else if request.ciaddr != Ipv4Addr::UNSPECIFIED {
            SocketAddr::new(IpAddr::V4(request.ciaddr), DHCP_CLIENT_PORT)
        } else {
            SocketAddr::new(IpAddr::V4(self.broadcast_address), DHCP_CLIENT_PORT)
        }
    }
}

fn absorb_client_fields(lease: &mut Lease, request: &DhcpPacket) {
    if let Some(hostname) = request.hostname() {
        lease.hostname = Some(sanitize_hostname(hostname));
    }
    if let Some(client_id) = request.client_identifier() {
        lease.client_id = format_hex(client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use crate::config::ConfiguredOption;
    use crate::packet::MIN_PACKET_SIZE_FLOOR;
    use chrono::DateTime;

    const SERVER_ID: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);

    #[derive(Default)]
    struct MockTransport {
        sent: std::sync::Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    }

    impl Transport for MockTransport {
        fn local_ipv4(&self) -> Option<Ipv4Addr> {
            None
        }

        async fn recv_from(&self, _buffer: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
            std::future::pending().await
        }

        async fn send_to(&self, buffer: &[u8], target: SocketAddr) -> std::io::Result<usize> {
            self.sent.lock().unwrap().push((buffer.to_vec(), target));
            Ok(buffer.len())
        }
    }

    async fn test_server() -> (DhcpServer<MockTransport>, Arc<ManualClock>) {
        let clock = ManualClock::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap());
        let config = Config {
            endpoint: SocketAddr::from(([0, 0, 0, 0], 67)),
            pool_range: "192.168.1.10-192.168.1.12".to_string(),
            default_lease_time_seconds: 60,
            minimum_packet_size: MIN_PACKET_SIZE_FLOOR,
            options: vec![
                ConfiguredOption {
                    option: DhcpOption::ServerIdentifier(SERVER_ID),
                    mode: OptionMode::Force,
                },
                ConfiguredOption {
                    option: DhcpOption::Router(vec![SERVER_ID]),
                    mode: OptionMode::Force,
                },
                ConfiguredOption {
                    option: DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 255, 0)),
                    mode: OptionMode::Optional,
                },
            ],
            initial_leases: Vec::new(),
        };
        let server = DhcpServer::with_transport(config, MockTransport::default(), clock.clone())
            .await
            .unwrap();
        (server, clock)
    }

    fn mac(last: u8) -> [u8; 6] {
        [0xaa, 0xbb, 0xcc, 0xdd, 0xee, last]
    }

    fn base_request(mac: [u8; 6], xid: u32) -> DhcpPacket {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&mac);
        DhcpPacket {
            op: BOOTREQUEST,
            htype: 1,
            hlen: 6,
            hops: 0,
            xid,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options: Vec::new(),
        }
    }

    fn discover(mac: [u8; 6], xid: u32) -> DhcpPacket {
        let mut packet = base_request(mac, xid);
        packet
            .options
            .push(DhcpOption::MessageType(MessageType::Discover));
        packet
    }

    fn selecting_request(mac: [u8; 6], xid: u32, requested: Ipv4Addr) -> DhcpPacket {
        let mut packet = base_request(mac, xid);
        packet
            .options
            .push(DhcpOption::MessageType(MessageType::Request));
        packet.options.push(DhcpOption::ServerIdentifier(SERVER_ID));
        packet
            .options
            .push(DhcpOption::RequestedIpAddress(requested));
        packet
    }

    async fn deliver(server: &DhcpServer<MockTransport>, packet: &DhcpPacket) {
        let source = SocketAddr::from(([0, 0, 0, 0], 68));
        server
            .handle_datagram(&packet.encode(MIN_PACKET_SIZE_FLOOR), source)
            .await;
    }

    fn replies(server: &DhcpServer<MockTransport>) -> Vec<(DhcpPacket, SocketAddr)> {
        server
            .transport
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|(data, target)| (DhcpPacket::parse(data).unwrap(), *target))
            .collect()
    }

    fn last_reply(server: &DhcpServer<MockTransport>) -> (DhcpPacket, SocketAddr) {
        replies(server).pop().expect("no reply sent")
    }

    async fn handshake(server: &DhcpServer<MockTransport>, mac: [u8; 6], xid: u32) -> Ipv4Addr {
        deliver(server, &discover(mac, xid)).await;
        let (offer, _) = last_reply(server);
        deliver(server, &selecting_request(mac, xid, offer.yiaddr)).await;
        let (ack, _) = last_reply(server);
        assert_eq!(ack.message_type(), Some(MessageType::Ack));
        ack.yiaddr
    }

    #[tokio::test]
    async fn test_discover_then_request() {
        let (server, _clock) = test_server().await;

        deliver(&server, &discover(mac(0x01), 0x1)).await;
        let (offer, destination) = last_reply(&server);
        assert_eq!(offer.message_type(), Some(MessageType::Offer));
        assert_eq!(offer.yiaddr, Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(offer.xid, 0x1);
        assert_eq!(offer.server_identifier(), Some(SERVER_ID));
        assert!(offer.options.contains(&DhcpOption::LeaseTime(60)));
        assert_eq!(
            destination,
            SocketAddr::from(([255, 255, 255, 255], DHCP_CLIENT_PORT))
        );

        deliver(
            &server,
            &selecting_request(mac(0x01), 0x1, Ipv4Addr::new(192, 168, 1, 10)),
        )
        .await;
        let (ack, _) = last_reply(&server);
        assert_eq!(ack.message_type(), Some(MessageType::Ack));
        assert_eq!(ack.yiaddr, Ipv4Addr::new(192, 168, 1, 10));

        let snapshot = server.leases().snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].status, LeaseStatus::Bound);
        assert_eq!(snapshot[0].address, Ipv4Addr::new(192, 168, 1, 10));
    }

    #[tokio::test]
    async fn test_pool_exhaustion_drops_discover() {
        let (server, _clock) = test_server().await;

        for index in 1..=3 {
            handshake(&server, mac(index), index as u32).await;
        }
        let reply_count = replies(&server).len();

        deliver(&server, &discover(mac(0x04), 0x4)).await;
        assert_eq!(replies(&server).len(), reply_count);
    }

    #[tokio::test]
    async fn test_eviction_after_expiry() {
        let (server, clock) = test_server().await;

        for index in 1..=3 {
            handshake(&server, mac(index), index as u32).await;
        }

        clock.advance_seconds(61);
        server.leases().sweep_expired().await;

        deliver(&server, &discover(mac(0x04), 0x4)).await;
        let (offer, _) = last_reply(&server);
        assert_eq!(offer.message_type(), Some(MessageType::Offer));
        assert_eq!(offer.yiaddr, Ipv4Addr::new(192, 168, 1, 10));
    }

    #[tokio::test]
    async fn test_init_reboot_mismatch_naks_and_removes() {
        let (server, _clock) = test_server().await;
        handshake(&server, mac(0x01), 0x1).await;

        let mut request = base_request(mac(0x01), 0x2);
        request
            .options
            .push(DhcpOption::MessageType(MessageType::Request));
        request
            .options
            .push(DhcpOption::RequestedIpAddress(Ipv4Addr::new(192, 168, 1, 99)));
        deliver(&server, &request).await;

        let (nak, destination) = last_reply(&server);
        assert_eq!(nak.message_type(), Some(MessageType::Nak));
        assert_eq!(
            destination,
            SocketAddr::from(([255, 255, 255, 255], DHCP_CLIENT_PORT))
        );
        assert!(server.leases().snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_init_reboot_match_acks() {
        let (server, _clock) = test_server().await;
        let address = handshake(&server, mac(0x01), 0x1).await;

        let mut request = base_request(mac(0x01), 0x2);
        request
            .options
            .push(DhcpOption::MessageType(MessageType::Request));
        request.options.push(DhcpOption::RequestedIpAddress(address));
        deliver(&server, &request).await;

        let (ack, _) = last_reply(&server);
        assert_eq!(ack.message_type(), Some(MessageType::Ack));
        assert_eq!(ack.yiaddr, address);
    }

    #[tokio::test]
    async fn test_decline_removes_lease_and_frees_address() {
        let (server, _clock) = test_server().await;
        let address = handshake(&server, mac(0x01), 0x1).await;
        let reply_count = replies(&server).len();

        let mut decline = base_request(mac(0x01), 0x2);
        decline
            .options
            .push(DhcpOption::MessageType(MessageType::Decline));
        decline.options.push(DhcpOption::ServerIdentifier(SERVER_ID));
        decline.options.push(DhcpOption::RequestedIpAddress(address));
        deliver(&server, &decline).await;

        // DECLINE is never answered.
        assert_eq!(replies(&server).len(), reply_count);
        assert!(server.leases().snapshot().await.is_empty());
        assert!(server.pool.is_unused(address).await);
    }

    #[tokio::test]
    async fn test_release_with_matching_ciaddr_keeps_record() {
        let (server, _clock) = test_server().await;
        let address = handshake(&server, mac(0x01), 0x1).await;

        let mut release = base_request(mac(0x01), 0x2);
        release
            .options
            .push(DhcpOption::MessageType(MessageType::Release));
        release.options.push(DhcpOption::ServerIdentifier(SERVER_ID));
        release.ciaddr = address;
        deliver(&server, &release).await;

        let lease = server.leases().get_by_hwaddr("aa:bb:cc:dd:ee:01").await.unwrap();
        assert_eq!(lease.status, LeaseStatus::Released);
        assert_eq!(lease.address, address);
    }

    #[tokio::test]
    async fn test_release_with_wrong_ciaddr_removes_record() {
        let (server, _clock) = test_server().await;
        handshake(&server, mac(0x01), 0x1).await;

        let mut release = base_request(mac(0x01), 0x2);
        release
            .options
            .push(DhcpOption::MessageType(MessageType::Release));
        release.options.push(DhcpOption::ServerIdentifier(SERVER_ID));
        release.ciaddr = Ipv4Addr::new(192, 168, 1, 99);
        deliver(&server, &release).await;

        assert!(server.leases().snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_relayed_discover_replies_to_relay() {
        let (server, _clock) = test_server().await;

        let mut relayed = discover(mac(0x01), 0x1);
        relayed.giaddr = Ipv4Addr::new(10, 0, 0, 1);
        deliver(&server, &relayed).await;

        let (offer, destination) = last_reply(&server);
        assert_eq!(offer.message_type(), Some(MessageType::Offer));
        assert_eq!(offer.giaddr, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(
            destination,
            SocketAddr::from(([10, 0, 0, 1], DHCP_SERVER_PORT))
        );
    }

    #[tokio::test]
    async fn test_relay_agent_information_echoed() {
        let (server, _clock) = test_server().await;

        let mut relayed = discover(mac(0x01), 0x1);
        relayed.giaddr = Ipv4Addr::new(10, 0, 0, 1);
        let info =
            crate::options::RelayAgentInformation::parse(&[1, 4, b'e', b't', b'h', b'0']).unwrap();
        relayed
            .options
            .push(DhcpOption::RelayAgentInformation(info.clone()));
        deliver(&server, &relayed).await;

        let (offer, _) = last_reply(&server);
        assert_eq!(offer.relay_agent_information(), Some(&info));
    }

    #[tokio::test]
    async fn test_renewal_acks_and_refreshes_lease() {
        let (server, clock) = test_server().await;
        let address = handshake(&server, mac(0x01), 0x1).await;
        let before = server.leases().get_by_hwaddr("aa:bb:cc:dd:ee:01").await.unwrap();

        clock.advance_seconds(30);
        let mut renewal = base_request(mac(0x01), 0x2);
        renewal
            .options
            .push(DhcpOption::MessageType(MessageType::Request));
        renewal.ciaddr = address;
        deliver(&server, &renewal).await;

        let (ack, destination) = last_reply(&server);
        assert_eq!(ack.message_type(), Some(MessageType::Ack));
        assert_eq!(
            destination,
            SocketAddr::new(IpAddr::V4(address), DHCP_CLIENT_PORT)
        );

        let after = server.leases().get_by_hwaddr("aa:bb:cc:dd:ee:01").await.unwrap();
        assert_eq!(after.status, LeaseStatus::Bound);
        assert!(after.end > before.end);
    }

    #[tokio::test]
    async fn test_renewal_from_unknown_client_offers() {
        let (server, _clock) = test_server().await;

        let mut renewal = base_request(mac(0x01), 0x1);
        renewal
            .options
            .push(DhcpOption::MessageType(MessageType::Request));
        renewal.ciaddr = Ipv4Addr::new(192, 168, 1, 11);
        deliver(&server, &renewal).await;

        // The unknown client is sent back through SELECTING.
        let (offer, _) = last_reply(&server);
        assert_eq!(offer.message_type(), Some(MessageType::Offer));
        assert_eq!(offer.yiaddr, Ipv4Addr::new(192, 168, 1, 11));

        let lease = server.leases().get_by_hwaddr("aa:bb:cc:dd:ee:01").await.unwrap();
        assert_eq!(lease.status, LeaseStatus::Offered);
    }

    #[tokio::test]
    async fn test_request_for_other_server_discards_offer() {
        let (server, _clock) = test_server().await;

        deliver(&server, &discover(mac(0x01), 0x1)).await;
        let reply_count = replies(&server).len();

        let mut request = base_request(mac(0x01), 0x1);
        request
            .options
            .push(DhcpOption::MessageType(MessageType::Request));
        request
            .options
            .push(DhcpOption::ServerIdentifier(Ipv4Addr::new(10, 9, 9, 9)));
        request
            .options
            .push(DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 9, 9, 100)));
        deliver(&server, &request).await;

        assert_eq!(replies(&server).len(), reply_count);
        assert!(server.leases().snapshot().await.is_empty());
        assert_eq!(server.pool.unused_len().await, 3);
    }

    #[tokio::test]
    async fn test_selecting_mismatched_address_naks() {
        let (server, _clock) = test_server().await;

        deliver(&server, &discover(mac(0x01), 0x1)).await;
        deliver(
            &server,
            &selecting_request(mac(0x01), 0x1, Ipv4Addr::new(192, 168, 1, 12)),
        )
        .await;

        let (nak, _) = last_reply(&server);
        assert_eq!(nak.message_type(), Some(MessageType::Nak));
        assert!(server.leases().snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_selecting_without_offer_naks() {
        let (server, _clock) = test_server().await;

        deliver(
            &server,
            &selecting_request(mac(0x01), 0x1, Ipv4Addr::new(192, 168, 1, 10)),
        )
        .await;

        let (nak, _) = last_reply(&server);
        assert_eq!(nak.message_type(), Some(MessageType::Nak));
        // NAKs carry the server identifier and nothing else.
        assert_eq!(nak.server_identifier(), Some(SERVER_ID));
        assert!(!nak.options.iter().any(|option| option.code() == 51));
    }

    #[tokio::test]
    async fn test_inform_unicasts_filtered_options() {
        let (server, _clock) = test_server().await;

        let mut inform = base_request(mac(0x01), 0x1);
        inform
            .options
            .push(DhcpOption::MessageType(MessageType::Inform));
        inform
            .options
            .push(DhcpOption::ParameterRequestList(vec![1]));
        inform.ciaddr = Ipv4Addr::new(192, 168, 1, 50);
        deliver(&server, &inform).await;

        let (ack, destination) = last_reply(&server);
        assert_eq!(ack.message_type(), Some(MessageType::Ack));
        assert_eq!(ack.yiaddr, Ipv4Addr::UNSPECIFIED);
        assert_eq!(
            destination,
            SocketAddr::from(([192, 168, 1, 50], DHCP_CLIENT_PORT))
        );
        // No lease time on an INFORM ACK; the requested subnet mask and the
        // forced router are present.
        assert!(!ack.options.iter().any(|option| option.code() == 51));
        assert!(ack
            .options
            .contains(&DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 255, 0))));
        assert!(ack.options.contains(&DhcpOption::Router(vec![SERVER_ID])));
        assert!(server.leases().snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_optional_options_need_parameter_request() {
        let (server, _clock) = test_server().await;

        deliver(&server, &discover(mac(0x01), 0x1)).await;
        let (offer, _) = last_reply(&server);

        // Forced router is always present; the optional subnet mask was
        // not requested.
        assert!(offer.options.contains(&DhcpOption::Router(vec![SERVER_ID])));
        assert!(!offer.options.iter().any(|option| option.code() == 1));

        let mut asking = discover(mac(0x02), 0x2);
        asking
            .options
            .push(DhcpOption::ParameterRequestList(vec![1, 3]));
        deliver(&server, &asking).await;
        let (offer, _) = last_reply(&server);
        assert!(offer
            .options
            .contains(&DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 255, 0))));
    }

    #[tokio::test]
    async fn test_non_bootrequest_and_malformed_are_dropped() {
        let (server, _clock) = test_server().await;

        let mut reply_op = discover(mac(0x01), 0x1);
        reply_op.op = 2;
        deliver(&server, &reply_op).await;

        server
            .handle_datagram(&[0u8; 10], SocketAddr::from(([0, 0, 0, 0], 68)))
            .await;

        assert!(replies(&server).is_empty());
        assert!(server.leases().snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_discover_absorbs_hostname_and_client_id() {
        let (server, _clock) = test_server().await;

        let mut packet = discover(mac(0x01), 0x1);
        packet
            .options
            .push(DhcpOption::HostName("work station".to_string()));
        packet
            .options
            .push(DhcpOption::ClientIdentifier(vec![1, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]));
        deliver(&server, &packet).await;

        let lease = server.leases().get_by_hwaddr("aa:bb:cc:dd:ee:01").await.unwrap();
        assert_eq!(lease.hostname.as_deref(), Some("workstation"));
        assert_eq!(lease.client_id, "01:aa:bb:cc:dd:ee:01");
    }

    #[tokio::test]
    async fn test_stop_reports_clean_status() {
        let (server, _clock) = test_server().await;
        let mut status = server.status();

        assert!(!status.borrow().active);
        let run = server.run();
        tokio::pin!(run);

        // Drive the run future until it has published the active status.
        tokio::select! {
            _ = &mut run => panic!("run returned early"),
            _ = status.changed() => {}
        }
        assert!(status.borrow().active);

        server.stop();
        run.await.unwrap();
        assert!(!status.borrow_and_update().active);
        assert!(status.borrow().reason.is_none());
    }
}
