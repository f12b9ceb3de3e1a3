//! Multicast DNS responder.
//!
//! One [`Server`] is started per host interface. It tries to open an IPv4 and
//! an IPv6 listener, each joined to the well-known mDNS group on that
//! interface, and answers A/AAAA questions from a [`Responder`]. Queries
//! nobody can answer get no response at all.
//!
//! Messages are decoded and encoded with
//! [hickory-proto](https://crates.io/crates/hickory-proto), which also handles
//! the unicast-response bit carried in the question class.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::Arc;

use hickory_server::proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_server::proto::rr::{Name, Record, RecordType};
use hickory_server::proto::serialize::binary::BinEncodable;
use log::{debug, error, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use super::interfaces::NetInterface;
use crate::error::MdnsError;
use crate::signal::Signal;

pub const DEFAULT_MDNS_TLD: &str = ".local";
pub const IPV4_MDNS_ADDR: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const IPV6_MDNS_ADDR: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);
pub const MDNS_PORT: u16 = 5353;

/// Questions beyond this many in one packet are ignored.
pub const MAX_QUESTIONS: usize = 32;
/// Upper bound on answer records in one response.
pub const MAX_ANSWERS: usize = 64;

const RECV_BUFFER_SIZE: usize = 65536;

/// Source of answers for incoming questions.
pub trait Responder: Send + Sync {
    fn answer(&self, name: &Name, record_type: RecordType) -> Vec<Record>;
}

/// A response ready to be sent, and how to address it.
#[derive(Debug)]
pub struct Response {
    pub message: Message,
    pub unicast: bool,
}

/// mDNS listeners bound to one interface.
#[derive(Debug)]
pub struct Server {
    interface: String,
    listeners: usize,
}

impl Server {
    /// Start listening on `iface`.
    ///
    /// Failing to join one address family is not fatal; the server keeps
    /// whatever listeners succeeded. All listeners close once `stop` fires.
    pub fn start(iface: &NetInterface, responder: Arc<dyn Responder>, stop: Signal) -> Self {
        let mut listeners = 0;

        let attempts: [(&str, io::Result<std::net::UdpSocket>); 2] =
            [("udp4", bind_ipv4(iface)), ("udp6", bind_ipv6(iface))];

        for (network, bound) in attempts {
            let socket = match bound.and_then(UdpSocket::from_std) {
                Ok(socket) => socket,
                Err(e) => {
                    info!(
                        "mDNS: not listening for {} on interface {:?}: {}",
                        network, iface.name, e
                    );
                    continue;
                }
            };

            let label = format!("{}/{}", iface.name, network);
            debug!("mDNS: listening on {}", label);
            tokio::spawn(listener_loop(
                socket,
                Arc::clone(&responder),
                stop.clone(),
                label,
            ));
            listeners += 1;
        }

        Self {
            interface: iface.name.clone(),
            listeners,
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Number of listeners that joined their multicast group.
    pub fn listener_count(&self) -> usize {
        self.listeners
    }
}

fn bind_ipv4(iface: &NetInterface) -> io::Result<std::net::UdpSocket> {
    let iface_addr = iface.ipv4().ok_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "no IPv4 address on interface")
    })?;

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddr::new(listen_ip(IpAddr::V4(IPV4_MDNS_ADDR)), MDNS_PORT).into())?;
    socket.join_multicast_v4(&IPV4_MDNS_ADDR, &iface_addr)?;
    socket.set_multicast_if_v4(&iface_addr)?;
    socket.set_multicast_ttl_v4(255)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn bind_ipv6(iface: &NetInterface) -> io::Result<std::net::UdpSocket> {
    if !iface.has_ipv6() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "no IPv6 address on interface",
        ));
    }
    let index = iface.index.ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "interface index unavailable")
    })?;

    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(true)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    let bind_ip = match listen_ip(IpAddr::V6(IPV6_MDNS_ADDR)) {
        IpAddr::V6(v6) => v6,
        IpAddr::V4(_) => Ipv6Addr::UNSPECIFIED,
    };
    socket.bind(&SocketAddrV6::new(bind_ip, MDNS_PORT, 0, index).into())?;
    socket.join_multicast_v6(&IPV6_MDNS_ADDR, index)?;
    socket.set_multicast_if_v6(index)?;
    socket.set_multicast_hops_v6(255)?;
    socket.set_multicast_loop_v6(true)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Address a listener binds to: the group itself where the platform allows
/// it, so each socket only sees traffic for its own group.
#[cfg(unix)]
fn listen_ip(group: IpAddr) -> IpAddr {
    group
}

#[cfg(not(unix))]
fn listen_ip(group: IpAddr) -> IpAddr {
    match group {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

async fn listener_loop(
    socket: UdpSocket,
    responder: Arc<dyn Responder>,
    stop: Signal,
    label: String,
) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        let (length, from) = tokio::select! {
            _ = stop.wait() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((0, _)) => {
                    debug!("mDNS: ignoring empty datagram on {}", label);
                    continue;
                }
                Ok(received) => received,
                Err(e) => {
                    error!("mDNS: error receiving on {}: {}", label, e);
                    continue;
                }
            },
        };

        if let Err(e) = handle_packet(&socket, &buf[..length], from, responder.as_ref()).await {
            warn!("mDNS: error handling query from {} on {}: {}", from, label, e);
        }
    }

    // Dropping the socket closes it and leaves the multicast group.
    drop(socket);
    debug!("mDNS: listener {} closed", label);
}

async fn handle_packet(
    socket: &UdpSocket,
    packet: &[u8],
    from: SocketAddr,
    responder: &dyn Responder,
) -> Result<(), MdnsError> {
    let Some(response) = handle_query(packet, responder)? else {
        return Ok(());
    };

    let bytes = response.message.to_bytes()?;
    let dest = response_destination(from, response.unicast);

    match socket.send_to(&bytes, dest).await {
        Ok(_) => Ok(()),
        Err(e) if response.unicast => Err(e.into()),
        Err(e) => {
            // Multicast sends fail routinely with listeners on several interfaces.
            debug!("mDNS: multicast response to {} failed: {}", dest, e);
            Ok(())
        }
    }
}

/// Decode `packet` and build the response, if any.
///
/// Returns `Ok(None)` for packets that must be ignored: anything other than a
/// plain query, and queries with no answers.
pub fn handle_query(packet: &[u8], responder: &dyn Responder) -> Result<Option<Response>, MdnsError> {
    let query = Message::from_vec(packet)?;

    if query.message_type() != MessageType::Query
        || query.op_code() != OpCode::Query
        || query.response_code() != ResponseCode::NoError
        || query.truncated()
    {
        return Ok(None);
    }

    let mut answers: Vec<Record> = Vec::new();
    let mut unicast = false;

    for question in query.queries().iter().take(MAX_QUESTIONS) {
        let name = question.name().to_lowercase();
        answers.extend(responder.answer(&name, question.query_type()));
        unicast = unicast || question.mdns_unicast_response();
    }

    if answers.is_empty() {
        return Ok(None);
    }
    if answers.len() > MAX_ANSWERS {
        debug!(
            "mDNS: truncating {} answers to {}",
            answers.len(),
            MAX_ANSWERS
        );
        answers.truncate(MAX_ANSWERS);
    }

    let mut message = Message::new();
    message
        .set_id(0)
        .set_message_type(MessageType::Response)
        .set_op_code(query.op_code())
        .set_authoritative(true);
    message.add_answers(answers);

    Ok(Some(Response { message, unicast }))
}

/// Where a response to a query from `from` is sent.
pub fn response_destination(from: SocketAddr, unicast: bool) -> SocketAddr {
    if unicast {
        return from;
    }
    match from {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(IPV4_MDNS_ADDR), MDNS_PORT),
        SocketAddr::V6(v6) => {
            SocketAddr::V6(SocketAddrV6::new(IPV6_MDNS_ADDR, MDNS_PORT, 0, v6.scope_id()))
        }
    }
}
