use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use thiserror::Error;

pub const SOCKS_VERSION: u8 = 0x05;

// Authentication methods (RFC 1928 §3)
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_USER_PASS: u8 = 0x02;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

// Username/password sub-negotiation (RFC 1929)
pub const AUTH_VERSION: u8 = 0x01;
pub const AUTH_SUCCESS: u8 = 0x00;

pub const CMD_UDP_ASSOCIATE: u8 = 0x03;
const RESERVED: u8 = 0x00;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

// SOCKS5 reply codes (RFC 1928 §6)
pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_NOT_ALLOWED: u8 = 0x02;
pub const REPLY_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REPLY_HOST_UNREACHABLE: u8 = 0x04;
pub const REPLY_CONNECTION_REFUSED: u8 = 0x05;
pub const REPLY_TTL_EXPIRED: u8 = 0x06;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

pub const NEGOTIATION_REPLY_LEN: usize = 2;
pub const AUTH_REPLY_LEN: usize = 2;
/// VER REP RSV ATYP, common to every ASSOCIATE reply form.
pub const ASSOCIATE_REPLY_HEAD_LEN: usize = 4;
/// ASSOCIATE reply in its IPv4 form: VER REP RSV ATYP + 4 address bytes + port.
pub const ASSOCIATE_REPLY_LEN: usize = 10;
/// UDP envelope header in its IPv4 form: RSV RSV FRAG ATYP + 4 address bytes + port.
pub const UDP_HEADER_IPV4_LEN: usize = 10;

const MAX_FIELD_LEN: usize = u8::MAX as usize;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Malformed reply: {0}")]
    MalformedReply(String),
    #[error("Unsupported address type: {0:#04x} (only IPv4 is implemented)")]
    UnsupportedAddressType(u8),
    #[error("Unsupported UDP fragment number {0} (only standalone datagrams are handled)")]
    UnsupportedFragment(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationReply {
    pub version: u8,
    pub method: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthReply {
    pub version: u8,
    pub status: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociateReplyHead {
    pub version: u8,
    pub code: u8,
    pub address_type: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociateReply {
    pub version: u8,
    pub code: u8,
    pub address_type: u8,
    pub address: SocketAddr,
}

impl AssociateReply {
    /// An unspecified bind address means "the host you reached me on".
    pub fn relay_addr(&self, control_peer: SocketAddr) -> SocketAddr {
        if self.address.ip().is_unspecified() {
            SocketAddr::new(control_peer.ip(), self.address.port())
        } else {
            self.address
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpEnvelope {
    pub fragment: u8,
    pub address_type: u8,
    pub destination: SocketAddr,
    pub payload: Vec<u8>,
}

/// Human-readable name of an RFC 1928 reply code.
pub fn reply_code_name(code: u8) -> &'static str {
    match code {
        REPLY_SUCCEEDED => "succeeded",
        REPLY_GENERAL_FAILURE => "general SOCKS server failure",
        REPLY_NOT_ALLOWED => "connection not allowed by ruleset",
        REPLY_NETWORK_UNREACHABLE => "network unreachable",
        REPLY_HOST_UNREACHABLE => "host unreachable",
        REPLY_CONNECTION_REFUSED => "connection refused",
        REPLY_TTL_EXPIRED => "TTL expired",
        REPLY_COMMAND_NOT_SUPPORTED => "command not supported",
        REPLY_ADDRESS_TYPE_NOT_SUPPORTED => "address type not supported",
        _ => "unassigned",
    }
}

fn require_len(buf: &[u8], min: usize, what: &str) -> Result<(), CodecError> {
    if buf.len() < min {
        return Err(CodecError::MalformedReply(format!(
            "{} needs at least {} bytes, got {}",
            what,
            min,
            buf.len()
        )));
    }
    Ok(())
}

fn ipv4_of(addr: SocketAddr) -> Result<SocketAddrV4, CodecError> {
    match addr {
        SocketAddr::V4(v4) => Ok(v4),
        SocketAddr::V6(_) => Err(CodecError::UnsupportedAddressType(ATYP_IPV6)),
    }
}

/// Reads the IPv4 address and port that follow the ATYP byte at `offset`.
fn read_ipv4_socket_addr(buf: &[u8], offset: usize) -> SocketAddr {
    let ip = Ipv4Addr::new(buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]);
    let port = u16::from_be_bytes([buf[offset + 4], buf[offset + 5]]);
    SocketAddr::new(IpAddr::V4(ip), port)
}

/// Domain and IPv6 forms are recognised but not decoded.
pub fn check_ipv4_atyp(atyp: u8) -> Result<(), CodecError> {
    match atyp {
        ATYP_IPV4 => Ok(()),
        ATYP_DOMAIN | ATYP_IPV6 => Err(CodecError::UnsupportedAddressType(atyp)),
        other => Err(CodecError::UnsupportedAddressType(other)),
    }
}

/// ```text
/// +----+----------+----------+
/// |VER | NMETHODS | METHODS  |
/// +----+----------+----------+
/// | 1  |    1     | 1 to 255 |
/// +----+----------+----------+
/// ```
pub fn encode_negotiation_request(methods: &[u8]) -> Result<Vec<u8>, CodecError> {
    if methods.is_empty() || methods.len() > MAX_FIELD_LEN {
        return Err(CodecError::InvalidArgument(format!(
            "method list must hold 1 to 255 entries, got {}",
            methods.len()
        )));
    }
    let mut buf = Vec::with_capacity(2 + methods.len());
    buf.push(SOCKS_VERSION);
    buf.push(methods.len() as u8);
    buf.extend_from_slice(methods);
    Ok(buf)
}

pub fn decode_negotiation_reply(buf: &[u8]) -> Result<NegotiationReply, CodecError> {
    require_len(buf, NEGOTIATION_REPLY_LEN, "method selection reply")?;
    Ok(NegotiationReply {
        version: buf[0],
        method: buf[1],
    })
}

/// ```text
/// +----+------+----------+------+----------+
/// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
/// +----+------+----------+------+----------+
/// | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
/// +----+------+----------+------+----------+
/// ```
pub fn encode_auth_request(username: &[u8], password: &[u8]) -> Result<Vec<u8>, CodecError> {
    if username.len() > MAX_FIELD_LEN {
        return Err(CodecError::InvalidArgument(format!(
            "username is {} bytes, at most 255 allowed",
            username.len()
        )));
    }
    if password.len() > MAX_FIELD_LEN {
        return Err(CodecError::InvalidArgument(format!(
            "password is {} bytes, at most 255 allowed",
            password.len()
        )));
    }
    let mut buf = Vec::with_capacity(3 + username.len() + password.len());
    buf.push(AUTH_VERSION);
    buf.push(username.len() as u8);
    buf.extend_from_slice(username);
    buf.push(password.len() as u8);
    buf.extend_from_slice(password);
    Ok(buf)
}

pub fn decode_auth_reply(buf: &[u8]) -> Result<AuthReply, CodecError> {
    require_len(buf, AUTH_REPLY_LEN, "authentication reply")?;
    Ok(AuthReply {
        version: buf[0],
        status: buf[1],
    })
}

/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   |    4     |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
pub fn encode_associate_request(bind: SocketAddr) -> Result<Vec<u8>, CodecError> {
    let bind = ipv4_of(bind)?;
    let mut buf = Vec::with_capacity(ASSOCIATE_REPLY_LEN);
    buf.extend_from_slice(&[SOCKS_VERSION, CMD_UDP_ASSOCIATE, RESERVED, ATYP_IPV4]);
    buf.extend_from_slice(&bind.ip().octets());
    buf.extend_from_slice(&bind.port().to_be_bytes());
    Ok(buf)
}

/// Decodes only the fixed head, so the reply code is known before the
/// address form decides how many bytes follow.
pub fn decode_associate_reply_head(buf: &[u8]) -> Result<AssociateReplyHead, CodecError> {
    require_len(buf, ASSOCIATE_REPLY_HEAD_LEN, "UDP ASSOCIATE reply")?;
    Ok(AssociateReplyHead {
        version: buf[0],
        code: buf[1],
        address_type: buf[3],
    })
}

pub fn decode_associate_reply(buf: &[u8]) -> Result<AssociateReply, CodecError> {
    let head = decode_associate_reply_head(buf)?;
    require_len(buf, ASSOCIATE_REPLY_LEN, "UDP ASSOCIATE reply")?;
    check_ipv4_atyp(head.address_type)?;
    Ok(AssociateReply {
        version: head.version,
        code: head.code,
        address_type: head.address_type,
        address: read_ipv4_socket_addr(buf, ASSOCIATE_REPLY_HEAD_LEN),
    })
}

/// ```text
/// +----+------+------+----------+----------+----------+
/// |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
/// +----+------+------+----------+----------+----------+
/// | 2  |  1   |  1   | Variable |    2     | Variable |
/// +----+------+------+----------+----------+----------+
/// ```
pub fn encode_udp_envelope(destination: SocketAddr, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    let destination = ipv4_of(destination)?;
    let mut buf = Vec::with_capacity(UDP_HEADER_IPV4_LEN + payload.len());
    buf.extend_from_slice(&[RESERVED, RESERVED, 0x00, ATYP_IPV4]);
    buf.extend_from_slice(&destination.ip().octets());
    buf.extend_from_slice(&destination.port().to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// The reserved bytes are not checked; some relays fill them with garbage.
pub fn decode_udp_envelope(buf: &[u8]) -> Result<UdpEnvelope, CodecError> {
    require_len(buf, UDP_HEADER_IPV4_LEN, "UDP envelope")?;
    let fragment = buf[2];
    if fragment != 0 {
        return Err(CodecError::UnsupportedFragment(fragment));
    }
    let address_type = buf[3];
    check_ipv4_atyp(address_type)?;
    Ok(UdpEnvelope {
        fragment,
        address_type,
        destination: read_ipv4_socket_addr(buf, 4),
        payload: buf[UDP_HEADER_IPV4_LEN..].to_vec(),
    })
}
