pub mod payload;

use log::{debug, info, warn};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use thiserror::Error;

use crate::common::auth::{offered_methods, Credentials};
use crate::socks5::codec::METHOD_USER_PASS;
use crate::socks5::{ControlSession, RelayError, SessionError, UdpRelay};
use payload::{ExpectMode, PayloadError, ReplyMatch};

/// Bytes of the reply payload shown in the report.
const PREVIEW_LEN: usize = 20;

/// The client end of the association is left for the proxy to choose.
const ASSOCIATE_BIND: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Control session failed: {0}")]
    Session(#[from] SessionError),
    #[error("Relay exchange failed: {0}")]
    Relay(#[from] RelayError),
    #[error("Cannot build probe payload: {0}")]
    Payload(#[from] PayloadError),
}

impl ProbeError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProbeError::Relay(RelayError::TimeoutExceeded(_)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pass,
    Fail,
    Inconclusive,
}

impl Outcome {
    pub fn exit_code(self) -> i32 {
        match self {
            Outcome::Pass => 0,
            Outcome::Fail => 1,
            Outcome::Inconclusive => 2,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Pass => write!(f, "PASS"),
            Outcome::Fail => write!(f, "FAIL"),
            Outcome::Inconclusive => write!(f, "INCONCLUSIVE"),
        }
    }
}

/// Everything one probe run needs, already parsed and validated.
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub proxy_addr: SocketAddr,
    pub credentials: Option<Credentials>,
    pub force_auth: bool,
    pub target_addr: SocketAddr,
    pub bind_addr: SocketAddr,
    pub query_name: String,
    pub expect: ExpectMode,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub receive_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub relay_addr: SocketAddr,
    pub selected_method: u8,
    pub reply_source: SocketAddr,
    pub reply_len: usize,
    pub preview: String,
    pub matched: ReplyMatch,
}

impl ProbeReport {
    pub fn outcome(&self) -> Outcome {
        if self.matched.is_plausible() {
            Outcome::Pass
        } else {
            Outcome::Inconclusive
        }
    }
}

/// Outcome of a finished run; a relay that never answers is inconclusive.
pub fn outcome_of(result: &Result<ProbeReport, ProbeError>) -> Outcome {
    match result {
        Ok(report) => report.outcome(),
        Err(e) if e.is_timeout() => Outcome::Inconclusive,
        Err(_) => Outcome::Fail,
    }
}

pub struct UdpProbe {
    options: ProbeOptions,
}

impl UdpProbe {
    pub fn new(options: ProbeOptions) -> Self {
        UdpProbe { options }
    }

    /// Control handshake, one datagram out, at most one back. No retries.
    pub async fn run(&self) -> Result<ProbeReport, ProbeError> {
        let opts = &self.options;
        let query = payload::build_dns_query(payload::QUERY_ID, &opts.query_name)?;

        let mut session =
            ControlSession::open(opts.proxy_addr, opts.connect_timeout, opts.io_timeout).await?;

        let methods = offered_methods(opts.credentials.as_ref(), opts.force_auth);
        let selected_method = session.negotiate(&methods).await?;
        // negotiate() only accepts 0x02 when it was offered, which needs credentials.
        let credentials = opts.credentials.as_ref();
        if let (METHOD_USER_PASS, Some(credentials)) = (selected_method, credentials) {
            session.authenticate(credentials).await?;
        }
        info!("[TCP] Handshake complete with {}", session.proxy_addr());

        let relay_addr = session.request_udp_associate(ASSOCIATE_BIND).await?;

        debug!("[TCP] Session is {:?}", session.state());

        let relay = UdpRelay::bind(opts.bind_addr).await?;
        if let Ok(local) = relay.local_addr() {
            debug!("[UDP] Sending from {}", local);
        }
        relay.send(relay_addr, opts.target_addr, &query).await?;
        let (envelope, reply_source) = relay.receive(relay_addr, opts.receive_timeout).await?;

        let matched = payload::evaluate(opts.expect, &query, &opts.query_name, &envelope.payload);
        if !matched.is_plausible() {
            warn!("[UDP] Reply received but it does not look like the expected response");
        }
        session.close().await;

        Ok(ProbeReport {
            relay_addr,
            selected_method,
            reply_source,
            reply_len: envelope.payload.len(),
            preview: payload::hex_preview(&envelope.payload, PREVIEW_LEN),
            matched,
        })
    }
}
