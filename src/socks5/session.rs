use log::{debug, info, warn};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

use crate::common::auth::Credentials;
use crate::net::conn::BufferedConnection;
use crate::socks5::codec::{
    self, CodecError, ASSOCIATE_REPLY_HEAD_LEN, ASSOCIATE_REPLY_LEN, AUTH_REPLY_LEN, AUTH_SUCCESS, AUTH_VERSION,
    METHOD_NO_ACCEPTABLE, METHOD_USER_PASS, NEGOTIATION_REPLY_LEN, REPLY_SUCCEEDED,
    SOCKS_VERSION,
};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Connection error with proxy {addr}: {source}")]
    ConnectionError {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("Proxy accepted none of the offered authentication methods {offered:02x?}")]
    NoAcceptableAuthMethod { offered: Vec<u8> },
    #[error("Proxy selected authentication method {0:#04x}, which was not offered")]
    UnexpectedMethod(u8),
    #[error("Authentication failed (status {0:#04x})")]
    AuthenticationFailed(u8),
    #[error("UDP ASSOCIATE rejected by proxy: reply code {code:#04x} ({reason})")]
    AssociateRejected { code: u8, reason: &'static str },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("Cannot {operation} while session is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    MethodNegotiated,
    AuthPending,
    Authenticated,
    AssociateRequested,
    RelayAssigned,
    Failed,
}

/// SOCKS5 control channel for a single UDP association.
///
/// Transitions are linear; any error moves the session to `Failed` and no
/// further operation is accepted. The TCP connection is released on drop.
pub struct ControlSession {
    conn: BufferedConnection,
    state: SessionState,
    offered: Vec<u8>,
}

impl ControlSession {
    pub async fn open(
        proxy: SocketAddr,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Result<Self, SessionError> {
        let conn = BufferedConnection::connect(proxy, connect_timeout, io_timeout)
            .await
            .map_err(|source| SessionError::ConnectionError {
                addr: proxy,
                source,
            })?;
        info!("[TCP] Connected to proxy {}", proxy);
        Ok(ControlSession {
            conn,
            state: SessionState::Connected,
            offered: Vec::new(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn proxy_addr(&self) -> SocketAddr {
        self.conn.peer_addr()
    }

    /// Sends the method selection request and returns the method the proxy chose.
    pub async fn negotiate(&mut self, methods: &[u8]) -> Result<u8, SessionError> {
        self.expect_state("negotiate", &[SessionState::Connected])?;
        let result = self.do_negotiate(methods).await;
        self.track(result)
    }

    async fn do_negotiate(&mut self, methods: &[u8]) -> Result<u8, SessionError> {
        let request = codec::encode_negotiation_request(methods)?;
        debug!("[TCP] Method selection request: {:02x?}", request);
        self.send(&request).await?;
        self.offered = methods.to_vec();

        let raw = self.recv_exact(NEGOTIATION_REPLY_LEN).await?;
        let reply = codec::decode_negotiation_reply(&raw)?;
        check_version(reply.version, SOCKS_VERSION, "method selection reply")?;

        if reply.method == METHOD_NO_ACCEPTABLE {
            return Err(SessionError::NoAcceptableAuthMethod {
                offered: self.offered.clone(),
            });
        }
        if !self.offered.contains(&reply.method) {
            return Err(SessionError::UnexpectedMethod(reply.method));
        }

        info!("[TCP] Proxy selected method {:#04x}", reply.method);
        self.state = if reply.method == METHOD_USER_PASS {
            SessionState::AuthPending
        } else {
            SessionState::MethodNegotiated
        };
        Ok(reply.method)
    }

    /// RFC 1929 sub-negotiation. Only valid after the proxy picked username/password.
    pub async fn authenticate(&mut self, credentials: &Credentials) -> Result<(), SessionError> {
        self.expect_state("authenticate", &[SessionState::AuthPending])?;
        let result = self.do_authenticate(credentials).await;
        self.track(result)
    }

    async fn do_authenticate(&mut self, credentials: &Credentials) -> Result<(), SessionError> {
        info!("[TCP] Authenticating as '{}'", credentials.username());
        let request = codec::encode_auth_request(
            credentials.username().as_bytes(),
            credentials.password().as_bytes(),
        )?;
        self.send(&request).await?;

        let raw = self.recv_exact(AUTH_REPLY_LEN).await?;
        let reply = codec::decode_auth_reply(&raw)?;
        check_version(reply.version, AUTH_VERSION, "authentication reply")?;
        if reply.status != AUTH_SUCCESS {
            return Err(SessionError::AuthenticationFailed(reply.status));
        }

        info!("[TCP] Authentication succeeded");
        self.state = SessionState::Authenticated;
        Ok(())
    }

    /// Requests a UDP relay and returns the address datagrams must be sent to.
    pub async fn request_udp_associate(
        &mut self,
        bind: SocketAddr,
    ) -> Result<SocketAddr, SessionError> {
        self.expect_state(
            "request UDP ASSOCIATE",
            &[SessionState::MethodNegotiated, SessionState::Authenticated],
        )?;
        let result = self.do_request_udp_associate(bind).await;
        self.track(result)
    }

    async fn do_request_udp_associate(
        &mut self,
        bind: SocketAddr,
    ) -> Result<SocketAddr, SessionError> {
        let request = codec::encode_associate_request(bind)?;
        debug!("[TCP] UDP ASSOCIATE request: {:02x?}", request);
        self.send(&request).await?;
        self.state = SessionState::AssociateRequested;

        // A rejection may carry any address form; its code wins over the rest.
        let mut raw = self.recv_exact(ASSOCIATE_REPLY_HEAD_LEN).await?;
        let head = codec::decode_associate_reply_head(&raw)?;
        debug!(
            "[TCP] UDP ASSOCIATE reply: code {:#04x}, atyp {:#04x}",
            head.code, head.address_type
        );
        check_version(head.version, SOCKS_VERSION, "UDP ASSOCIATE reply")?;
        if head.code != REPLY_SUCCEEDED {
            return Err(SessionError::AssociateRejected {
                code: head.code,
                reason: codec::reply_code_name(head.code),
            });
        }
        codec::check_ipv4_atyp(head.address_type)?;

        let rest = self
            .recv_exact(ASSOCIATE_REPLY_LEN - ASSOCIATE_REPLY_HEAD_LEN)
            .await?;
        raw.extend_from_slice(&rest);
        let reply = codec::decode_associate_reply(&raw)?;
        debug!("[TCP] Relay bound at {}", reply.address);

        let relay = reply.relay_addr(self.conn.peer_addr());
        if relay != reply.address {
            debug!(
                "[TCP] Proxy bound relay to {}, using control peer host instead",
                reply.address
            );
        }
        info!("[UDP] Proxy assigned relay address {}", relay);
        self.state = SessionState::RelayAssigned;
        Ok(relay)
    }

    /// Shuts the control connection down; the proxy drops the association with it.
    pub async fn close(mut self) {
        if let Err(e) = self.conn.shutdown().await {
            warn!("[TCP] Shutdown of control connection failed: {}", e);
        }
    }

    fn expect_state(
        &self,
        operation: &'static str,
        allowed: &[SessionState],
    ) -> Result<(), SessionError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn track<T>(&mut self, result: Result<T, SessionError>) -> Result<T, SessionError> {
        if result.is_err() {
            self.state = SessionState::Failed;
        }
        result
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), SessionError> {
        let addr = self.conn.peer_addr();
        self.conn
            .write(data)
            .await
            .map_err(|source| SessionError::ConnectionError { addr, source })
    }

    /// A proxy that hangs up mid-reply sent a truncated structure.
    async fn recv_exact(&mut self, n: usize) -> Result<Vec<u8>, SessionError> {
        let addr = self.conn.peer_addr();
        self.conn.read_exact_bytes(n).await.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                SessionError::Codec(CodecError::MalformedReply(e.to_string()))
            } else {
                SessionError::ConnectionError { addr, source: e }
            }
        })
    }
}

fn check_version(actual: u8, expected: u8, what: &str) -> Result<(), CodecError> {
    if actual != expected {
        return Err(CodecError::MalformedReply(format!(
            "{} carries version {:#04x}, expected {:#04x}",
            what, actual, expected
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socks5::codec::{
        ATYP_IPV6, METHOD_NO_AUTH, REPLY_COMMAND_NOT_SUPPORTED, REPLY_GENERAL_FAILURE,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn unspecified() -> SocketAddr {
        "0.0.0.0:0".parse().unwrap()
    }

    /// Runs `script` against the first accepted connection.
    async fn stub<F, Fut>(script: F) -> (SocketAddr, JoinHandle<Vec<u8>>)
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Vec<u8>> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            script(stream).await
        });
        (addr, handle)
    }

    async fn read_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        stream.read_exact(&mut buf).await.unwrap();
        buf
    }

    async fn drain(stream: &mut TcpStream) -> Vec<u8> {
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest).await;
        rest
    }

    #[tokio::test]
    async fn test_no_auth_associate_with_unspecified_address() {
        let (addr, handle) = stub(|mut s| async move {
            assert_eq!(read_n(&mut s, 3).await, vec![0x05, 0x01, 0x00]);
            s.write_all(&[0x05, 0x00]).await.unwrap();
            assert_eq!(
                read_n(&mut s, 10).await,
                vec![0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
            );
            s.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0x9C, 0x40])
                .await
                .unwrap();
            drain(&mut s).await
        })
        .await;

        let mut session = ControlSession::open(addr, TIMEOUT, TIMEOUT).await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.negotiate(&[METHOD_NO_AUTH]).await.unwrap(), METHOD_NO_AUTH);
        assert_eq!(session.state(), SessionState::MethodNegotiated);

        let relay = session.request_udp_associate(unspecified()).await.unwrap();
        assert_eq!(relay, "127.0.0.1:40000".parse().unwrap());
        assert_eq!(session.state(), SessionState::RelayAssigned);

        session.close().await;
        assert!(handle.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_user_pass_flow() {
        let (addr, handle) = stub(|mut s| async move {
            read_n(&mut s, 4).await;
            s.write_all(&[0x05, 0x02]).await.unwrap();
            assert_eq!(read_n(&mut s, 11).await, b"\x01\x05admin\x03123".to_vec());
            s.write_all(&[0x01, 0x00]).await.unwrap();
            read_n(&mut s, 10).await;
            s.write_all(&[0x05, 0x00, 0x00, 0x01, 10, 0, 0, 7, 0x13, 0x88])
                .await
                .unwrap();
            drain(&mut s).await
        })
        .await;

        let creds = Credentials::new("admin", "123").unwrap();
        let mut session = ControlSession::open(addr, TIMEOUT, TIMEOUT).await.unwrap();
        let method = session
            .negotiate(&[METHOD_NO_AUTH, METHOD_USER_PASS])
            .await
            .unwrap();
        assert_eq!(method, METHOD_USER_PASS);
        assert_eq!(session.state(), SessionState::AuthPending);

        session.authenticate(&creds).await.unwrap();
        assert_eq!(session.state(), SessionState::Authenticated);

        let relay = session.request_udp_associate(unspecified()).await.unwrap();
        assert_eq!(relay, "10.0.0.7:5000".parse().unwrap());
        drop(session);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_no_acceptable_method() {
        let (addr, handle) = stub(|mut s| async move {
            read_n(&mut s, 3).await;
            s.write_all(&[0x05, 0xFF]).await.unwrap();
            drain(&mut s).await
        })
        .await;

        let mut session = ControlSession::open(addr, TIMEOUT, TIMEOUT).await.unwrap();
        let err = session.negotiate(&[METHOD_NO_AUTH]).await.unwrap_err();
        assert!(matches!(err, SessionError::NoAcceptableAuthMethod { .. }));
        assert_eq!(session.state(), SessionState::Failed);

        let err = session
            .request_udp_associate(unspecified())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidState { .. }));
        drop(session);
        assert!(handle.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_method_not_offered() {
        let (addr, _handle) = stub(|mut s| async move {
            read_n(&mut s, 3).await;
            s.write_all(&[0x05, 0x02]).await.unwrap();
            drain(&mut s).await
        })
        .await;

        let mut session = ControlSession::open(addr, TIMEOUT, TIMEOUT).await.unwrap();
        let err = session.negotiate(&[METHOD_NO_AUTH]).await.unwrap_err();
        assert!(matches!(err, SessionError::UnexpectedMethod(0x02)));
    }

    #[tokio::test]
    async fn test_wrong_version_is_malformed() {
        let (addr, _handle) = stub(|mut s| async move {
            read_n(&mut s, 3).await;
            s.write_all(&[0x04, 0x00]).await.unwrap();
            drain(&mut s).await
        })
        .await;

        let mut session = ControlSession::open(addr, TIMEOUT, TIMEOUT).await.unwrap();
        let err = session.negotiate(&[METHOD_NO_AUTH]).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Codec(CodecError::MalformedReply(_))
        ));
    }

    #[tokio::test]
    async fn test_authentication_failed() {
        let (addr, handle) = stub(|mut s| async move {
            read_n(&mut s, 3).await;
            s.write_all(&[0x05, 0x02]).await.unwrap();
            read_n(&mut s, 11).await;
            s.write_all(&[0x01, 0x01]).await.unwrap();
            drain(&mut s).await
        })
        .await;

        let creds = Credentials::new("admin", "999").unwrap();
        let mut session = ControlSession::open(addr, TIMEOUT, TIMEOUT).await.unwrap();
        session.negotiate(&[METHOD_USER_PASS]).await.unwrap();
        let err = session.authenticate(&creds).await.unwrap_err();
        assert!(matches!(err, SessionError::AuthenticationFailed(0x01)));
        drop(session);
        assert!(handle.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_authenticate_requires_user_pass_selection() {
        let (addr, _handle) = stub(|mut s| async move {
            read_n(&mut s, 3).await;
            s.write_all(&[0x05, 0x00]).await.unwrap();
            drain(&mut s).await
        })
        .await;

        let creds = Credentials::new("admin", "123").unwrap();
        let mut session = ControlSession::open(addr, TIMEOUT, TIMEOUT).await.unwrap();
        session.negotiate(&[METHOD_NO_AUTH]).await.unwrap();
        let err = session.authenticate(&creds).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidState {
                state: SessionState::MethodNegotiated,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_associate_rejected_keeps_code() {
        let (addr, _handle) = stub(|mut s| async move {
            read_n(&mut s, 3).await;
            s.write_all(&[0x05, 0x00]).await.unwrap();
            read_n(&mut s, 10).await;
            s.write_all(&[0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            drain(&mut s).await
        })
        .await;

        let mut session = ControlSession::open(addr, TIMEOUT, TIMEOUT).await.unwrap();
        session.negotiate(&[METHOD_NO_AUTH]).await.unwrap();
        let err = session
            .request_udp_associate(unspecified())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::AssociateRejected {
                code: REPLY_GENERAL_FAILURE,
                ..
            }
        ));
        assert!(err.to_string().contains("general SOCKS server failure"));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_associate_rejected_in_ipv6_form() {
        let (addr, _handle) = stub(|mut s| async move {
            read_n(&mut s, 3).await;
            s.write_all(&[0x05, 0x00]).await.unwrap();
            read_n(&mut s, 10).await;
            let mut reply = vec![0x05, 0x07, 0x00, ATYP_IPV6];
            reply.extend_from_slice(&[0u8; 18]);
            s.write_all(&reply).await.unwrap();
            drain(&mut s).await
        })
        .await;

        let mut session = ControlSession::open(addr, TIMEOUT, TIMEOUT).await.unwrap();
        session.negotiate(&[METHOD_NO_AUTH]).await.unwrap();
        let err = session
            .request_udp_associate(unspecified())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::AssociateRejected {
                code: REPLY_COMMAND_NOT_SUPPORTED,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_associate_rejected_in_short_domain_form() {
        // Seven bytes and the stream stays open: waiting for ten would stall.
        let (addr, _handle) = stub(|mut s| async move {
            read_n(&mut s, 3).await;
            s.write_all(&[0x05, 0x00]).await.unwrap();
            read_n(&mut s, 10).await;
            s.write_all(&[0x05, 0x01, 0x00, 0x03, 0x00, 0x00, 0x00])
                .await
                .unwrap();
            drain(&mut s).await
        })
        .await;

        let io_timeout = Duration::from_millis(500);
        let mut session = ControlSession::open(addr, TIMEOUT, io_timeout).await.unwrap();
        session.negotiate(&[METHOD_NO_AUTH]).await.unwrap();
        let err = session
            .request_udp_associate(unspecified())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::AssociateRejected {
                code: REPLY_GENERAL_FAILURE,
                ..
            }
        ));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_successful_reply_in_ipv6_form_is_unsupported() {
        let (addr, _handle) = stub(|mut s| async move {
            read_n(&mut s, 3).await;
            s.write_all(&[0x05, 0x00]).await.unwrap();
            read_n(&mut s, 10).await;
            let mut reply = vec![0x05, 0x00, 0x00, ATYP_IPV6];
            reply.extend_from_slice(&[0u8; 18]);
            s.write_all(&reply).await.unwrap();
            drain(&mut s).await
        })
        .await;

        let mut session = ControlSession::open(addr, TIMEOUT, TIMEOUT).await.unwrap();
        session.negotiate(&[METHOD_NO_AUTH]).await.unwrap();
        let err = session
            .request_udp_associate(unspecified())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Codec(CodecError::UnsupportedAddressType(ATYP_IPV6))
        ));
    }

    #[tokio::test]
    async fn test_truncated_associate_reply() {
        let (addr, _handle) = stub(|mut s| async move {
            read_n(&mut s, 3).await;
            s.write_all(&[0x05, 0x00]).await.unwrap();
            read_n(&mut s, 10).await;
            s.write_all(&[0x05, 0x00, 0x00, 0x01, 127]).await.unwrap();
            Vec::new()
        })
        .await;

        let mut session = ControlSession::open(addr, TIMEOUT, TIMEOUT).await.unwrap();
        session.negotiate(&[METHOD_NO_AUTH]).await.unwrap();
        let err = session
            .request_udp_associate(unspecified())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Codec(CodecError::MalformedReply(_))
        ));
    }

    #[tokio::test]
    async fn test_open_unreachable_proxy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = match ControlSession::open(addr, TIMEOUT, TIMEOUT).await {
            Ok(_) => panic!("connect to a closed port succeeded"),
            Err(e) => e,
        };
        assert!(matches!(err, SessionError::ConnectionError { .. }));
    }
}
