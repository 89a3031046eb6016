//! SOCKS5 client negotiation state machine
//!
//! Drives the client side of RFC 1928 over an already-connected byte stream:
//!
//! ```text
//! Init ──greeting──▶ GreetingSent ──05 02──▶ AuthRequired ──auth ok──┐
//!                         │                                          ▼
//!                         └──────────05 00──────────────────▶ MethodSelected
//!                                                                    │ request
//!                                                                    ▼
//!                              Established ◀──reply 05 00 00── ConnectSent
//! ```
//!
//! Every step runs under the negotiator's deadline. Any violation moves the
//! machine to `Failed`; there are no retries, the caller drops the stream.

use std::fmt;
use std::future::Future;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};
use tracing::trace;

use super::common::{
    AUTH_ACCEPTED, AUTH_METHOD_NONE, AUTH_METHOD_PASSWORD, AUTH_PASSWORD_VERSION, ATYP_DOMAIN,
    ATYP_IPV4, ATYP_IPV6, CMD_CONNECT, CMD_UDP_ASSOCIATE, DEFAULT_CONNECT_PORT, REPLY_SUCCEEDED,
    SOCKS5_VERSION,
};
use crate::address::AddressSpec;
use crate::config::AuthCredential;
use crate::error::NegotiationError;

/// Negotiation progress of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Init,
    GreetingSent,
    AuthRequired,
    MethodSelected,
    ConnectSent,
    Established,
    Failed,
}

impl NegotiationState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Established | Self::Failed)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::GreetingSent => "greeting_sent",
            Self::AuthRequired => "auth_required",
            Self::MethodSelected => "method_selected",
            Self::ConnectSent => "connect_sent",
            Self::Established => "established",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request sent once a method is selected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    UdpAssociate,
}

impl Command {
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Connect => CMD_CONNECT,
            Self::UdpAssociate => CMD_UDP_ASSOCIATE,
        }
    }
}

/// Client-side SOCKS5 negotiator
///
/// One negotiator drives one stream. It does not own the stream so the
/// session can hand it to the relay stage once `Established` is reached.
#[derive(Debug)]
pub struct Socks5Negotiator {
    credential: AuthCredential,
    deadline: Option<Instant>,
    state: NegotiationState,
}

impl Socks5Negotiator {
    #[must_use]
    pub fn new(credential: AuthCredential) -> Self {
        Self {
            credential,
            deadline: None,
            state: NegotiationState::Init,
        }
    }

    /// Bound every read and write by `deadline`
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub const fn state(&self) -> NegotiationState {
        self.state
    }

    /// Negotiate a CONNECT tunnel to `target`.
    ///
    /// On success the stream is a transparent pipe to `target`.
    ///
    /// # Errors
    ///
    /// Returns the `NegotiationError` that moved the machine to `Failed`.
    pub async fn connect<S>(
        &mut self,
        stream: &mut S,
        target: &AddressSpec,
    ) -> Result<(), NegotiationError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.run(stream, Command::Connect, target).await.map(|_| ())
    }

    /// Negotiate a UDP association, returning the relay endpoint the server bound.
    ///
    /// # Errors
    ///
    /// Returns the `NegotiationError` that moved the machine to `Failed`.
    pub async fn udp_associate<S>(&mut self, stream: &mut S) -> Result<AddressSpec, NegotiationError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let any = AddressSpec::Ipv4(std::net::Ipv4Addr::UNSPECIFIED, 0);
        self.run(stream, Command::UdpAssociate, &any)
            .await?
            .ok_or_else(|| NegotiationError::AddressInvalid("missing bound address".into()))
    }

    async fn run<S>(
        &mut self,
        stream: &mut S,
        command: Command,
        target: &AddressSpec,
    ) -> Result<Option<AddressSpec>, NegotiationError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.state != NegotiationState::Init {
            return Err(NegotiationError::io(
                "negotiation",
                std::io::Error::other(format!("negotiator already in state {}", self.state)),
            ));
        }

        match self.drive(stream, command, target).await {
            Ok(bound) => {
                self.state = NegotiationState::Established;
                trace!("SOCKS5 negotiation established");
                Ok(bound)
            }
            Err(e) => {
                trace!("SOCKS5 negotiation failed in state {}: {}", self.state, e);
                self.state = NegotiationState::Failed;
                Err(e)
            }
        }
    }

    async fn drive<S>(
        &mut self,
        stream: &mut S,
        command: Command,
        target: &AddressSpec,
    ) -> Result<Option<AddressSpec>, NegotiationError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let greeting = build_greeting(&self.credential);
        self.bounded(send(stream, &greeting, "write greeting")).await?;
        self.state = NegotiationState::GreetingSent;

        let mut reply = [0u8; 2];
        self.bounded(recv(stream, &mut reply, "read method selection"))
            .await?;
        trace!("SOCKS5 method selection: {:02x?}", reply);

        if reply[0] != SOCKS5_VERSION {
            return Err(NegotiationError::ProtocolVersionMismatch {
                expected: SOCKS5_VERSION,
                actual: reply[0],
            });
        }
        match reply[1] {
            AUTH_METHOD_NONE => {}
            AUTH_METHOD_PASSWORD => {
                self.state = NegotiationState::AuthRequired;
                self.authenticate(stream).await?;
            }
            other => return Err(NegotiationError::MethodRejected(other)),
        }
        self.state = NegotiationState::MethodSelected;

        let request = build_request(command, target)?;
        self.bounded(send(stream, &request, "write request")).await?;
        self.state = NegotiationState::ConnectSent;

        let mut header = [0u8; 3];
        self.bounded(recv(stream, &mut header, "read reply header"))
            .await?;
        trace!("SOCKS5 reply header: {:02x?}", header);

        if header[0] != SOCKS5_VERSION || header[1] != REPLY_SUCCEEDED {
            return Err(NegotiationError::ConnectRejected {
                version: header[0],
                code: header[1],
            });
        }

        match command {
            Command::Connect => {
                self.bounded(skip_bound_address(stream)).await?;
                Ok(None)
            }
            Command::UdpAssociate => {
                let bound = self.bounded(AddressSpec::read_from(stream)).await?;
                Ok(Some(bound))
            }
        }
    }

    async fn authenticate<S>(&mut self, stream: &mut S) -> Result<(), NegotiationError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request = build_auth_request(&self.credential)?;
        self.bounded(send(stream, &request, "write auth request"))
            .await?;

        // Only the first byte is checked
        let mut reply = [0u8; 2];
        self.bounded(recv(stream, &mut reply, "read auth reply"))
            .await?;
        trace!("SOCKS5 auth reply: {:02x?}", reply);

        if !AUTH_ACCEPTED.contains(&reply[0]) {
            return Err(NegotiationError::AuthRejected(reply[0]));
        }
        Ok(())
    }

    async fn bounded<T, F>(&self, step: F) -> Result<T, NegotiationError>
    where
        F: Future<Output = Result<T, NegotiationError>>,
    {
        match self.deadline {
            Some(deadline) => timeout_at(deadline, step)
                .await
                .map_err(|_| NegotiationError::NegotiationTimeout { state: self.state })?,
            None => step.await,
        }
    }
}

/// `05 01 00`, or `05 02 00 02` when both credential fields are set
#[must_use]
pub fn build_greeting(credential: &AuthCredential) -> Vec<u8> {
    if credential.is_offered() {
        vec![SOCKS5_VERSION, 2, AUTH_METHOD_NONE, AUTH_METHOD_PASSWORD]
    } else {
        vec![SOCKS5_VERSION, 1, AUTH_METHOD_NONE]
    }
}

/// `01 ULEN UNAME PLEN PASSWD`
///
/// # Errors
///
/// Returns `CredentialTooLong` if either field exceeds 255 bytes.
pub fn build_auth_request(credential: &AuthCredential) -> Result<Vec<u8>, NegotiationError> {
    let username = credential.username.as_bytes();
    let password = credential.password.as_bytes();
    let ulen = u8::try_from(username.len()).map_err(|_| NegotiationError::CredentialTooLong {
        field: "username",
        len: username.len(),
    })?;
    let plen = u8::try_from(password.len()).map_err(|_| NegotiationError::CredentialTooLong {
        field: "password",
        len: password.len(),
    })?;

    let mut request = Vec::with_capacity(3 + username.len() + password.len());
    request.push(AUTH_PASSWORD_VERSION);
    request.push(ulen);
    request.extend_from_slice(username);
    request.push(plen);
    request.extend_from_slice(password);
    Ok(request)
}

/// `05 CMD 00 ATYP ADDR PORT`; a CONNECT to port 0 goes to port 80
///
/// # Errors
///
/// Returns `NameTooLong` or `AddressInvalid` if the target cannot be encoded.
pub fn build_request(command: Command, target: &AddressSpec) -> Result<BytesMut, NegotiationError> {
    let target = if command == Command::Connect && target.port() == 0 {
        target.clone().with_port(DEFAULT_CONNECT_PORT)
    } else {
        target.clone()
    };

    let mut request = BytesMut::with_capacity(3 + target.encoded_len());
    request.put_u8(SOCKS5_VERSION);
    request.put_u8(command.code());
    request.put_u8(0x00);
    target.write_to(&mut request)?;
    Ok(request)
}

async fn send<S>(stream: &mut S, bytes: &[u8], stage: &'static str) -> Result<(), NegotiationError>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(bytes)
        .await
        .map_err(|e| NegotiationError::io(stage, e))?;
    stream
        .flush()
        .await
        .map_err(|e| NegotiationError::io(stage, e))
}

async fn recv<S>(stream: &mut S, buf: &mut [u8], stage: &'static str) -> Result<(), NegotiationError>
where
    S: AsyncRead + Unpin,
{
    stream
        .read_exact(buf)
        .await
        .map(|_| ())
        .map_err(|e| NegotiationError::io(stage, e))
}

/// Consume `ATYP ADDR PORT` of a CONNECT reply without interpreting it
async fn skip_bound_address<S>(stream: &mut S) -> Result<(), NegotiationError>
where
    S: AsyncRead + Unpin,
{
    let mut atyp = [0u8; 1];
    recv(stream, &mut atyp, "read bound address type").await?;

    let len = match atyp[0] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            recv(stream, &mut len, "read bound domain length").await?;
            usize::from(len[0])
        }
        other => {
            return Err(NegotiationError::AddressInvalid(format!(
                "unknown bound address type {other:#04x}"
            )))
        }
    };

    let mut rest = vec![0u8; len + 2];
    recv(stream, &mut rest, "read bound address").await
}
