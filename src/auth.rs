//! D-Bus SASL authentication handling.
//!
//! This module implements the client side of the D-Bus SASL line protocol
//! that precedes every connection. Mechanisms are pluggable through the
//! [`Mechanism`] trait; EXTERNAL and ANONYMOUS are provided.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{AuthError, Result};

/// Upper bound on a single auth line, to keep a misbehaving server from
/// growing the buffer without limit.
const MAX_LINE_LENGTH: usize = 16 * 1024;

/// A SASL authentication mechanism.
pub trait Mechanism: Send {
    /// The mechanism name sent with the AUTH command.
    fn name(&self) -> &'static str;

    /// The hex-encoded initial response sent with the AUTH command.
    fn initial_response(&self) -> String;

    /// Answer a server DATA challenge with the hex payload to send back.
    fn challenge(&mut self, data: &[u8]) -> std::result::Result<String, AuthError>;
}

/// The EXTERNAL mechanism: authenticate with the hex-encoded decimal UID,
/// verified by the daemon against the socket credentials.
pub struct External {
    uid: u32,
}

impl External {
    /// Authenticate as the current effective user.
    pub fn new() -> Self {
        Self {
            uid: nix::unistd::Uid::effective().as_raw(),
        }
    }

    /// Authenticate as a specific UID.
    pub fn with_uid(uid: u32) -> Self {
        Self { uid }
    }
}

impl Default for External {
    fn default() -> Self {
        Self::new()
    }
}

impl Mechanism for External {
    fn name(&self) -> &'static str {
        "EXTERNAL"
    }

    fn initial_response(&self) -> String {
        encode_uid(self.uid)
    }

    fn challenge(&mut self, _data: &[u8]) -> std::result::Result<String, AuthError> {
        // Some servers challenge instead of accepting the initial response.
        Ok(encode_uid(self.uid))
    }
}

/// The ANONYMOUS mechanism: authenticate with a hex-encoded ASCII trace
/// string the server may log.
pub struct Anonymous {
    trace: String,
}

impl Anonymous {
    pub fn new() -> Self {
        Self {
            trace: format!("kapsule-dbus-client {}", Uuid::new_v4().as_simple()),
        }
    }

    /// Use a specific trace string. Must be ASCII.
    pub fn with_trace(trace: impl Into<String>) -> Self {
        Self {
            trace: trace.into(),
        }
    }
}

impl Default for Anonymous {
    fn default() -> Self {
        Self::new()
    }
}

impl Mechanism for Anonymous {
    fn name(&self) -> &'static str {
        "ANONYMOUS"
    }

    fn initial_response(&self) -> String {
        hex::encode(self.trace.as_bytes())
    }

    fn challenge(&mut self, _data: &[u8]) -> std::result::Result<String, AuthError> {
        Ok(self.initial_response())
    }
}

/// The outcome of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    /// The server GUID from the OK line.
    pub guid: String,
    /// Whether the server agreed to unix fd passing.
    pub unix_fd: bool,
}

/// Client-side SASL handshake runner.
pub struct Authenticator {
    mechanisms: Vec<Box<dyn Mechanism>>,
}

impl Authenticator {
    /// An authenticator offering EXTERNAL as the current user.
    pub fn new() -> Self {
        Self {
            mechanisms: vec![Box::new(External::new())],
        }
    }

    /// An authenticator with an explicit mechanism list, tried in order on
    /// REJECTED.
    pub fn with_mechanisms(mechanisms: Vec<Box<dyn Mechanism>>) -> Self {
        Self { mechanisms }
    }

    /// Run the handshake on a fresh connection.
    ///
    /// Sends the initial NUL byte, authenticates with the first accepted
    /// mechanism, optionally negotiates unix fd passing, and concludes with
    /// BEGIN. The first D-Bus message may be written immediately after this
    /// returns.
    pub async fn authenticate<S>(
        &mut self,
        stream: &mut S,
        negotiate_unix_fd: bool,
    ) -> Result<AuthOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream.write_all(&[0]).await?;

        let mut server_mechs = String::new();
        for mechanism in &mut self.mechanisms {
            let line = format!(
                "AUTH {} {}\r\n",
                mechanism.name(),
                mechanism.initial_response()
            );
            trace!(mechanism = mechanism.name(), "Offering mechanism");
            stream.write_all(line.as_bytes()).await?;
            stream.flush().await?;

            loop {
                let line = read_line(stream).await?;
                trace!(line = %line, "Received auth line");

                if let Some(guid) = line.strip_prefix("OK ") {
                    let guid = guid.trim().to_string();
                    debug!(mechanism = mechanism.name(), guid = %guid, "Authenticated");
                    let unix_fd = if negotiate_unix_fd {
                        negotiate_fds(stream).await?
                    } else {
                        false
                    };
                    stream.write_all(b"BEGIN\r\n").await?;
                    stream.flush().await?;
                    return Ok(AuthOutcome { guid, unix_fd });
                } else if let Some(mechs) = line.strip_prefix("REJECTED") {
                    server_mechs = mechs.trim().to_string();
                    debug!(
                        mechanism = mechanism.name(),
                        server_mechs = %server_mechs,
                        "Mechanism rejected"
                    );
                    break;
                } else if line == "DATA" || line.starts_with("DATA ") {
                    let payload = line.strip_prefix("DATA").unwrap_or("").trim();
                    let data = hex::decode(payload)
                        .map_err(|e| AuthError::InvalidData(format!("invalid hex: {e}")))?;
                    let response = mechanism.challenge(&data)?;
                    stream
                        .write_all(format!("DATA {response}\r\n").as_bytes())
                        .await?;
                    stream.flush().await?;
                } else if line == "ERROR" || line.starts_with("ERROR ") {
                    let detail = line.strip_prefix("ERROR").unwrap_or("").trim();
                    return Err(AuthError::ServerError(detail.to_string()).into());
                } else {
                    return Err(AuthError::UnexpectedResponse(line).into());
                }
            }
        }

        Err(AuthError::Rejected(server_mechs).into())
    }
}

impl Default for Authenticator {
    fn default() -> Self {
        Self::new()
    }
}

async fn negotiate_fds<S>(stream: &mut S) -> Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(b"NEGOTIATE_UNIX_FD\r\n").await?;
    stream.flush().await?;
    let line = read_line(stream).await?;
    if line == "AGREE_UNIX_FD" {
        trace!("Server agreed to unix fd passing");
        Ok(true)
    } else if line == "ERROR" || line.starts_with("ERROR ") {
        debug!("Server refused unix fd passing");
        Ok(false)
    } else {
        Err(AuthError::UnexpectedResponse(line).into())
    }
}

/// Read one CR LF terminated line, a byte at a time so no bytes belonging to
/// the D-Bus stream are consumed after BEGIN.
async fn read_line<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > MAX_LINE_LENGTH {
            return Err(AuthError::InvalidData("auth line too long".into()).into());
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line)
        .map_err(|_| AuthError::InvalidData("auth line is not valid UTF-8".into()).into())
}

/// Encode a UID the way EXTERNAL expects: hex of the decimal string.
pub fn encode_uid(uid: u32) -> String {
    hex::encode(uid.to_string().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_uid() {
        let encoded = encode_uid(1000);
        let decoded = hex::decode(&encoded).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), "1000");
    }

    #[test]
    fn test_external_initial_response() {
        let mech = External::with_uid(0);
        assert_eq!(mech.name(), "EXTERNAL");
        assert_eq!(mech.initial_response(), hex::encode("0"));
    }

    #[test]
    fn test_anonymous_trace_is_ascii() {
        let mech = Anonymous::new();
        let decoded = hex::decode(mech.initial_response()).unwrap();
        assert!(decoded.is_ascii());
    }

    #[test]
    fn test_external_challenge_repeats_uid() {
        let mut mech = External::with_uid(42);
        assert_eq!(mech.challenge(b"").unwrap(), encode_uid(42));
    }
}
