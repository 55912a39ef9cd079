//! D-Bus address parsing and endpoint resolution.
//!
//! Addresses follow the D-Bus grammar: a `;`-separated list of
//! `transport:key=value,key=value` entries with percent-escaped values. The
//! bus tries the resulting endpoints in order and keeps the first one that
//! authenticates.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{InvalidAddressError, Result};

/// Default system bus socket, used when `DBUS_SYSTEM_BUS_ADDRESS` is unset.
pub const DEFAULT_SYSTEM_BUS_ADDRESS: &str = "unix:path=/var/run/dbus/system_bus_socket";

/// One parsed entry of an address list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusAddress {
    pub transport: String,
    pub options: HashMap<String, String>,
}

/// A concrete endpoint derived from a [`BusAddress`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    UnixPath(PathBuf),
    UnixAbstract(String),
    Tcp { host: String, port: u16 },
    /// Resolve the socket path by asking launchd for the named variable.
    Launchd { env: String },
}

impl BusAddress {
    /// Look up an option value.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Derive the transport endpoint this entry describes.
    pub fn endpoint(&self) -> std::result::Result<Endpoint, InvalidAddressError> {
        match self.transport.as_str() {
            "unix" => match (self.option("path"), self.option("abstract")) {
                (Some(path), None) => Ok(Endpoint::UnixPath(PathBuf::from(path))),
                (None, Some(name)) => Ok(Endpoint::UnixAbstract(name.to_string())),
                (Some(_), Some(_)) => Err(InvalidAddressError(
                    "unix address must not set both path and abstract".into(),
                )),
                (None, None) => Err(InvalidAddressError(
                    "unix address requires path= or abstract=".into(),
                )),
            },
            "tcp" => {
                let host = self
                    .option("host")
                    .ok_or_else(|| InvalidAddressError("tcp address requires host=".into()))?;
                let port = self
                    .option("port")
                    .ok_or_else(|| InvalidAddressError("tcp address requires port=".into()))?;
                let port: u16 = port.parse().map_err(|_| {
                    InvalidAddressError(format!("invalid tcp port: {port:?}"))
                })?;
                if let Some(family) = self.option("family") {
                    if family != "ipv4" && family != "ipv6" {
                        return Err(InvalidAddressError(format!(
                            "invalid tcp family: {family:?}"
                        )));
                    }
                }
                Ok(Endpoint::Tcp {
                    host: host.to_string(),
                    port,
                })
            }
            "launchd" => {
                let env = self
                    .option("env")
                    .ok_or_else(|| InvalidAddressError("launchd address requires env=".into()))?;
                Ok(Endpoint::Launchd {
                    env: env.to_string(),
                })
            }
            other => Err(InvalidAddressError(format!(
                "unsupported transport: {other:?}"
            ))),
        }
    }
}

fn unescape(value: &str) -> std::result::Result<String, InvalidAddressError> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = value.get(i + 1..i + 3).ok_or_else(|| {
                InvalidAddressError(format!("truncated escape in {value:?}"))
            })?;
            let byte = u8::from_str_radix(hex, 16).map_err(|_| {
                InvalidAddressError(format!("invalid escape %{hex} in {value:?}"))
            })?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out)
        .map_err(|_| InvalidAddressError(format!("escaped value is not valid UTF-8: {value:?}")))
}

/// Parse a D-Bus address list.
pub fn parse_address(
    address: &str,
) -> std::result::Result<Vec<BusAddress>, InvalidAddressError> {
    let mut entries = Vec::new();
    for entry in address.split(';') {
        if entry.is_empty() {
            continue;
        }
        let (transport, rest) = entry.split_once(':').ok_or_else(|| {
            InvalidAddressError(format!("missing transport separator in {entry:?}"))
        })?;
        if transport.is_empty() {
            return Err(InvalidAddressError(format!("empty transport in {entry:?}")));
        }
        let mut options = HashMap::new();
        if !rest.is_empty() {
            for pair in rest.split(',') {
                let (key, value) = pair.split_once('=').ok_or_else(|| {
                    InvalidAddressError(format!("missing '=' in option {pair:?}"))
                })?;
                if key.is_empty() {
                    return Err(InvalidAddressError(format!("empty key in {pair:?}")));
                }
                options.insert(key.to_string(), unescape(value)?);
            }
        }
        entries.push(BusAddress {
            transport: transport.to_string(),
            options,
        });
    }
    if entries.is_empty() {
        return Err(InvalidAddressError("address contains no entries".into()));
    }
    Ok(entries)
}

/// The session bus address from the environment.
pub fn session_bus_address() -> Result<String> {
    std::env::var("DBUS_SESSION_BUS_ADDRESS").map_err(|_| {
        InvalidAddressError("DBUS_SESSION_BUS_ADDRESS is not set".into()).into()
    })
}

/// The system bus address from the environment, or the standard socket.
pub fn system_bus_address() -> String {
    std::env::var("DBUS_SYSTEM_BUS_ADDRESS")
        .unwrap_or_else(|_| DEFAULT_SYSTEM_BUS_ADDRESS.to_string())
}

/// Ask launchd for the socket path stored in the given environment variable.
/// Invoked once per resolve for `launchd:` addresses.
pub async fn launchd_socket_path(env: &str) -> Result<PathBuf> {
    let output = tokio::process::Command::new("launchctl")
        .args(["getenv", env])
        .output()
        .await?;
    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !output.status.success() || path.is_empty() {
        return Err(InvalidAddressError(format!(
            "launchctl getenv {env} did not yield a socket path"
        ))
        .into());
    }
    Ok(PathBuf::from(path))
}
