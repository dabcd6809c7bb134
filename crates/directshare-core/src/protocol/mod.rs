//! Wire formats spoken by DirectShare peers.
//!
//! Three formats share the network:
//!
//! - **Discovery datagrams** (UDP, text): `DISCOVER:<service>:<name>:<address>`
//!   and `GROUP_CREATED:<name>:<address>`
//! - **Group handshake** (TCP, text, unframed): `JOIN:<name>:<address>`
//! - **Transfer header** (TCP, binary), followed by the raw file body:
//!
//! ```text
//! ┌──────────────┬──────────────────┬─────────────┬─────────────┐
//! │ Name length  │    File name     │  File size  │   CRC-32    │
//! │ 2 bytes (BE) │ UTF-8, variable  │ 8 bytes (BE)│ 8 bytes (BE)│
//! └──────────────┴──────────────────┴─────────────┴─────────────┘
//! ```
//!
//! The file size is a signed 64-bit value; the checksum slot holds the
//! zero-extended CRC-32 of the whole file.
//!
//! Text formats are colon separated. Addresses are IPv4 and never contain a
//! colon, so the address is always the last field and a device name may
//! contain colons.

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Largest datagram or handshake payload read in one go.
pub const MAX_MESSAGE_SIZE: usize = 1024;

const DISCOVER_TAG: &str = "DISCOVER";
const GROUP_CREATED_TAG: &str = "GROUP_CREATED";
const JOIN_TAG: &str = "JOIN";

/// A discovery datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryMessage {
    /// Periodic self-announcement
    Discover {
        /// Service name; peers ignore announcements for other services
        service: String,
        /// Announcing device's name
        name: String,
        /// Announcing device's IPv4 address
        address: String,
    },
    /// A device created a group and waits for a joiner
    GroupCreated {
        /// Group owner's name
        name: String,
        /// Group owner's IPv4 address
        address: String,
    },
}

impl DiscoveryMessage {
    /// Parse a datagram payload.
    ///
    /// # Errors
    ///
    /// Returns `Error::ProtocolError` for unknown tags or missing fields.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim_end_matches(['\0', '\r', '\n']);
        let (tag, rest) = text
            .split_once(':')
            .ok_or_else(|| Error::ProtocolError(format!("missing message type in {text:?}")))?;

        match tag {
            DISCOVER_TAG => {
                let (service, rest) = rest
                    .split_once(':')
                    .ok_or_else(|| Error::ProtocolError(format!("truncated DISCOVER: {text:?}")))?;
                let (name, address) = split_name_address(rest, text)?;
                Ok(Self::Discover {
                    service: service.to_string(),
                    name,
                    address,
                })
            }
            GROUP_CREATED_TAG => {
                let (name, address) = split_name_address(rest, text)?;
                Ok(Self::GroupCreated { name, address })
            }
            other => Err(Error::ProtocolError(format!("unknown message type: {other}"))),
        }
    }

    /// Name of the announcing device.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Discover { name, .. } | Self::GroupCreated { name, .. } => name,
        }
    }

    /// Address of the announcing device.
    #[must_use]
    pub fn address(&self) -> &str {
        match self {
            Self::Discover { address, .. } | Self::GroupCreated { address, .. } => address,
        }
    }
}

impl fmt::Display for DiscoveryMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discover {
                service,
                name,
                address,
            } => write!(f, "{DISCOVER_TAG}:{service}:{name}:{address}"),
            Self::GroupCreated { name, address } => {
                write!(f, "{GROUP_CREATED_TAG}:{name}:{address}")
            }
        }
    }
}

/// The handshake a joiner writes right after connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinMessage {
    /// Joiner's device name
    pub name: String,
    /// Joiner's IPv4 address
    pub address: String,
}

impl JoinMessage {
    /// Create a handshake message.
    #[must_use]
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }

    /// Parse a handshake payload.
    ///
    /// # Errors
    ///
    /// Returns `Error::ProtocolError` if the payload is not a `JOIN` message.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim_end_matches(['\0', '\r', '\n']);
        let rest = text
            .strip_prefix(JOIN_TAG)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(|| Error::ProtocolError(format!("expected JOIN handshake, got {text:?}")))?;
        let (name, address) = split_name_address(rest, text)?;
        Ok(Self { name, address })
    }
}

impl fmt::Display for JoinMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{JOIN_TAG}:{}:{}", self.name, self.address)
    }
}

fn split_name_address(rest: &str, whole: &str) -> Result<(String, String)> {
    let (name, address) = rest
        .rsplit_once(':')
        .ok_or_else(|| Error::ProtocolError(format!("missing address in {whole:?}")))?;
    if address.is_empty() {
        return Err(Error::ProtocolError(format!("empty address in {whole:?}")));
    }
    Ok((name.to_string(), address.to_string()))
}

/// Header sent before every file body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// File name as chosen by the sender
    pub file_name: String,
    /// Number of body bytes that follow
    pub file_size: u64,
    /// CRC-32 of the body
    pub checksum: u32,
}

impl FileHeader {
    /// Encode the header to bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if the name is longer than 65535 bytes
    /// or the size does not fit the signed size field.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let name = self.file_name.as_bytes();
        let name_len = u16::try_from(name.len()).map_err(|_| {
            Error::InvalidInput(format!("file name is {} bytes, limit is 65535", name.len()))
        })?;
        let size = i64::try_from(self.file_size)
            .map_err(|_| Error::InvalidInput(format!("file size {} too large", self.file_size)))?;

        let mut buf = Vec::with_capacity(2 + name.len() + 16);
        buf.extend_from_slice(&name_len.to_be_bytes());
        buf.extend_from_slice(name);
        buf.extend_from_slice(&size.to_be_bytes());
        buf.extend_from_slice(&u64::from(self.checksum).to_be_bytes());
        Ok(buf)
    }

    /// Write the header and flush.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or writing fails.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let buf = self.encode()?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read a header.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails, the name is not UTF-8, the size is
    /// negative or the checksum does not fit 32 bits.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let name_len = reader.read_u16().await?;
        let mut name = vec![0u8; usize::from(name_len)];
        reader.read_exact(&mut name).await?;
        let file_name = String::from_utf8(name)
            .map_err(|_| Error::ProtocolError("file name is not valid UTF-8".to_string()))?;

        let size = reader.read_i64().await?;
        let file_size = u64::try_from(size)
            .map_err(|_| Error::ProtocolError(format!("negative file size: {size}")))?;

        let raw_checksum = reader.read_u64().await?;
        let checksum = u32::try_from(raw_checksum)
            .map_err(|_| Error::ProtocolError(format!("checksum out of range: {raw_checksum:#x}")))?;

        Ok(Self {
            file_name,
            file_size,
            checksum,
        })
    }
}
