//! SOCKS5 protocol types (RFC 1928)

use super::net::Address;
use crate::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const SOCKS5_VERSION: u8 = 0x05;

// Authentication methods
pub const AUTH_NO_AUTH: u8 = 0x00;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

// Commands
pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

// Address types
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

// Reply codes
pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// SOCKS5 command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            CMD_CONNECT => Ok(Command::Connect),
            CMD_BIND => Ok(Command::Bind),
            CMD_UDP_ASSOCIATE => Ok(Command::UdpAssociate),
            _ => Err(Error::protocol(format!(
                "Unknown SOCKS5 command: {}",
                value
            ))),
        }
    }
}

/// Method-selection message from the client.
#[derive(Debug)]
pub struct AuthRequest {
    pub methods: Vec<u8>,
}

impl AuthRequest {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut head = [0u8; 2];
        reader.read_exact(&mut head).await?;

        if head[0] != SOCKS5_VERSION {
            return Err(Error::protocol(format!(
                "Unsupported SOCKS version: {}",
                head[0]
            )));
        }

        let mut methods = vec![0u8; head[1] as usize];
        reader.read_exact(&mut methods).await?;

        Ok(AuthRequest { methods })
    }

    pub fn supports(&self, method: u8) -> bool {
        self.methods.contains(&method)
    }
}

/// Method-selection reply.
pub struct AuthResponse {
    pub method: u8,
}

impl AuthResponse {
    pub fn new(method: u8) -> Self {
        AuthResponse { method }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&[SOCKS5_VERSION, self.method]).await?;
        Ok(())
    }
}

/// SOCKS5 request (VER CMD RSV ATYP ADDR PORT)
#[derive(Debug)]
pub struct Request {
    pub command: Command,
    pub address: Address,
    pub port: u16,
}

impl Request {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; 3];
        reader.read_exact(&mut header).await?;

        if header[0] != SOCKS5_VERSION {
            return Err(Error::protocol(format!(
                "Unsupported SOCKS version: {}",
                header[0]
            )));
        }

        let command = Command::try_from(header[1])?;
        // header[2] is RSV
        let (address, port) = Address::read_from(reader).await?;

        Ok(Request {
            command,
            address,
            port,
        })
    }
}

/// SOCKS5 reply (VER REP RSV ATYP BND.ADDR BND.PORT)
pub struct Response {
    pub reply: u8,
    pub address: Address,
    pub port: u16,
}

impl Response {
    pub fn success(address: Address, port: u16) -> Self {
        Response {
            reply: REP_SUCCEEDED,
            address,
            port,
        }
    }

    pub fn failure(reply: u8) -> Self {
        Response {
            reply,
            address: Address::Ipv4(std::net::Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let mut buf = Vec::with_capacity(3 + self.address.wire_len());
        buf.extend_from_slice(&[SOCKS5_VERSION, self.reply, 0x00]);
        buf.extend_from_slice(&self.address.to_wire(self.port)?);
        writer.write_all(&buf).await?;
        Ok(())
    }
}

/// SOCKS5 UDP request/reply header (RSV RSV FRAG ATYP ADDR PORT)
#[derive(Debug)]
pub struct UdpHeader {
    pub frag: u8,
    pub address: Address,
    pub port: u16,
}

impl UdpHeader {
    /// Parse a UDP header, returning it and its encoded length.
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 4 {
            return Err(Error::protocol("UDP header too short"));
        }

        let frag = data[2];
        let (address, port, addr_len) = Address::decode(&data[3..])?;

        Ok((
            UdpHeader {
                frag,
                address,
                port,
            },
            3 + addr_len,
        ))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(3 + self.address.wire_len());
        buf.extend_from_slice(&[0x00, 0x00, self.frag]);
        buf.extend_from_slice(&self.address.to_wire(self.port)?);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_command_parse() {
        assert_eq!(Command::try_from(0x01).unwrap(), Command::Connect);
        assert_eq!(Command::try_from(0x03).unwrap(), Command::UdpAssociate);
        assert!(Command::try_from(0x09).is_err());
    }

    #[tokio::test]
    async fn test_request_connect_ipv4() {
        // CONNECT 127.0.0.1:80
        let wire = [0x05, 0x01, 0x00, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x00, 0x50];
        let mut cursor = std::io::Cursor::new(wire.to_vec());
        let req = Request::read_from(&mut cursor).await.unwrap();
        assert_eq!(req.command, Command::Connect);
        assert_eq!(req.address, Address::Ipv4(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(req.port, 80);
    }

    #[tokio::test]
    async fn test_request_bad_version() {
        let wire = [0x04, 0x01, 0x00, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x00, 0x50];
        let mut cursor = std::io::Cursor::new(wire.to_vec());
        assert!(Request::read_from(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_response_wire() {
        let mut out = Vec::new();
        Response::success(Address::Ipv4(Ipv4Addr::UNSPECIFIED), 0)
            .write_to(&mut out)
            .await
            .unwrap();
        assert_eq!(out, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_udp_header_roundtrip() {
        let header = UdpHeader {
            frag: 0,
            address: Address::Ipv4(Ipv4Addr::new(8, 8, 8, 8)),
            port: 53,
        };

        let bytes = header.to_bytes().unwrap();
        assert_eq!(&bytes[..4], &[0x00, 0x00, 0x00, 0x01]);

        let (parsed, len) = UdpHeader::from_bytes(&bytes).unwrap();
        assert_eq!(len, bytes.len());
        assert_eq!(parsed.frag, 0);
        assert_eq!(parsed.port, 53);
        assert_eq!(parsed.address, Address::Ipv4(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn test_udp_header_frag_preserved() {
        let wire = [0x00, 0x00, 0x02, 0x01, 10, 0, 0, 1, 0x00, 0x35, 0xAA];
        let (header, len) = UdpHeader::from_bytes(&wire).unwrap();
        assert_eq!(header.frag, 2);
        assert_eq!(len, 10);
    }
}
