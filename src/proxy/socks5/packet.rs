//! SOCKS5 wire packets, bit-exact per RFC 1928 / RFC 1929.
//!
//! Version byte `0x04` is tolerated on read for compatibility, but only
//! `0x05` is ever written.

use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::addr::Address;
use crate::error::{Error, Result};

/// Protocol version written on the wire.
pub const SOCKS_VERSION: u8 = 0x05;
/// Method: no authentication required.
pub const METHOD_NO_AUTH: u8 = 0x00;
/// Method: RFC 1929 user/password authentication.
pub const METHOD_USER_PASS: u8 = 0x02;
/// Method selection meaning no offered method is acceptable.
pub const METHOD_NO_ACCEPTABLE: u8 = 0xff;
/// Command: CONNECT, the only one supported.
pub const CMD_CONNECT: u8 = 0x01;
/// Reply code for a succeeded request.
pub const REPLY_SUCCESS: u8 = 0x00;

const ATYPE_IPV4: u8 = 0x01;
const ATYPE_DOMAIN: u8 = 0x03;
const ATYPE_IPV6: u8 = 0x04;

const USERPASS_VERSION: u8 = 0x01;

fn check_version(version: u8) -> Result<()> {
    if version != 0x05 && version != 0x04 {
        return Err(Error::protocol(format!("unknown SOCKS version: {version}")));
    }
    Ok(())
}

/// Method negotiation hello: `0x05, n_methods, methods...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// Authentication methods the client offers, 1 to 255 entries
    pub methods: Vec<u8>,
}

impl Hello {
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let version = reader.read_u8().await?;
        check_version(version)?;
        let n = reader.read_u8().await? as usize;
        if n == 0 {
            return Err(Error::protocol("hello carries no methods"));
        }
        let mut methods = vec![0u8; n];
        reader.read_exact(&mut methods).await?;
        Ok(Hello { methods })
    }

    pub async fn write<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let n = self.methods.len();
        if n == 0 || n > 255 {
            return Err(Error::protocol(format!("invalid number of methods: {n}")));
        }
        let mut buf = Vec::with_capacity(2 + n);
        buf.push(SOCKS_VERSION);
        buf.push(n as u8);
        buf.extend_from_slice(&self.methods);
        writer.write_all(&buf).await?;
        Ok(())
    }
}

/// Method selection: `0x05, method`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Select {
    /// The method the server picked, or `0xff` for none
    pub method: u8,
}

impl Select {
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let version = reader.read_u8().await?;
        check_version(version)?;
        Ok(Select {
            method: reader.read_u8().await?,
        })
    }

    pub async fn write<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&[SOCKS_VERSION, self.method]).await?;
        Ok(())
    }
}

/// RFC 1929 authentication request:
/// `0x01, ulen, user, plen, pass`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPassReq {
    /// User name, 1 to 255 bytes
    pub username: String,
    /// Password, 1 to 255 bytes
    pub password: String,
}

impl UserPassReq {
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let version = reader.read_u8().await?;
        if version != USERPASS_VERSION {
            return Err(Error::protocol(format!(
                "unknown negotiation version: {version}"
            )));
        }
        let ulen = reader.read_u8().await? as usize;
        let mut user = vec![0u8; ulen];
        reader.read_exact(&mut user).await?;
        let plen = reader.read_u8().await? as usize;
        let mut pass = vec![0u8; plen];
        reader.read_exact(&mut pass).await?;
        Ok(UserPassReq {
            username: String::from_utf8_lossy(&user).into_owned(),
            password: String::from_utf8_lossy(&pass).into_owned(),
        })
    }

    pub async fn write<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let ulen = self.username.len();
        let plen = self.password.len();
        if ulen == 0 || ulen > 255 {
            return Err(Error::protocol(format!("invalid username length: {ulen}")));
        }
        if plen == 0 || plen > 255 {
            return Err(Error::protocol(format!("invalid password length: {plen}")));
        }
        let mut buf = Vec::with_capacity(3 + ulen + plen);
        buf.push(USERPASS_VERSION);
        buf.push(ulen as u8);
        buf.extend_from_slice(self.username.as_bytes());
        buf.push(plen as u8);
        buf.extend_from_slice(self.password.as_bytes());
        writer.write_all(&buf).await?;
        Ok(())
    }
}

/// RFC 1929 authentication response: `0x01, status`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserPassResp {
    /// Whether the credentials were accepted (status byte `0x00`)
    pub success: bool,
}

impl UserPassResp {
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let version = reader.read_u8().await?;
        if version != USERPASS_VERSION {
            return Err(Error::protocol(format!(
                "unknown negotiation version: {version}"
            )));
        }
        Ok(UserPassResp {
            success: reader.read_u8().await? == 0x00,
        })
    }

    pub async fn write<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let status = if self.success { 0x00 } else { 0x01 };
        writer.write_all(&[USERPASS_VERSION, status]).await?;
        Ok(())
    }
}

/// Connect request and reply share one shape:
/// `0x05, type, 0x00, atype, addr, port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReqResp {
    /// Command on requests, reply code on responses
    pub kind: u8,
    /// Target on requests, bound address on responses
    pub addr: Address,
}

impl ReqResp {
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut head = [0u8; 4];
        reader.read_exact(&mut head).await?;
        check_version(head[0])?;
        let kind = head[1];

        let addr = match head[3] {
            ATYPE_IPV4 => {
                let mut buf = [0u8; 6];
                reader.read_exact(&mut buf).await?;
                let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
                Address::Ipv4(ip, u16::from_be_bytes([buf[4], buf[5]]))
            }
            ATYPE_IPV6 => {
                let mut buf = [0u8; 18];
                reader.read_exact(&mut buf).await?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[..16]);
                Address::Ipv6(
                    Ipv6Addr::from(octets),
                    u16::from_be_bytes([buf[16], buf[17]]),
                )
            }
            ATYPE_DOMAIN => {
                let len = reader.read_u8().await? as usize;
                let mut buf = vec![0u8; len + 2];
                reader.read_exact(&mut buf).await?;
                let name = String::from_utf8_lossy(&buf[..len]).into_owned();
                Address::Domain(name, u16::from_be_bytes([buf[len], buf[len + 1]]))
            }
            other => {
                return Err(Error::addr(format!("unsupported address type: {other}")));
            }
        };

        Ok(ReqResp { kind, addr })
    }

    pub async fn write<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let mut buf = Vec::with_capacity(32);
        buf.push(SOCKS_VERSION);
        buf.push(self.kind);
        buf.push(0x00); // RSV

        match &self.addr {
            Address::Ipv4(ip, port) => {
                buf.push(ATYPE_IPV4);
                buf.extend_from_slice(&ip.octets());
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Address::Ipv6(ip, port) => {
                buf.push(ATYPE_IPV6);
                buf.extend_from_slice(&ip.octets());
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Address::Domain(name, port) => {
                let n = name.len();
                if n > 255 {
                    return Err(Error::addr(format!("domain name too long: {n}")));
                }
                buf.push(ATYPE_DOMAIN);
                buf.push(n as u8);
                buf.extend_from_slice(name.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }

        writer.write_all(&buf).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    async fn roundtrip_reqresp(packet: ReqResp) -> ReqResp {
        let mut buf = Vec::new();
        packet.write(&mut buf).await.unwrap();
        ReqResp::read(&mut buf.as_slice()).await.unwrap()
    }

    #[tokio::test]
    async fn test_hello_roundtrip() {
        let hello = Hello {
            methods: vec![METHOD_NO_AUTH, METHOD_USER_PASS],
        };
        let mut buf = Vec::new();
        hello.write(&mut buf).await.unwrap();
        assert_eq!(buf, vec![0x05, 0x02, 0x00, 0x02]);
        assert_eq!(Hello::read(&mut buf.as_slice()).await.unwrap(), hello);
    }

    #[tokio::test]
    async fn test_select_roundtrip() {
        let select = Select {
            method: METHOD_USER_PASS,
        };
        let mut buf = Vec::new();
        select.write(&mut buf).await.unwrap();
        assert_eq!(buf, vec![0x05, 0x02]);
        assert_eq!(Select::read(&mut buf.as_slice()).await.unwrap(), select);
    }

    #[tokio::test]
    async fn test_userpass_roundtrip() {
        let req = UserPassReq {
            username: "user".into(),
            password: "secret".into(),
        };
        let mut buf = Vec::new();
        req.write(&mut buf).await.unwrap();
        assert_eq!(buf[0], 0x01);
        assert_eq!(UserPassReq::read(&mut buf.as_slice()).await.unwrap(), req);

        for success in [true, false] {
            let resp = UserPassResp { success };
            let mut buf = Vec::new();
            resp.write(&mut buf).await.unwrap();
            assert_eq!(
                UserPassResp::read(&mut buf.as_slice()).await.unwrap(),
                resp
            );
        }
    }

    #[tokio::test]
    async fn test_reqresp_roundtrip_all_atypes() {
        for addr in [
            Address::Ipv4(Ipv4Addr::new(127, 0, 0, 1), 8080),
            Address::Ipv6("2001:db8::1".parse().unwrap(), 443),
            Address::Domain("example.com".into(), 80),
        ] {
            let packet = ReqResp {
                kind: CMD_CONNECT,
                addr: addr.clone(),
            };
            assert_eq!(roundtrip_reqresp(packet).await.addr, addr);
        }
    }

    #[tokio::test]
    async fn test_reqresp_wire_bytes() {
        let packet = ReqResp {
            kind: CMD_CONNECT,
            addr: Address::Ipv4(Ipv4Addr::new(1, 2, 3, 4), 0x1f90),
        };
        let mut buf = Vec::new();
        packet.write(&mut buf).await.unwrap();
        assert_eq!(buf, vec![0x05, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0x1f, 0x90]);
    }

    #[tokio::test]
    async fn test_version_04_accepted_on_read() {
        let bytes = vec![0x04, 0x00, 0x00, 0x01, 9, 9, 9, 9, 0, 80];
        let packet = ReqResp::read(&mut bytes.as_slice()).await.unwrap();
        assert_eq!(packet.addr, Address::Ipv4(Ipv4Addr::new(9, 9, 9, 9), 80));
    }

    #[tokio::test]
    async fn test_bad_version_rejected() {
        let bytes = vec![0x06, 0x01, 0x00, 0x01, 1, 1, 1, 1, 0, 80];
        assert!(ReqResp::read(&mut bytes.as_slice()).await.is_err());
        assert!(Hello::read(&mut [0x03u8, 0x01, 0x00].as_slice())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unsupported_atype_is_addr_error() {
        let bytes = vec![0x05, 0x01, 0x00, 0x09, 0, 0];
        let err = ReqResp::read(&mut bytes.as_slice()).await.unwrap_err();
        assert!(err.is_addr_error());
    }

    #[tokio::test]
    async fn test_overlong_domain_rejected_on_write() {
        let packet = ReqResp {
            kind: CMD_CONNECT,
            addr: Address::Domain("x".repeat(256), 80),
        };
        let mut buf = Vec::new();
        let err = packet.write(&mut buf).await.unwrap_err();
        assert!(err.is_addr_error());
    }

    #[tokio::test]
    async fn test_empty_hello_rejected() {
        assert!(Hello { methods: vec![] }.write(&mut Vec::new()).await.is_err());
        assert!(Hello::read(&mut [0x05u8, 0x00].as_slice()).await.is_err());
    }
}
