//! Drives the SOCKS5 handshake over a stream and hands the stream back to the caller, ready to
//! talk to the target. Only the no-authentication method and the CONNECT command are
//! supported, which is all Tor and most local proxies need.

use std::net::Ipv4Addr;
use std::net::Ipv6Addr;

use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

/// The version of the SOCKS protocol we support, only SOCKS5 is supported.
const SOCKS_VERSION: u8 = 5;
/// The SOCKS authentication method we support, only no authentication is supported.
const SOCKS_AUTH_METHOD_NONE: u8 = 0;
/// The cmd value for a SOCKS5 connect request.
const SOCKS_CMD_CONNECT: u8 = 1;
/// Magic value to indicate an IPv4 address.
const SOCKS_ADDR_TYPE_IPV4: u8 = 1;
/// Magic value to indicate a domain address.
const SOCKS_ADDR_TYPE_DOMAIN: u8 = 3;
/// Magic value to indicate an IPv6 address.
const SOCKS_ADDR_TYPE_IPV6: u8 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Socks5Addr {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    /// A hostname the proxy resolves for us, so DNS queries don't leak
    Domain(Box<[u8]>),
}

impl Socks5Addr {
    fn kind(&self) -> u8 {
        match self {
            Socks5Addr::Ipv4(_) => SOCKS_ADDR_TYPE_IPV4,
            Socks5Addr::Ipv6(_) => SOCKS_ADDR_TYPE_IPV6,
            Socks5Addr::Domain(_) => SOCKS_ADDR_TYPE_DOMAIN,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, Socks5Error> {
        match self {
            Socks5Addr::Ipv4(addr) => Ok(addr.octets().to_vec()),
            Socks5Addr::Ipv6(addr) => Ok(addr.octets().to_vec()),
            Socks5Addr::Domain(domain) => {
                let len = u8::try_from(domain.len()).map_err(|_| Socks5Error::InvalidAddress)?;
                let mut buf = vec![len];
                buf.extend_from_slice(domain);
                Ok(buf)
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum Socks5Error {
    #[error("proxy doesn't speak SOCKS5")]
    InvalidVersion,

    #[error("proxy requires authentication")]
    InvalidAuthMethod,

    #[error("proxy couldn't connect to the target, reply code {0}")]
    ConnectionFailed(u8),

    #[error("address can't be sent to the proxy")]
    InvalidAddress,

    #[error("io error while talking to the proxy: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Socks5StreamBuilder;

impl Socks5StreamBuilder {
    pub async fn connect<Stream: AsyncRead + AsyncWrite + Unpin>(
        mut socket: Stream,
        address: Socks5Addr,
        port: u16,
    ) -> Result<Stream, Socks5Error> {
        socket
            .write_all(&[SOCKS_VERSION, 1, SOCKS_AUTH_METHOD_NONE])
            .await?;

        let mut buf = [0_u8; 2];
        socket.read_exact(&mut buf).await?;

        if buf[0] != SOCKS_VERSION {
            return Err(Socks5Error::InvalidVersion);
        }

        if buf[1] != SOCKS_AUTH_METHOD_NONE {
            return Err(Socks5Error::InvalidAuthMethod);
        }

        let mut request = vec![SOCKS_VERSION, SOCKS_CMD_CONNECT, 0, address.kind()];
        request.extend(address.encode()?);
        request.extend_from_slice(&port.to_be_bytes());
        socket.write_all(&request).await?;

        let mut buf = [0_u8; 4];
        socket.read_exact(&mut buf).await?;

        if buf[0] != SOCKS_VERSION {
            return Err(Socks5Error::InvalidVersion);
        }
        if buf[1] != 0 {
            return Err(Socks5Error::ConnectionFailed(buf[1]));
        }

        // The bound address, which we don't need, followed by the port
        match buf[3] {
            SOCKS_ADDR_TYPE_IPV4 => {
                let mut buf = [0_u8; 6];
                socket.read_exact(&mut buf).await?;
            }
            SOCKS_ADDR_TYPE_IPV6 => {
                let mut buf = [0_u8; 18];
                socket.read_exact(&mut buf).await?;
            }
            SOCKS_ADDR_TYPE_DOMAIN => {
                let mut buf = [0_u8; 1];
                socket.read_exact(&mut buf).await?;
                let mut buf = vec![0_u8; buf[0] as usize + 2];
                socket.read_exact(&mut buf).await?;
            }
            other => return Err(Socks5Error::ConnectionFailed(other)),
        }

        Ok(socket)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn test_socks5_handshake_with_domain() {
        let (client, mut proxy) = duplex(1024);

        let proxy_side = tokio::spawn(async move {
            let mut greeting = [0_u8; 3];
            proxy.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [5, 1, 0]);
            proxy.write_all(&[5, 0]).await.unwrap();

            let mut request = [0_u8; 4 + 1 + 11 + 2];
            proxy.read_exact(&mut request).await.unwrap();
            assert_eq!(&request[..5], &[5, 1, 0, 3, 11]);
            assert_eq!(&request[5..16], b"example.com");
            assert_eq!(u16::from_be_bytes([request[16], request[17]]), 50001);

            proxy
                .write_all(&[5, 0, 0, 1, 127, 0, 0, 1, 0x1f, 0x90])
                .await
                .unwrap();
            proxy
        });

        let address = Socks5Addr::Domain(b"example.com".to_vec().into_boxed_slice());
        let result = Socks5StreamBuilder::connect(client, address, 50001).await;
        assert!(result.is_ok());
        proxy_side.await.unwrap();
    }

    #[tokio::test]
    async fn test_socks5_connection_refused() {
        let (client, mut proxy) = duplex(1024);

        tokio::spawn(async move {
            let mut greeting = [0_u8; 3];
            proxy.read_exact(&mut greeting).await.unwrap();
            proxy.write_all(&[5, 0]).await.unwrap();

            let mut request = [0_u8; 4 + 4 + 2];
            proxy.read_exact(&mut request).await.unwrap();
            // connection refused
            proxy.write_all(&[5, 5, 0, 1]).await.unwrap();
            proxy
        });

        let result =
            Socks5StreamBuilder::connect(client, Socks5Addr::Ipv4(Ipv4Addr::LOCALHOST), 8333).await;
        assert!(matches!(result, Err(Socks5Error::ConnectionFailed(5))));
    }
}
