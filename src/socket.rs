use crate::types::Error;
use log::debug;
use std::{io, sync::Arc};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, rustls, TlsConnector};
use url::Url;

/// Connects the transport: TCP, then TLS with `h2` negotiated via ALPN.
pub async fn connect(url: &Url, config: Arc<rustls::ClientConfig>) -> Result<TlsStream<TcpStream>, Error> {
    let host = url
        .host_str()
        .ok_or(Error::InvalidRequest("URL has no host"))?;
    let server_name = rustls::ServerName::try_from(host)
        .map_err(|_| Error::InvalidRequest("URL host is not a valid server name"))?;
    let addr = url
        .socket_addrs(|| None)?
        .into_iter()
        .next()
        .ok_or_else(|| {
            Error::Transport(io::Error::new(
                io::ErrorKind::NotFound,
                "no addresses resolved",
            ))
        })?;
    debug!("connecting to {} ({})", host, addr);
    let tcp = TcpStream::connect(addr).await?;
    let tls = TlsConnector::from(config).connect(server_name, tcp).await?;
    Ok(tls)
}
