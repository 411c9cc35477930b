use crate::{
    connection::{Connection, ConnectionEvent, Handle},
    request::Request,
    response::Response,
    settings::Settings,
    socket,
    types::Error,
};
use log::error;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_rustls::rustls::{self, OwnedTrustAnchor, RootCertStore};
use url::Url;

/// TLS configuration plus the settings every connection opens with.
pub struct Client {
    rustls_config: Arc<rustls::ClientConfig>,
    local_settings: Settings,
}

impl Client {
    /// Opens a connection to `url`'s authority and spawns its engine task.
    /// The handle multiplexes any number of requests over the connection.
    pub async fn open(
        &self,
        url: &Url,
    ) -> Result<(Handle, mpsc::UnboundedReceiver<ConnectionEvent>), Error> {
        let socket = socket::connect(url, self.rustls_config.clone()).await?;
        let (connection, handle, events) = Connection::new(socket, self.local_settings);
        tokio::spawn(async move {
            if let Err(err) = connection.run().await {
                error!("connection task: {}", err);
            }
        });
        Ok((handle, events))
    }

    /// One-shot convenience: open, send, await the response, tear down.
    pub async fn request(&self, request: Request) -> Result<Response, Error> {
        let url = request.url.clone();
        let (handle, _events) = self.open(&url).await?;
        let response = handle.request(request).await?;
        handle.close();
        Ok(response)
    }
}

impl Default for Client {
    fn default() -> Self {
        let mut root_store = RootCertStore::empty();
        root_store.add_server_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
        let mut config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"h2".to_vec()];
        Self {
            rustls_config: Arc::new(config),
            local_settings: Settings::default(),
        }
    }
}
