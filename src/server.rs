use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, error, info, info_span, Instrument};

use crate::dispatch::Dispatcher;
use crate::smtp::{Connection, Limits};
use crate::{Config, Session};

pub const DEFAULT_PORT: u16 = 1025;

/// An error while running the relay.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Smtp(#[from] crate::smtp::Error),
    #[error("could not build http client")]
    Client(#[from] reqwest::Error),
    #[error(transparent)]
    Accept(#[from] std::io::Error),
}

/// An SMTP server relaying every message it receives
/// to the configured endpoint.
pub struct Server {
    listener: TcpListener,
    config: Arc<Config>,
    dispatcher: Dispatcher,
    limits: Limits,
}

impl Server {
    /// Bind a new server instance.
    ///
    /// The endpoint is called with a timeout
    /// equal to the read timeout in `limits`.
    pub async fn start(
        address: SocketAddr,
        config: Config,
        limits: Limits,
    ) -> Result<Self, Error> {
        let dispatcher = Dispatcher::new(limits.read_timeout)?
            .verbose(config.verbose());
        let listener = TcpListener::bind(address).await?;
        Ok(Self {
            listener,
            config: Arc::new(config),
            dispatcher,
            limits,
        })
    }

    /// Return the address and port to which this server bound.
    pub fn address(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Accept connections until accepting fails.
    ///
    /// Every connection is served on its own task,
    /// a failing connection does not affect the others.
    pub async fn serve(self) -> Result<(), Error> {
        info!(address = %self.address()?, "listening");
        loop {
            let (socket, client_address) = self.listener.accept().await?;
            let session =
                Session::new(self.config.clone(), self.dispatcher.clone());
            let connection =
                Connection::new(socket, self.limits.clone(), session);
            let span = info_span!("connection", client = %client_address);
            tokio::spawn(
                async move {
                    debug!("accepted");
                    match connection.run().await {
                        Ok(_) => debug!("closed"),
                        Err(error) => error!(%error, "connection failed"),
                    }
                }
                .instrument(span),
            );
        }
    }
}
