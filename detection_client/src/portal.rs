use crate::config::PortalConfig;
use frame_codec::{CodecError, FrameCodec};
use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tokio::{net::TcpStream, time::timeout};
use tracing::instrument;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Failed to read image {path:?}: {source}")]
    LocalRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to connect to {address}: {source}")]
    Connection {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("Protocol error: {0}")]
    Protocol(#[source] CodecError),
    #[error("No response within {0:?}")]
    Timeout(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ClientError {
    /// The server rejects a request by closing the connection, which the
    /// client may notice while still uploading. That is a protocol outcome,
    /// not a local I/O failure.
    fn from_write(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) if is_peer_close(&e) => ClientError::Protocol(CodecError::Io(e)),
            CodecError::Io(e) => ClientError::Io(e),
            other => ClientError::Protocol(other),
        }
    }
}

fn is_peer_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::WriteZero
    )
}

/// Sends one image per connection and waits for the annotated result.
///
/// There is no retry logic here: a failed exchange is returned as is and the
/// caller decides whether to try again.
#[derive(Debug, Clone)]
pub struct ClientPortal {
    codec: FrameCodec,
    connect_timeout: Duration,
    response_timeout: Duration,
}

impl Default for ClientPortal {
    fn default() -> Self {
        Self::new(&PortalConfig::default())
    }
}

impl ClientPortal {
    pub fn new(config: &PortalConfig) -> Self {
        Self {
            codec: FrameCodec::new(config.max_payload_size),
            connect_timeout: config.connect_timeout(),
            response_timeout: config.response_timeout(),
        }
    }

    pub async fn send_image(
        &self,
        server_address: &str,
        image_path: impl AsRef<Path>,
    ) -> Result<Vec<u8>, ClientError> {
        let path = image_path.as_ref();
        let image = tokio::fs::read(path)
            .await
            .map_err(|source| ClientError::LocalRead {
                path: path.to_path_buf(),
                source,
            })?;

        self.send_bytes(server_address, &image).await
    }

    #[instrument(skip(self, image), fields(image_len = image.len()))]
    pub async fn send_bytes(
        &self,
        server_address: &str,
        image: &[u8],
    ) -> Result<Vec<u8>, ClientError> {
        let mut stream = self.connect(server_address).await?;

        let exchange = async {
            self.codec
                .write_frame(&mut stream, image)
                .await
                .map_err(ClientError::from_write)?;
            tracing::debug!("Image sent, waiting for response");

            self.codec
                .decode(&mut stream)
                .await
                .map_err(ClientError::Protocol)
        };

        let response = timeout(self.response_timeout, exchange)
            .await
            .map_err(|_| ClientError::Timeout(self.response_timeout))??;

        tracing::debug!("Received {} byte annotated image", response.len());
        Ok(response)
    }

    async fn connect(&self, server_address: &str) -> Result<TcpStream, ClientError> {
        let connection_error = |source| ClientError::Connection {
            address: server_address.to_string(),
            source,
        };

        match timeout(self.connect_timeout, TcpStream::connect(server_address)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(connection_error(e)),
            Err(_) => Err(connection_error(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timed out after {:?}", self.connect_timeout),
            ))),
        }
    }
}
