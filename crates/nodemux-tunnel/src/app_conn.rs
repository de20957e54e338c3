//! Handle to one tunneled application connection

use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Read side of an application connection, owned by its app read loop
pub type AppReadHalf = Box<dyn AsyncRead + Send + Unpin>;

type AppWriteHalf = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared handle to an application byte stream
///
/// The registry and the node read loop hold the handle to write payloads and
/// to request a close; the read side is owned by the connection's app read
/// loop. `close` only signals: the app read loop observes it, runs its
/// teardown and shuts the socket down, so closing never waits on I/O.
pub struct AppConnection {
    label: String,
    writer: Mutex<AppWriteHalf>,
    shutdown: CancellationToken,
}

impl AppConnection {
    /// Split a byte stream into a shared handle and its read side
    pub fn split<S>(stream: S, label: impl Into<String>) -> (std::sync::Arc<Self>, AppReadHalf)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let conn = Self {
            label: label.into(),
            writer: Mutex::new(Box::new(writer)),
            shutdown: CancellationToken::new(),
        };
        (std::sync::Arc::new(conn), Box::new(reader))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Write the whole payload, retrying partial writes
    ///
    /// Fails once the connection has been closed; a write in progress is
    /// abandoned when `close` is called.
    pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed"));
        }

        let mut writer = self.writer.lock().await;
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed"))
            }
            result = async {
                writer.write_all(data).await?;
                writer.flush().await
            } => result,
        }
    }

    /// Request the connection be torn down
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once `close` has been called
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// Shut down the write side of the socket
    pub(crate) async fn shutdown_write(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

impl fmt::Debug for AppConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConnection")
            .field("label", &self.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}
