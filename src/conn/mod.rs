mod stream;

use tokio::{io::AsyncWriteExt, net::TcpStream};
use uuid::Uuid;

use crate::{
    bson::Document,
    error::{ErrorKind, Result},
    options::ConnectionMode,
    wire::{new_request_id, Message},
};

/// A snapshot of a client's connection state, returned by
/// [`Client::connection_info`](crate::Client::connection_info).
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionInfo {
    /// The unique identifier of the connection.
    pub connection_id: String,

    /// The `host:port` the connection targets.
    pub address: String,

    /// Whether the connection is currently established.
    pub connected: bool,

    /// Whether the server is a replica set member, if that has been detected
    /// yet.
    pub replica_set: Option<bool>,
}

/// A single TCP connection to the server. One request/response round trip is
/// in flight at a time; the wire protocol returns responses in request order.
#[derive(Debug)]
pub(crate) struct Connection {
    host: String,
    port: u16,
    mode: ConnectionMode,
    stream: Option<TcpStream>,
    pub(crate) id: String,
    request_id: i32,
}

impl Connection {
    pub(crate) fn new(host: impl Into<String>, port: u16, mode: ConnectionMode) -> Self {
        Self {
            host: host.into(),
            port,
            mode,
            stream: None,
            id: format!("conn-{}", Uuid::new_v4()),
            request_id: 0,
        }
    }

    pub(crate) fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Opens the socket. The connection's request id is allocated here and
    /// stays stable for the connection's lifetime.
    pub(crate) async fn connect(&mut self) -> Result<()> {
        let stream = stream::tcp_connect(&self.host, self.port).await?;
        self.stream = Some(stream);
        self.request_id = new_request_id();
        tracing::debug!(
            target: "mongolite::connection",
            connection_id = %self.id,
            address = %self.address(),
            "connection established"
        );
        Ok(())
    }

    /// Writes a full frame to the socket. A failed write triggers a single
    /// reconnect-and-retry; the second failure is terminal. Note the
    /// reconnect does not re-run authentication, matching the transport-only
    /// recovery contract.
    pub(crate) async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or_else(|| ErrorKind::Transport {
            message: "connection is not established".to_string(),
        })?;

        let first_failure = match write_frame(stream, bytes).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        tracing::warn!(
            target: "mongolite::connection",
            connection_id = %self.id,
            error = %first_failure,
            "send failed, reconnecting once"
        );

        self.stream = None;
        let stream = stream::tcp_connect(&self.host, self.port)
            .await
            .map_err(|e| ErrorKind::Transport {
                message: format!("reconnect after failed send failed: {}", e),
            })?;
        let stream = self.stream.insert(stream);
        let retried = write_frame(stream, bytes).await;
        if let Err(e) = retried {
            self.stream = None;
            return Err(ErrorKind::Transport {
                message: format!("send failed after reconnect: {}", e),
            }
            .into());
        }
        Ok(())
    }

    /// Reads one complete frame, driving the framer's length prefix.
    pub(crate) async fn receive(&mut self) -> Result<Vec<u8>> {
        let mode = self.mode;
        let stream = self.stream.as_mut().ok_or_else(|| ErrorKind::Transport {
            message: "connection is not established".to_string(),
        })?;
        stream::receive_frame(stream, mode).await
    }

    /// Frames the command document, performs one send/receive round trip, and
    /// returns the decoded response body. No interpretation is applied; the
    /// caller owns success/error semantics.
    pub(crate) async fn run_command(&mut self, document: Document) -> Result<Document> {
        let message = Message::new(document, self.request_id);
        let mut frame = Vec::new();
        message.write_to(&mut frame)?;

        self.send(&frame).await?;
        let raw = self.receive().await?;
        let reply = Message::read_from(&mut raw.as_slice())?;
        Ok(reply.document)
    }

    pub(crate) fn close(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!(
                target: "mongolite::connection",
                connection_id = %self.id,
                "connection closed"
            );
        }
    }
}

async fn write_frame(stream: &mut TcpStream, bytes: &[u8]) -> std::io::Result<()> {
    stream.write_all(bytes).await?;
    stream.flush().await
}
