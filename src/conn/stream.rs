use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::{
    net::TcpStream,
    time::{sleep, timeout},
};

use crate::{
    error::{ErrorKind, Result},
    options::ConnectionMode,
    wire::{expected_message_length, MAX_MESSAGE_SIZE},
};

pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const KEEPALIVE_IDLE: Duration = Duration::from_secs(4);
#[cfg(not(windows))]
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(3);
#[cfg(all(unix, not(target_os = "openbsd")))]
const KEEPALIVE_RETRIES: u32 = 2;

/// How many empty reads a single `receive` tolerates before giving up.
const MAX_RECEIVE_ATTEMPTS: u32 = 10_000;

const COOPERATIVE_BACKOFF: Duration = Duration::from_millis(1);
const BLOCKING_BACKOFF_INITIAL: Duration = Duration::from_micros(100);
const BLOCKING_BACKOFF_CAP: Duration = Duration::from_millis(10);

const RECEIVE_CHUNK_SIZE: usize = 8 * 1024;

/// Opens a TCP connection to `host:port` with the client's socket options:
/// no Nagle delay and an aggressive keepalive so a dead peer is noticed
/// within seconds.
pub(crate) async fn tcp_connect(host: &str, port: u16) -> Result<TcpStream> {
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| ErrorKind::Connection {
            message: format!("timed out connecting to {}:{}", host, port),
        })?
        .map_err(|e| ErrorKind::Connection {
            message: format!("failed to connect to {}:{}: {}", host, port, e),
        })?;

    stream.set_nodelay(true).map_err(|e| ErrorKind::Connection {
        message: format!("failed to configure socket: {}", e),
    })?;

    let sock_ref = SockRef::from(&stream);
    #[allow(unused_mut)]
    let mut keepalive = TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
    #[cfg(not(windows))]
    {
        keepalive = keepalive.with_interval(KEEPALIVE_INTERVAL);
    }
    #[cfg(all(unix, not(target_os = "openbsd")))]
    {
        keepalive = keepalive.with_retries(KEEPALIVE_RETRIES);
    }
    sock_ref
        .set_tcp_keepalive(&keepalive)
        .map_err(|e| ErrorKind::Connection {
            message: format!("failed to configure keepalive: {}", e),
        })?;

    Ok(stream)
}

/// The empty-read backoff used by the receive loop. Cooperative mode yields a
/// fixed millisecond so sibling tasks can run; blocking mode starts at 100 µs
/// and doubles up to a 10 ms cap.
struct Backoff {
    mode: ConnectionMode,
    delay: Duration,
}

impl Backoff {
    fn new(mode: ConnectionMode) -> Self {
        let delay = match mode {
            ConnectionMode::Cooperative => COOPERATIVE_BACKOFF,
            ConnectionMode::Blocking => BLOCKING_BACKOFF_INITIAL,
        };
        Self { mode, delay }
    }

    async fn wait(&mut self) {
        sleep(self.delay).await;
        if self.mode == ConnectionMode::Blocking {
            self.delay = (self.delay * 2).min(BLOCKING_BACKOFF_CAP);
        }
    }

    fn reset(&mut self) {
        if self.mode == ConnectionMode::Blocking {
            self.delay = BLOCKING_BACKOFF_INITIAL;
        }
    }
}

/// Reads one complete wire frame from the stream.
///
/// Bytes are consumed in chunks; once the four-byte length prefix is
/// available it is validated against the frame bounds and drives the rest of
/// the read. Empty reads back off per the connection mode, and
/// `MAX_RECEIVE_ATTEMPTS` of them fail the receive.
pub(crate) async fn receive_frame(
    stream: &mut TcpStream,
    mode: ConnectionMode,
) -> Result<Vec<u8>> {
    let mut buf: Vec<u8> = Vec::new();
    let mut expected: Option<usize> = None;
    let mut attempts: u32 = 0;
    let mut backoff = Backoff::new(mode);
    let mut chunk = [0u8; RECEIVE_CHUNK_SIZE];

    loop {
        match stream.try_read(&mut chunk) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by server",
                )
                .into());
            }
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                attempts = 0;
                backoff.reset();
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                attempts += 1;
                if attempts >= MAX_RECEIVE_ATTEMPTS {
                    return Err(ErrorKind::ReceiveTimeout { attempts }.into());
                }
                backoff.wait().await;
                continue;
            }
            Err(e) => return Err(e.into()),
        }

        if expected.is_none() {
            expected = expected_message_length(&buf)?;
        }

        if let Some(length) = expected {
            debug_assert!(length <= MAX_MESSAGE_SIZE);
            if buf.len() >= length {
                buf.truncate(length);
                return Ok(buf);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ErrorCategory;
    use tokio::io::AsyncWriteExt;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn frame_bytes(length: i32) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&length.to_le_bytes());
        frame.extend_from_slice(&1i32.to_le_bytes());
        frame.extend_from_slice(&0i32.to_le_bytes());
        frame.extend_from_slice(&2013i32.to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes());
        frame.push(0);
        while frame.len() < length as usize {
            frame.push(0);
        }
        frame
    }

    #[tokio::test]
    async fn frame_reassembled_across_chunks() {
        let (mut client, mut server) = socket_pair().await;
        let frame = frame_bytes(64);

        let (first, rest) = frame.split_at(3);
        server.write_all(first).await.unwrap();
        server.flush().await.unwrap();
        let rest = rest.to_vec();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            server.write_all(&rest).await.unwrap();
            server
        });

        let received = receive_frame(&mut client, ConnectionMode::Cooperative)
            .await
            .unwrap();
        assert_eq!(received, frame);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn invalid_length_prefix_fails_immediately() {
        let (mut client, mut server) = socket_pair().await;
        server.write_all(&5i32.to_le_bytes()).await.unwrap();
        server.flush().await.unwrap();

        let err = receive_frame(&mut client, ConnectionMode::Blocking)
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Framing);
    }

    #[tokio::test]
    async fn server_hangup_is_an_io_error() {
        let (mut client, server) = socket_pair().await;
        drop(server);

        let err = receive_frame(&mut client, ConnectionMode::Cooperative)
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Network);
    }
}
