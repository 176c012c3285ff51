//! Per-connection protocol state machine.
//!
//! ```text
//! AwaitHandshake ──ack──▶ Serving ──EOF / fatal error──▶ Closed
//!        │                                                 ▲
//!        └──────────── HANDSHAKE_ERROR ────────────────────┘
//! ```
//!
//! The first frame must be a handshake naming [`PROTOCOL`] at
//! [`PROTOCOL_VERSION`]; anything else is answered with `HANDSHAKE_ERROR`
//! and the connection is closed. Once serving, each request frame is routed
//! and answered with the request's `correlation_id` (or a per-connection
//! fallback id). Malformed frames are answered with a 400 and the loop
//! keeps reading. Streamed outcomes are drained before the next frame is
//! read.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use uuid::Uuid;

use crate::error::{ProtocolError, TransportError};
use crate::frame::{read_frame, write_frame, Frame, PROTOCOL, PROTOCOL_VERSION};
use crate::job_stream::JobStream;
use crate::router::{RouteOutcome, Router};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitHandshake,
    Serving,
    Closed,
}

pub struct Connection<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    router: Arc<Router>,
    max_frame_bytes: usize,
    connection_id: String,
    state: ConnectionState,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, router: Arc<Router>, max_frame_bytes: usize) -> Self {
        let (read_half, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer,
            router,
            max_frame_bytes,
            connection_id: Uuid::new_v4().simple().to_string(),
            state: ConnectionState::AwaitHandshake,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Correlation id used for frames that carry none.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Drive the connection until the peer disconnects or a fatal error
    /// occurs. The writer is shut down exactly once on every path.
    pub async fn run(mut self) -> Result<(), ProtocolError> {
        tracing::debug!(connection = %self.connection_id, "connection opened");
        let result = self.drive().await;
        self.close().await;
        result
    }

    async fn drive(&mut self) -> Result<(), ProtocolError> {
        if !self.handshake().await? {
            return Ok(());
        }
        self.state = ConnectionState::Serving;
        self.serve().await
    }

    /// `Ok(false)` when the peer left before sending anything.
    async fn handshake(&mut self) -> Result<bool, ProtocolError> {
        let frame = match read_frame(&mut self.reader, self.max_frame_bytes).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(false),
            Err(ProtocolError::Io(e)) => return Err(ProtocolError::Io(e)),
            Err(e) => {
                let message = e.to_string();
                self.reject_handshake(None, &message).await?;
                return Err(ProtocolError::Handshake(message));
            }
        };

        let correlation_id = frame.correlation_id().map(str::to_string);
        if let Err(message) = validate_handshake(&frame) {
            self.reject_handshake(correlation_id.as_deref(), &message).await?;
            return Err(ProtocolError::Handshake(message));
        }

        write_frame(&mut self.writer, &Frame::handshake_ack(correlation_id.as_deref())).await?;
        tracing::debug!(connection = %self.connection_id, "handshake accepted");
        Ok(true)
    }

    async fn reject_handshake(&mut self, correlation_id: Option<&str>, message: &str) -> Result<(), ProtocolError> {
        tracing::warn!(connection = %self.connection_id, message, "handshake rejected");
        let correlation_id = correlation_id.unwrap_or(&self.connection_id).to_string();
        let err = TransportError::bad_request("HANDSHAKE_ERROR", message);
        write_error(&mut self.writer, &correlation_id, &err).await
    }

    async fn serve(&mut self) -> Result<(), ProtocolError> {
        loop {
            match read_frame(&mut self.reader, self.max_frame_bytes).await {
                Ok(None) => return Ok(()),
                Ok(Some(frame)) => self.handle(frame).await?,
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(connection = %self.connection_id, error = %e, "invalid frame");
                    let err = TransportError::bad_request("INVALID_FRAME", e.to_string());
                    write_error(&mut self.writer, &self.connection_id, &err).await?;
                }
                Err(e) => {
                    if !matches!(e, ProtocolError::Io(_)) {
                        let err = TransportError::bad_request("INVALID_FRAME", e.to_string());
                        let _ = write_error(&mut self.writer, &self.connection_id, &err).await;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn handle(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        let correlation_id = frame
            .correlation_id()
            .unwrap_or(&self.connection_id)
            .to_string();

        if frame.kind() != Some("request") {
            let err = TransportError::bad_request(
                "INVALID_FRAME_TYPE",
                format!("Expected frame type 'request', got {}", repr(frame.get("type"))),
            );
            return write_error(&mut self.writer, &correlation_id, &err).await;
        }
        let Some(path) = frame.path() else {
            let err = TransportError::bad_request("INVALID_PATH", "Request path must be a non-empty string");
            return write_error(&mut self.writer, &correlation_id, &err).await;
        };

        match self.router.dispatch(path, &frame.body()) {
            RouteOutcome::Response { status, body } => {
                write_frame(&mut self.writer, &Frame::response(status, &correlation_id, body)).await
            }
            RouteOutcome::Stream { status, body, stream } => {
                write_frame(&mut self.writer, &Frame::response(status, &correlation_id, body)).await?;
                self.drain(&correlation_id, stream).await
            }
        }
    }

    /// Progress frames go out as 202, the terminal frame as 200.
    async fn drain(&mut self, correlation_id: &str, mut stream: JobStream) -> Result<(), ProtocolError> {
        while let Some(event) = stream.next().await {
            let status = if event.is_complete() { 200 } else { 202 };
            let body = json!({ "job": event.job() });
            write_frame(&mut self.writer, &Frame::response(status, correlation_id, body)).await?;
        }
        Ok(())
    }

    async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        if let Err(e) = self.writer.shutdown().await {
            tracing::debug!(connection = %self.connection_id, error = %e, "writer shutdown failed");
        }
        tracing::debug!(connection = %self.connection_id, "connection closed");
    }
}

fn validate_handshake(frame: &Frame) -> Result<(), String> {
    if frame.kind() != Some("handshake") {
        return Err("First frame must be a handshake request".to_string());
    }
    let protocol = frame.get("protocol");
    if protocol.and_then(Value::as_str) != Some(PROTOCOL) {
        return Err(format!("Unsupported protocol: {}", repr(protocol)));
    }
    let version = frame.get("version");
    if version.and_then(Value::as_u64) != Some(PROTOCOL_VERSION) {
        return Err(format!("Unsupported protocol version: {}", repr(version)));
    }
    Ok(())
}

fn repr(value: Option<&Value>) -> String {
    value.map(Value::to_string).unwrap_or_else(|| "null".to_string())
}

async fn write_error<W>(writer: &mut W, correlation_id: &str, err: &TransportError) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, &Frame::response(err.status, correlation_id, err.to_body())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::testing::empty_router;
    use tokio::io::{duplex, AsyncBufRead, DuplexStream};
    use tokio::task::JoinHandle;

    const MAX: usize = 64 * 1024;

    struct Client {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
        server: JoinHandle<Result<(), ProtocolError>>,
    }

    impl Client {
        fn connect() -> Self {
            let (client, server) = duplex(MAX);
            let router = Arc::new(empty_router().router);
            let server = tokio::spawn(Connection::new(server, router, MAX).run());
            let (r, writer) = tokio::io::split(client);
            Self {
                reader: BufReader::new(r),
                writer,
                server,
            }
        }

        async fn send(&mut self, frame: &Frame) {
            write_frame(&mut self.writer, frame).await.unwrap();
        }

        async fn send_raw(&mut self, bytes: &[u8]) {
            self.writer.write_all(bytes).await.unwrap();
            self.writer.flush().await.unwrap();
        }

        async fn recv(&mut self) -> Option<Frame> {
            recv_from(&mut self.reader).await
        }

        async fn handshake(&mut self) {
            self.send(&Frame::handshake(Some("hs"))).await;
            assert_eq!(self.recv().await.unwrap().kind(), Some("handshake_ack"));
        }
    }

    async fn recv_from<R: AsyncBufRead + Unpin>(reader: &mut R) -> Option<Frame> {
        read_frame(reader, MAX).await.unwrap()
    }

    fn code(frame: &Frame) -> String {
        frame.body()["code"].as_str().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn handshake_is_acknowledged_with_correlation_id() {
        let mut client = Client::connect();
        client.send(&Frame::handshake(Some("hs-1"))).await;
        let ack = client.recv().await.unwrap();
        assert_eq!(ack.kind(), Some("handshake_ack"));
        assert_eq!(ack.get("protocol"), Some(&json!("rag-cli-ipc")));
        assert_eq!(ack.get("version"), Some(&json!(1)));
        assert_eq!(ack.get("server"), Some(&json!("rag-backend")));
        assert_eq!(ack.correlation_id(), Some("hs-1"));

        client.writer.shutdown().await.unwrap();
        assert!(client.server.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn wrong_protocol_closes_with_handshake_error() {
        let mut client = Client::connect();
        let mut frame = Frame::handshake(Some("hs-2"));
        frame.insert("protocol", "other-ipc");
        client.send(&frame).await;

        let reply = client.recv().await.unwrap();
        assert_eq!(reply.status(), Some(400));
        assert_eq!(reply.correlation_id(), Some("hs-2"));
        assert_eq!(code(&reply), "HANDSHAKE_ERROR");
        assert_eq!(reply.body()["message"], "Unsupported protocol: \"other-ipc\"");
        assert!(client.recv().await.is_none());
        assert!(matches!(client.server.await.unwrap(), Err(ProtocolError::Handshake(_))));
    }

    #[tokio::test]
    async fn wrong_version_is_rejected() {
        let mut client = Client::connect();
        let mut frame = Frame::handshake(None);
        frame.insert("version", 2);
        client.send(&frame).await;

        let reply = client.recv().await.unwrap();
        assert_eq!(code(&reply), "HANDSHAKE_ERROR");
        assert_eq!(reply.body()["message"], "Unsupported protocol version: 2");
        assert!(client.recv().await.is_none());
    }

    #[tokio::test]
    async fn request_before_handshake_is_rejected() {
        let mut client = Client::connect();
        client.send(&Frame::request("/v1/sources", Some("r-0"), json!({}))).await;

        let reply = client.recv().await.unwrap();
        assert_eq!(code(&reply), "HANDSHAKE_ERROR");
        assert_eq!(reply.body()["message"], "First frame must be a handshake request");
        assert!(client.recv().await.is_none());
    }

    #[tokio::test]
    async fn malformed_frames_do_not_end_the_connection() {
        let mut client = Client::connect();
        client.handshake().await;

        client.send_raw(b"5\nnotjs\n").await;
        let reply = client.recv().await.unwrap();
        assert_eq!(reply.status(), Some(400));
        assert_eq!(code(&reply), "INVALID_FRAME");
        let fallback = reply.correlation_id().unwrap().to_string();
        assert_eq!(fallback.len(), 32);

        let mut ping = Frame::default();
        ping.insert("type", "ping");
        client.send(&ping).await;
        let reply = client.recv().await.unwrap();
        assert_eq!(code(&reply), "INVALID_FRAME_TYPE");
        assert_eq!(reply.body()["message"], "Expected frame type 'request', got \"ping\"");
        assert_eq!(reply.correlation_id(), Some(fallback.as_str()));

        client.send(&Frame::request("", Some("r-1"), json!({}))).await;
        let reply = client.recv().await.unwrap();
        assert_eq!(code(&reply), "INVALID_PATH");
        assert_eq!(reply.correlation_id(), Some("r-1"));

        client.send(&Frame::request("/v1/sources", Some("r-2"), json!({}))).await;
        let reply = client.recv().await.unwrap();
        assert_eq!(reply.status(), Some(200));
        assert_eq!(reply.correlation_id(), Some("r-2"));
        assert_eq!(reply.body()["catalog_version"], 0);
    }

    #[tokio::test]
    async fn oversized_frame_closes_the_connection() {
        let mut client = Client::connect();
        client.handshake().await;

        client.send_raw(format!("{}\n", MAX + 1).as_bytes()).await;
        let reply = client.recv().await.unwrap();
        assert_eq!(code(&reply), "INVALID_FRAME");
        assert!(client.recv().await.is_none());
        assert!(matches!(
            client.server.await.unwrap(),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn reindex_streams_frames_with_one_correlation_id() {
        let mut client = Client::connect();
        client.handshake().await;
        client
            .send(&Frame::request("/v1/index/reindex", Some("job-1"), json!({"trigger": "manual"})))
            .await;

        let accepted = client.recv().await.unwrap();
        assert_eq!(accepted.status(), Some(202));
        assert_eq!(accepted.body()["job"]["status"], "running");

        let mut frames = vec![accepted];
        loop {
            let frame = client.recv().await.unwrap();
            let done = frame.status() == Some(200);
            frames.push(frame);
            if done {
                break;
            }
        }
        assert!(frames.iter().all(|f| f.correlation_id() == Some("job-1")));
        let last = frames.last().unwrap();
        assert_eq!(last.body()["job"]["status"], "succeeded");
        assert_eq!(last.body()["job"]["percent_complete"], 100.0);

        // the loop is back to reading requests
        client.send(&Frame::request("/v1/sources", Some("after"), json!({}))).await;
        assert_eq!(client.recv().await.unwrap().correlation_id(), Some("after"));
    }
}
