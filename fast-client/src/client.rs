//! High-level client API.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::connection::{ClientConfig, Connection, RecentRequest, RpcOptions, Transport};
use crate::error::ClientError;
use crate::stream::ResultStream;

/// A Fast RPC client.
///
/// One client owns one connection; any number of RPCs may be in flight on
/// it concurrently, and their responses may complete in any order.
pub struct FastClient {
    conn: Arc<Connection>,
    read_task: JoinHandle<()>,
}

impl FastClient {
    /// Connects to a Fast server over TCP.
    pub async fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        Self::connect_with_config(addr, ClientConfig::default()).await
    }

    /// Connects over TCP with explicit configuration.
    pub async fn connect_with_config(
        addr: SocketAddr,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        tracing::debug!("connecting to {}", addr);
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true).ok();
        Ok(Self::from_transport(stream, config))
    }

    /// Runs the client over an already-established byte transport. The
    /// protocol only assumes an in-order full-duplex channel, not TCP.
    pub fn from_transport(transport: impl Transport, config: ClientConfig) -> Self {
        let (conn, read_task) = Connection::spawn(Box::new(transport), config);
        Self { conn, read_task }
    }

    /// Submits an RPC with default options.
    pub async fn rpc(&self, method: &str, args: Vec<Value>) -> Result<ResultStream, ClientError> {
        self.conn.rpc(method, args, RpcOptions::default()).await
    }

    /// Submits an RPC with per-call options.
    pub async fn rpc_with_opts(
        &self,
        method: &str,
        args: Vec<Value>,
        opts: RpcOptions,
    ) -> Result<ResultStream, ClientError> {
        self.conn.rpc(method, args, opts).await
    }

    /// Stops response delivery without closing the transport; live requests
    /// fail with `Detached`.
    pub fn detach(&self) {
        self.conn.detach();
    }

    /// Closes the transport; live requests fail with `ConnectionClosed`.
    pub async fn close(&self) {
        self.conn.close().await;
        self.read_task.abort();
    }

    /// Number of live requests.
    pub fn pending_count(&self) -> usize {
        self.conn.pending_count()
    }

    /// Number of claimed message ids, including ids parked by timed-out
    /// requests.
    pub fn claimed_ids(&self) -> usize {
        self.conn.claimed_ids()
    }

    /// Recently completed requests, oldest first.
    pub fn recent_requests(&self) -> Vec<RecentRequest> {
        self.conn.recent_requests()
    }

    /// The fatal protocol error that made this client unusable, if any.
    pub fn fatal_error(&self) -> Option<String> {
        self.conn.fatal_error()
    }
}

impl Drop for FastClient {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::RequestOutcome;
    use fast_protocol::{Message, MessageDecoder, MessageStatus, RpcError};
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Reads one complete message from the far end of a duplex transport.
    async fn read_request(server: &mut DuplexStream, decoder: &mut MessageDecoder) -> Message {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(msg) = decoder.decode_message().unwrap() {
                return msg;
            }
            let n = server.read(&mut buf).await.unwrap();
            assert!(n > 0, "transport closed while awaiting a request");
            decoder.extend(&buf[..n]);
        }
    }

    async fn send(server: &mut DuplexStream, msg: &Message) {
        server.write_all(&msg.encode().unwrap()).await.unwrap();
    }

    fn test_client() -> (FastClient, DuplexStream) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let client = FastClient::from_transport(near, ClientConfig::default());
        (client, far)
    }

    #[tokio::test]
    async fn test_rpc_items_and_end() {
        let (client, mut server) = test_client();
        let mut decoder = MessageDecoder::new();

        let stream = client.rpc("echo", vec![json!("a"), json!("b")]).await.unwrap();
        let request = read_request(&mut server, &mut decoder).await;
        assert_eq!(request.status, MessageStatus::Data);
        assert_eq!(request.data.m.name, "echo");
        assert_eq!(request.items(), &[json!("a"), json!("b")]);

        send(
            &mut server,
            &Message::data_items(request.id, "echo", vec![json!({"value": "a"})]),
        )
        .await;
        send(
            &mut server,
            &Message::end_with(request.id, "echo", json!({"value": "b"})),
        )
        .await;

        let items = stream.collect().await.unwrap();
        assert_eq!(items, vec![json!({"value": "a"}), json!({"value": "b"})]);
        assert_eq!(client.pending_count(), 0);
        assert_eq!(client.claimed_ids(), 0);

        let recent = client.recent_requests();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].outcome, RequestOutcome::Completed);
    }

    #[tokio::test]
    async fn test_error_terminator_preserves_payload() {
        let (client, mut server) = test_client();
        let mut decoder = MessageDecoder::new();

        let mut stream = client.rpc("yes", vec![json!({"count": 0})]).await.unwrap();
        let request = read_request(&mut server, &mut decoder).await;

        let err = RpcError::new("VError", "count must be an integer in range [1, 10240]")
            .with_info(json!({"foundValue": 0, "minValue": 1, "maxValue": 10240}));
        send(&mut server, &Message::error(request.id, "yes", &err)).await;

        match stream.next().await {
            Some(Err(ClientError::Rpc(rpc))) => {
                assert_eq!(rpc.name, "VError");
                assert_eq!(rpc.info.unwrap()["foundValue"], 0);
            }
            other => panic!("expected rpc error, got {:?}", other.map(|r| r.map(|_| ()))),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_timeout_holds_id_until_real_terminator() {
        let (client, mut server) = test_client();
        let mut decoder = MessageDecoder::new();

        let opts = RpcOptions::new().with_timeout(Duration::from_millis(20));
        let mut stream = client.rpc_with_opts("sleep", vec![], opts).await.unwrap();
        let request = read_request(&mut server, &mut decoder).await;

        assert!(matches!(
            stream.next().await,
            Some(Err(ClientError::Timeout))
        ));

        // The caller saw the timeout, but the id is still claimed.
        assert_eq!(client.pending_count(), 0);
        assert_eq!(client.claimed_ids(), 1);

        // A late terminator finally releases it.
        send(&mut server, &Message::end(request.id, "sleep")).await;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while client.claimed_ids() != 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(client.claimed_ids(), 0);
    }

    #[tokio::test]
    async fn test_ignore_null_values_drops_nulls_in_data() {
        let (client, mut server) = test_client();
        let mut decoder = MessageDecoder::new();

        let opts = RpcOptions::new().with_ignore_null_values();
        let stream = client.rpc_with_opts("words", vec![], opts).await.unwrap();
        let request = read_request(&mut server, &mut decoder).await;

        send(
            &mut server,
            &Message::data_items(
                request.id,
                "words",
                vec![json!("one"), json!(null), json!({"inner": null})],
            ),
        )
        .await;
        send(&mut server, &Message::end(request.id, "words")).await;

        let items = stream.collect().await.unwrap();
        // Top-level nulls are dropped; nulls nested in items are not.
        assert_eq!(items, vec![json!("one"), json!({"inner": null})]);
    }

    #[tokio::test]
    async fn test_empty_data_array_yields_no_items() {
        let (client, mut server) = test_client();
        let mut decoder = MessageDecoder::new();

        let stream = client.rpc("words", vec![]).await.unwrap();
        let request = read_request(&mut server, &mut decoder).await;

        send(&mut server, &Message::data_items(request.id, "words", vec![])).await;
        send(&mut server, &Message::end(request.id, "words")).await;

        assert!(stream.collect().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unsolicited_id_is_fatal() {
        let (client, mut server) = test_client();
        let mut decoder = MessageDecoder::new();

        let mut stream = client.rpc("echo", vec![json!("x")]).await.unwrap();
        let request = read_request(&mut server, &mut decoder).await;

        // Reply on an id nobody asked about.
        send(&mut server, &Message::end(request.id + 1, "echo")).await;

        assert!(matches!(
            stream.next().await,
            Some(Err(ClientError::ConnectionError(_)))
        ));
        assert!(client.fatal_error().is_some());

        // The client is unusable afterwards.
        assert!(matches!(
            client.rpc("echo", vec![]).await,
            Err(ClientError::ConnectionError(_))
        ));
    }

    #[tokio::test]
    async fn test_detach_fails_live_requests() {
        let (client, mut server) = test_client();
        let mut decoder = MessageDecoder::new();

        let mut stream = client.rpc("sleep", vec![]).await.unwrap();
        let _request = read_request(&mut server, &mut decoder).await;

        client.detach();
        assert!(matches!(
            stream.next().await,
            Some(Err(ClientError::Detached))
        ));
        assert!(matches!(
            client.rpc("echo", vec![]).await,
            Err(ClientError::Detached)
        ));
    }

    #[tokio::test]
    async fn test_close_fails_live_requests() {
        let (client, mut server) = test_client();
        let mut decoder = MessageDecoder::new();

        let mut stream = client.rpc("sleep", vec![]).await.unwrap();
        let _request = read_request(&mut server, &mut decoder).await;

        client.close().await;
        assert!(matches!(
            stream.next().await,
            Some(Err(ClientError::ConnectionClosed))
        ));
        assert!(matches!(
            client.rpc("echo", vec![]).await,
            Err(ClientError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_corrupted_frame_is_fatal() {
        let (client, mut server) = test_client();
        let mut decoder = MessageDecoder::new();

        let mut stream = client.rpc("echo", vec![json!("x")]).await.unwrap();
        let request = read_request(&mut server, &mut decoder).await;

        // Flip a payload byte so the checksum no longer matches.
        let mut bytes = Message::end(request.id, "echo").encode().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        server.write_all(&bytes).await.unwrap();

        match stream.next().await {
            Some(Err(ClientError::ConnectionError(reason))) => {
                assert!(reason.contains("CRC"), "unexpected reason: {}", reason);
            }
            other => panic!("expected connection error, got {:?}", other.map(|r| r.map(|_| ()))),
        }
    }

    #[tokio::test]
    async fn test_concurrent_requests_get_distinct_ids() {
        let (client, mut server) = test_client();
        let mut decoder = MessageDecoder::new();

        let first = client.rpc("sleep", vec![json!({"ms": 50})]).await.unwrap();
        let second = client.rpc("echo", vec![json!("fast")]).await.unwrap();

        let req_a = read_request(&mut server, &mut decoder).await;
        let req_b = read_request(&mut server, &mut decoder).await;
        assert_ne!(req_a.id, req_b.id);
        assert_eq!(client.pending_count(), 2);

        // Complete them out of submission order.
        send(
            &mut server,
            &Message::end_with(req_b.id, "echo", json!({"value": "fast"})),
        )
        .await;
        let items = second.collect().await.unwrap();
        assert_eq!(items, vec![json!({"value": "fast"})]);
        assert_eq!(client.pending_count(), 1);

        send(&mut server, &Message::end(req_a.id, "sleep")).await;
        assert!(first.collect().await.unwrap().is_empty());
        assert_eq!(client.pending_count(), 0);
    }
}
