//! Backend replica endpoint: liveness state, probing, and the ACK-protocol
//! request path.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::proxy::wire::ACK;
use crate::utils::{
    safe_line_read, tcp_connect_with_timeout, ProxyError,
};

use async_trait::async_trait;

use bytes::BytesMut;

use tokio::io::AsyncWriteExt;
use tokio::time::{self, Duration};

/// Timeout of a single TCP connect attempt toward a backend.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeout of each line read in the ACK protocol.
pub(crate) const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Total attempts made per `send_and_await_ack()` call.
pub(crate) const SEND_ATTEMPTS: u8 = 3;

/// Back-off slept between consecutive attempts.
pub(crate) const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Capability set of a backend replica as seen by the dispatcher and the
/// heartbeat manager. Unit tests substitute scripted implementations that
/// return configured sequences of outcomes without sockets.
#[async_trait]
pub(crate) trait Endpoint: fmt::Debug + Send + Sync {
    /// `host:port` identity of this backend.
    fn addr(&self) -> &str;

    /// Attempts a timed TCP connect, reporting success. Mutates nothing;
    /// the caller updates the liveness flag.
    async fn probe(&self) -> bool;

    /// Sends `request\n` over a fresh connection and awaits the two-line
    /// `ACK` + response convention, retrying internally.
    async fn send_and_await_ack(
        &self,
        request: &str,
    ) -> Result<String, ProxyError>;

    /// Writes one journal entry over a fresh connection; no reply awaited.
    async fn replay_entry(&self, entry: &str) -> Result<(), ProxyError>;

    fn is_alive(&self) -> bool;
    fn mark_alive(&self);
    fn mark_dead(&self);

    fn is_synced(&self) -> bool;
    fn mark_synced(&self);
}

/// A real TCP backend replica handle. A fresh connection is opened per
/// request, keeping the proxy stateless w.r.t. the backend; the ACK line
/// guards against half-open sockets silently accepting data the backend
/// will drop.
#[derive(Debug)]
pub(crate) struct BackendEndpoint {
    /// `host:port` connected to for every request.
    addr: String,

    /// Liveness flag, written by the heartbeat manager and the dispatcher.
    alive: AtomicBool,

    /// Set once after a successful journal replay.
    synced: AtomicBool,
}

impl BackendEndpoint {
    /// Creates a handle for a newly registered replica: live and fresh.
    pub(crate) fn new(host: &str, port: u16) -> Self {
        BackendEndpoint {
            addr: format!("{}:{}", host, port),
            alive: AtomicBool::new(true),
            synced: AtomicBool::new(false),
        }
    }

    /// One attempt of the ACK protocol round trip.
    async fn try_send(&self, request: &str) -> Result<String, ProxyError> {
        let mut stream =
            tcp_connect_with_timeout(&self.addr, CONNECT_TIMEOUT).await?;
        stream.write_all(request.as_bytes()).await?;
        stream.write_all(b"\n").await?;

        let mut read_buf = BytesMut::new();
        let ack = time::timeout(
            READ_TIMEOUT,
            safe_line_read(&mut read_buf, &mut stream),
        )
        .await??;
        if !ack.trim().eq_ignore_ascii_case(ACK) {
            return Err(ProxyError(format!(
                "expected ACK from '{}', got '{}'",
                self.addr, ack
            )));
        }

        let reply = time::timeout(
            READ_TIMEOUT,
            safe_line_read(&mut read_buf, &mut stream),
        )
        .await??;
        Ok(reply)
    }
}

#[async_trait]
impl Endpoint for BackendEndpoint {
    fn addr(&self) -> &str {
        &self.addr
    }

    async fn probe(&self) -> bool {
        tcp_connect_with_timeout(&self.addr, CONNECT_TIMEOUT)
            .await
            .is_ok()
    }

    async fn send_and_await_ack(
        &self,
        request: &str,
    ) -> Result<String, ProxyError> {
        let mut last_err = ProxyError::msg("no attempt made");
        for attempt in 0..SEND_ATTEMPTS {
            if attempt > 0 {
                time::sleep(RETRY_BACKOFF).await;
            }
            match self.try_send(request).await {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    pf_debug!(
                        "attempt {}/{} to '{}' failed: {}",
                        attempt + 1,
                        SEND_ATTEMPTS,
                        self.addr,
                        e
                    );
                    last_err = e;
                }
            }
        }
        Err(ProxyError(format!(
            "backend '{}' unreachable: {}",
            self.addr, last_err
        )))
    }

    async fn replay_entry(&self, entry: &str) -> Result<(), ProxyError> {
        let mut stream =
            tcp_connect_with_timeout(&self.addr, CONNECT_TIMEOUT).await?;
        stream.write_all(entry.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::Relaxed);
    }

    fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Relaxed)
    }

    fn mark_synced(&self) {
        self.synced.store(true, Ordering::Relaxed);
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU8;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    /// Mock backend accepting connections forever, writing `script` after
    /// reading one request line on each. Returns the accept counter.
    async fn spawn_mock_backend(
        addr: &str,
        script: &'static str,
    ) -> Arc<AtomicU8> {
        let listener = TcpListener::bind(addr).await.unwrap();
        let accepts = Arc::new(AtomicU8::new(0));
        let accepts_ref = accepts.clone();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                accepts_ref.fetch_add(1, Ordering::Relaxed);
                let mut read_buf = BytesMut::new();
                let _ = safe_line_read(&mut read_buf, &mut stream).await;
                let _ = stream.write_all(script.as_bytes()).await;
            }
        });
        accepts
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ack_round_trip() -> Result<(), ProxyError> {
        let _ = spawn_mock_backend("127.0.0.1:36801", "ACK\nOK:pong\n").await;
        let backend = BackendEndpoint::new("127.0.0.1", 36801);
        assert!(backend.probe().await);
        let reply = backend.send_and_await_ack("OPERACION:MESSAGE\nping").await?;
        assert_eq!(reply, "OK:pong");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ack_is_case_insensitive() -> Result<(), ProxyError> {
        let _ = spawn_mock_backend("127.0.0.1:36802", "ack\nOK:pong\n").await;
        let backend = BackendEndpoint::new("127.0.0.1", 36802);
        assert_eq!(
            backend.send_and_await_ack("OPERACION:MESSAGE\nping").await?,
            "OK:pong"
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wrong_ack_fails_after_three_attempts() {
        let accepts =
            spawn_mock_backend("127.0.0.1:36803", "NACK\nnope\n").await;
        let backend = BackendEndpoint::new("127.0.0.1", 36803);
        let result = backend.send_and_await_ack("OPERACION:MESSAGE\nping").await;
        assert!(result.is_err());
        assert_eq!(accepts.load(Ordering::Relaxed), SEND_ATTEMPTS);
    }

    #[tokio::test]
    async fn refused_connection_fails() {
        // nothing listens on this port
        let backend = BackendEndpoint::new("127.0.0.1", 36804);
        assert!(!backend.probe().await);
        assert!(backend
            .send_and_await_ack("OPERACION:MESSAGE\nping")
            .await
            .is_err());
    }

    #[test]
    fn state_flags() {
        let backend = BackendEndpoint::new("127.0.0.1", 36805);
        assert!(backend.is_alive());
        assert!(!backend.is_synced());
        backend.mark_dead();
        assert!(!backend.is_alive());
        backend.mark_alive();
        backend.mark_synced();
        assert!(backend.is_alive());
        assert!(backend.is_synced());
    }
}
