//! The proxy process: shared state wiring, heartbeat task, and the accept
//! loop handing connections to session handlers.

mod backend;
mod dispatch;
mod heartbeat;
mod journal;
mod pool;
mod session;
mod wire;

use std::net::SocketAddr;
use std::sync::Arc;

use crate::utils::{tcp_bind_with_retry, ProxyError};

use serde::Deserialize;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Heartbeat probing interval in millisecs.
    pub probe_interval_ms: u64,

    /// Retries attempted when binding the listening endpoint.
    pub bind_retries: u8,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            probe_interval_ms: 5000,
            bind_retries: 10,
        }
    }
}

/// Process-wide proxy state threaded through every session handler; no
/// ambient globals.
#[derive(Debug, Clone)]
pub(crate) struct ProxyContext {
    /// Registered backend set with cursor and primary index.
    pub(crate) pool: Arc<pool::BackendPool>,

    /// Append-only journal of forwarded requests.
    pub(crate) journal: Arc<journal::Journal>,

    /// Round-robin forwarding engine over `pool`, appending to `journal`.
    pub(crate) dispatcher: dispatch::Dispatcher,

    /// Connected-client push roster.
    pub(crate) roster: Arc<session::ClientRoster>,
}

/// The proxy server instance.
pub struct ProxyServer {
    /// Shared proxy state.
    ctx: ProxyContext,

    /// TCP listener taking both client and backend connections.
    listener: TcpListener,

    /// Join handle of the heartbeat task.
    _heartbeat_handle: JoinHandle<()>,
}

impl ProxyServer {
    /// Creates the shared state, binds the listening endpoint, and spawns
    /// the heartbeat task.
    pub async fn new_and_setup(
        addr: SocketAddr,
        config_str: Option<&str>,
    ) -> Result<Self, ProxyError> {
        let config = parsed_config!(config_str => ProxyConfig;
                                    probe_interval_ms, bind_retries)?;
        if config.probe_interval_ms < 100 {
            return logged_err!(
                "invalid config.probe_interval_ms '{}'",
                config.probe_interval_ms
            );
        }

        let pool = Arc::new(pool::BackendPool::new());
        let journal = Arc::new(journal::Journal::new());
        let dispatcher =
            dispatch::Dispatcher::new(pool.clone(), journal.clone());
        let roster = Arc::new(session::ClientRoster::new());
        let ctx = ProxyContext {
            pool: pool.clone(),
            journal: journal.clone(),
            dispatcher,
            roster,
        };

        let listener = tcp_bind_with_retry(addr, config.bind_retries).await?;

        let heartbeater = heartbeat::Heartbeater::new(
            pool,
            journal,
            Duration::from_millis(config.probe_interval_ms),
        );
        let heartbeat_handle = tokio::spawn(heartbeater.run());

        pf_info!("proxy listening on '{}'", addr);
        Ok(ProxyServer {
            ctx,
            listener,
            _heartbeat_handle: heartbeat_handle,
        })
    }

    /// Accept loop; spawns one session handler task per accepted
    /// connection and runs until the process exits.
    pub async fn run(&mut self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    pf_debug!("accepted connection from '{}'", peer);
                    let handler =
                        session::SessionHandler::new(peer, self.ctx.clone());
                    tokio::spawn(handler.run(stream));
                }
                Err(e) => {
                    pf_warn!("error accepting connection: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::safe_line_read;
    use bytes::BytesMut;
    use std::sync::Mutex;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio::time::{self, Duration};

    /// Starts a proxy on `addr` with a fast heartbeat, returning its shared
    /// context for inspection.
    async fn start_proxy(addr: &str) -> Result<ProxyContext, ProxyError> {
        let mut server = ProxyServer::new_and_setup(
            addr.parse()?,
            Some("probe_interval_ms = 150"),
        )
        .await?;
        let ctx = server.ctx.clone();
        tokio::spawn(async move { server.run().await });
        Ok(ctx)
    }

    /// Mock backend replica: accepts connections forever; on each, records
    /// every received line and answers `ACK` plus the given reply.
    async fn start_mock_backend(
        addr: &str,
        reply: &'static str,
    ) -> Result<Arc<Mutex<Vec<String>>>, ProxyError> {
        let listener = TcpListener::bind(addr.parse::<SocketAddr>()?).await?;
        let received = Arc::new(Mutex::new(vec![]));
        let received_ref = received.clone();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let received_ref = received_ref.clone();
                tokio::spawn(async move {
                    let mut read_buf = BytesMut::new();
                    if let Ok(line) =
                        safe_line_read(&mut read_buf, &mut stream).await
                    {
                        received_ref.lock().unwrap().push(line);
                        let _ = stream
                            .write_all(
                                format!("ACK\n{}\n", reply).as_bytes(),
                            )
                            .await;
                        // drain any body line that may follow
                        if let Ok(line) =
                            safe_line_read(&mut read_buf, &mut stream).await
                        {
                            received_ref.lock().unwrap().push(line);
                        }
                    }
                });
            }
        });
        Ok(received)
    }

    /// Client-side helper wrapping a connection to the proxy.
    struct TestClient {
        stream: TcpStream,
        read_buf: BytesMut,
    }

    impl TestClient {
        async fn connect(addr: &str) -> Result<Self, ProxyError> {
            Ok(TestClient {
                stream: TcpStream::connect(addr).await?,
                read_buf: BytesMut::new(),
            })
        }

        async fn send(&mut self, chunk: &str) -> Result<(), ProxyError> {
            self.stream.write_all(chunk.as_bytes()).await?;
            self.stream.write_all(b"\n").await?;
            Ok(())
        }

        async fn recv_line(&mut self) -> Result<String, ProxyError> {
            time::timeout(
                Duration::from_secs(5),
                safe_line_read(&mut self.read_buf, &mut self.stream),
            )
            .await?
        }

        fn synthesized_addr(&self) -> Result<String, ProxyError> {
            let local = self.stream.local_addr()?;
            Ok(format!("{}{}", local.ip(), local.port()))
        }
    }

    async fn register_backend(
        proxy: &str,
        port: u16,
    ) -> Result<(), ProxyError> {
        let mut client = TestClient::connect(proxy).await?;
        client
            .send(&format!(
                "OPERACION:REGISTER;IP:127.0.0.1;PUERTO:{}",
                port
            ))
            .await?;
        assert_eq!(client.recv_line().await?, "RESPUESTA:ACK");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn single_backend_happy_path() -> Result<(), ProxyError> {
        let ctx = start_proxy("127.0.0.1:36100").await?;
        let received =
            start_mock_backend("127.0.0.1:36101", "OK:world").await?;
        register_backend("127.0.0.1:36100", 36101).await?;

        let mut client = TestClient::connect("127.0.0.1:36100").await?;
        client.send("OPERACION:CLIENT_REQ;USER:alice\nHELLO").await?;
        assert_eq!(client.recv_line().await?, "OPERACION:RESPUESTA");
        assert_eq!(client.recv_line().await?, "OK:world");

        assert_eq!(ctx.journal.len(), 1);
        let entry = ctx.journal.tail_from(0).remove(0);
        assert!(entry.starts_with("OPERACION:CLIENT_REQ;USER:alice;ADDRESS:"));
        assert!(entry.ends_with("\nHELLO"));

        let received = received.lock().unwrap();
        assert!(received[0].starts_with("OPERACION:CLIENT_REQ;USER:alice"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn failing_backend_fails_over() -> Result<(), ProxyError> {
        let _ctx = start_proxy("127.0.0.1:36110").await?;
        // first backend's port is never listened on
        register_backend("127.0.0.1:36110", 36111).await?;
        let _ = start_mock_backend("127.0.0.1:36112", "OK:second").await?;
        register_backend("127.0.0.1:36110", 36112).await?;

        let mut client = TestClient::connect("127.0.0.1:36110").await?;
        client.send("OPERACION:MESSAGE\nhello").await?;
        assert_eq!(client.recv_line().await?, "OK:second");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn all_backends_dead_token() -> Result<(), ProxyError> {
        let ctx = start_proxy("127.0.0.1:36120").await?;
        register_backend("127.0.0.1:36120", 36121).await?;
        register_backend("127.0.0.1:36120", 36122).await?;

        let mut client = TestClient::connect("127.0.0.1:36120").await?;
        client.send("OPERACION:MESSAGE\nhello").await?;
        assert_eq!(
            client.recv_line().await?,
            "ERROR;MSG:Todos los backends caidos"
        );
        assert_eq!(ctx.journal.len(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn no_backends_token() -> Result<(), ProxyError> {
        let ctx = start_proxy("127.0.0.1:36130").await?;
        let mut client = TestClient::connect("127.0.0.1:36130").await?;
        client.send("OPERACION:CLIENT_REQ;USER:alice\nHELLO").await?;
        assert_eq!(client.recv_line().await?, "OPERACION:RESPUESTA");
        assert_eq!(
            client.recv_line().await?,
            "ERROR;MSG:No hay backends disponibles"
        );
        assert_eq!(ctx.journal.len(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn unknown_operation_token() -> Result<(), ProxyError> {
        let _ctx = start_proxy("127.0.0.1:36140").await?;
        let mut client = TestClient::connect("127.0.0.1:36140").await?;
        client.send("OPERACION:BOGUS;USER:alice").await?;
        assert_eq!(
            client.recv_line().await?,
            "ERROR;MSG:Operacion desconocida"
        );
        // the session keeps serving after an unknown operation
        client.send("OPERACION:BOGUS2").await?;
        assert_eq!(
            client.recv_line().await?,
            "ERROR;MSG:Operacion desconocida"
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn push_to_connected_client() -> Result<(), ProxyError> {
        let _ctx = start_proxy("127.0.0.1:36150").await?;

        // client session registers itself in the roster via a CLIENT_REQ
        // with no ADDRESS field (no backends needed for that)
        let mut client = TestClient::connect("127.0.0.1:36150").await?;
        let addr = client.synthesized_addr()?;
        client.send("OPERACION:CLIENT_REQ;USER:alice\nHELLO").await?;
        client.recv_line().await?;
        client.recv_line().await?;

        // a backend-originated connection pushes a message to that address
        let mut backend_conn =
            TestClient::connect("127.0.0.1:36150").await?;
        backend_conn
            .send(&format!("OPERACION:SEND_MESSAGE;ADDRESS:{}\nhi", addr))
            .await?;
        assert_eq!(backend_conn.recv_line().await?, "ACK");

        assert_eq!(client.recv_line().await?, "OPERACION:GET_MESSAGE");
        assert_eq!(client.recv_line().await?, "hi");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn push_to_unknown_address() -> Result<(), ProxyError> {
        let _ctx = start_proxy("127.0.0.1:36160").await?;
        let mut client = TestClient::connect("127.0.0.1:36160").await?;
        client
            .send("OPERACION:SEND_MESSAGE;ADDRESS:does-not-exist\nhi")
            .await?;
        assert_eq!(client.recv_line().await?, "OPERACION:RESEND_ERROR");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn disconnect_notifies_backends() -> Result<(), ProxyError> {
        let ctx = start_proxy("127.0.0.1:36170").await?;
        let received =
            start_mock_backend("127.0.0.1:36171", "OK:done").await?;
        register_backend("127.0.0.1:36170", 36171).await?;

        let mut client = TestClient::connect("127.0.0.1:36170").await?;
        let addr = client.synthesized_addr()?;
        client.send("OPERACION:CLIENT_REQ;USER:alice\nHELLO").await?;
        client.recv_line().await?;
        client.recv_line().await?;
        drop(client);

        // the session's exit path forwards a DISCONNECT for its address
        let deadline = time::Instant::now() + Duration::from_secs(5);
        loop {
            {
                let received = received.lock().unwrap();
                if received.iter().any(|line| {
                    line == &format!(
                        "OPERACION:DISCONNECT;ADDRESS:{}",
                        addr
                    )
                }) {
                    break;
                }
            }
            if time::Instant::now() > deadline {
                panic!("DISCONNECT never forwarded to backend");
            }
            time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(ctx.journal.len(), 2);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn recovered_backend_replayed_from_journal(
    ) -> Result<(), ProxyError> {
        let _ctx = start_proxy("127.0.0.1:36180").await?;
        let _ = start_mock_backend("127.0.0.1:36181", "OK:one").await?;
        register_backend("127.0.0.1:36180", 36181).await?;
        // second backend registered while its port is still closed; the
        // heartbeat will mark it dead
        register_backend("127.0.0.1:36180", 36182).await?;
        time::sleep(Duration::from_millis(400)).await;

        let mut client = TestClient::connect("127.0.0.1:36180").await?;
        client.send("OPERACION:MESSAGE\nfirst").await?;
        client.recv_line().await?;
        client.send("OPERACION:MESSAGE\nsecond").await?;
        client.recv_line().await?;

        // backend comes back; the next heartbeat tick replays the journal
        let received =
            start_mock_backend("127.0.0.1:36182", "OK:two").await?;
        let deadline = time::Instant::now() + Duration::from_secs(5);
        loop {
            {
                let received = received.lock().unwrap();
                if received.iter().any(|l| l == "OPERACION:MESSAGE")
                    && received.iter().any(|l| l == "second")
                {
                    break;
                }
            }
            if time::Instant::now() > deadline {
                panic!("journal never replayed to recovered backend");
            }
            time::sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }
}
