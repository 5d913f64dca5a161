//! Per-client session handling and the connected-client roster used for
//! server-initiated push.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::proxy::backend::{BackendEndpoint, Endpoint};
use crate::proxy::wire::{self, Operation};
use crate::proxy::ProxyContext;
use crate::utils::{safe_line_read, ProxyError};

use bytes::BytesMut;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Map from client address to the push channel into its session's writer
/// loop. Holding a sender does not keep the session or its socket alive;
/// entries are removed only on the owning session's exit path.
#[derive(Debug, Default)]
pub(crate) struct ClientRoster {
    clients: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
}

impl ClientRoster {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    /// Inserts `addr` if absent. Returns true if this call inserted it, in
    /// which case the caller owns the entry and must remove it on exit.
    pub(crate) fn insert_if_absent(
        &self,
        addr: &str,
        tx_push: mpsc::UnboundedSender<String>,
    ) -> bool {
        let mut clients = self.clients.lock().unwrap();
        if clients.contains_key(addr) {
            false
        } else {
            clients.insert(addr.into(), tx_push);
            true
        }
    }

    /// Pushes a server-originated message chunk to the session registered
    /// under `addr`. Returns false if no such client is connected.
    pub(crate) fn push_to(&self, addr: &str, chunk: String) -> bool {
        match self.clients.lock().unwrap().get(addr) {
            Some(tx_push) => tx_push.send(chunk).is_ok(),
            None => false,
        }
    }

    /// Drops the entry for `addr`, if any.
    pub(crate) fn remove(&self, addr: &str) {
        self.clients.lock().unwrap().remove(addr);
    }
}

/// Client address as the original service synthesizes it: the peer IP
/// string directly concatenated with the port, no separator.
// TODO: a ':' separator would avoid cross-client collisions; kept as-is for
// compatibility with deployed backends that look up this exact format.
fn synthesize_addr(peer: SocketAddr) -> String {
    format!("{}{}", peer.ip(), peer.port())
}

/// Writes `line` newline-terminated.
async fn write_line(
    conn_write: &mut OwnedWriteHalf,
    line: &str,
) -> Result<(), ProxyError> {
    conn_write.write_all(line.as_bytes()).await?;
    conn_write.write_all(b"\n").await?;
    Ok(())
}

/// Handler of one accepted TCP connection; owns the socket for its
/// lifetime. A single connection may carry many operations back-to-back;
/// `REGISTER` is the one-shot exception.
pub(crate) struct SessionHandler {
    /// Remote address of the connection peer.
    peer: SocketAddr,

    /// Shared proxy state.
    ctx: ProxyContext,
}

impl SessionHandler {
    pub(crate) fn new(peer: SocketAddr, ctx: ProxyContext) -> Self {
        SessionHandler { peer, ctx }
    }

    /// Session main loop: selects between server-originated pushes toward
    /// this client and the next header line from it, prioritizing pushes.
    pub(crate) async fn run(self, stream: TcpStream) {
        let (mut conn_read, mut conn_write) = stream.into_split();
        let mut read_buf = BytesMut::new();
        let (tx_push, mut rx_push) = mpsc::unbounded_channel::<String>();
        let mut owned_addr: Option<String> = None;

        pf_debug!("session for '{}' spawned", self.peer);
        loop {
            tokio::select! {
                biased;

                // server-originated message pushed toward this client
                chunk = rx_push.recv() => {
                    if let Some(chunk) = chunk {
                        if let Err(e) =
                            write_line(&mut conn_write, &chunk).await
                        {
                            pf_error!(
                                "error pushing to '{}': {}",
                                self.peer, e
                            );
                            break;
                        }
                    }
                },

                // next header line from the client
                header = safe_line_read(&mut read_buf, &mut conn_read) => {
                    let header = match header {
                        Ok(header) => header,
                        Err(_) => break, // peer closed or I/O error
                    };
                    match self
                        .handle_operation(
                            &header,
                            &mut read_buf,
                            &mut conn_read,
                            &mut conn_write,
                            &tx_push,
                            &mut owned_addr,
                        )
                        .await
                    {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => {
                            pf_debug!(
                                "session for '{}' error: {}",
                                self.peer, e
                            );
                            break;
                        }
                    }
                },
            }
        }

        // guaranteed cleanup path: drop the roster entry, then tell the
        // backends this client is gone
        if let Some(addr) = owned_addr {
            self.ctx.roster.remove(&addr);
            let notice = wire::encode_header(&[
                (wire::KEY_OPERATION, "DISCONNECT"),
                (wire::KEY_ADDRESS, &addr),
            ]);
            let _ = self.ctx.dispatcher.forward(&notice).await;
            pf_info!("client '{}' disconnected, backends notified", addr);
        }
        pf_debug!("session for '{}' exited", self.peer);
    }

    /// Handles one parsed header (reading the body line where the operation
    /// carries one). Returns `Ok(false)` when the session should close.
    #[allow(clippy::too_many_arguments)]
    async fn handle_operation(
        &self,
        header: &str,
        read_buf: &mut BytesMut,
        conn_read: &mut OwnedReadHalf,
        conn_write: &mut OwnedWriteHalf,
        tx_push: &mpsc::UnboundedSender<String>,
        owned_addr: &mut Option<String>,
    ) -> Result<bool, ProxyError> {
        match Operation::classify(header) {
            Operation::Register => {
                let host = wire::parse_field(header, wire::KEY_IP);
                let port: u16 = wire::parse_field(header, wire::KEY_PORT)
                    .parse()
                    .map_err(|e| {
                        ProxyError(format!("bad PUERTO in REGISTER: {}", e))
                    })?;
                let backend = Arc::new(BackendEndpoint::new(host, port));
                pf_info!("registered backend '{}'", backend.addr());
                self.ctx.pool.register(backend);
                write_line(conn_write, wire::REGISTER_ACK).await?;
                Ok(false) // registration is one-shot
            }

            Operation::ClientReq => {
                let body = safe_line_read(read_buf, conn_read).await?;
                let mut addr =
                    wire::parse_field(header, wire::KEY_ADDRESS).to_string();
                if addr.is_empty() {
                    addr = synthesize_addr(self.peer);
                    if self
                        .ctx
                        .roster
                        .insert_if_absent(&addr, tx_push.clone())
                    {
                        *owned_addr = Some(addr.clone());
                        pf_info!("client '{}' connected", addr);
                    }
                }
                let request = format!(
                    "{};{}:{}\n{}",
                    header,
                    wire::KEY_ADDRESS,
                    addr,
                    body
                );
                let reply = self.ctx.dispatcher.forward(&request).await;
                write_line(
                    conn_write,
                    &format!("{}\n{}", wire::RESPONSE_HEADER, reply),
                )
                .await?;
                Ok(true)
            }

            Operation::Message => {
                let body = safe_line_read(read_buf, conn_read).await?;
                let request = format!("{}\n{}", header, body);
                let reply = self.ctx.dispatcher.forward(&request).await;
                write_line(conn_write, &reply).await?;
                Ok(true)
            }

            Operation::SendMessage => {
                let body = safe_line_read(read_buf, conn_read).await?;
                let addr = wire::parse_field(header, wire::KEY_ADDRESS);
                let chunk =
                    format!("{}\n{}", wire::GET_MESSAGE_HEADER, body);
                if self.ctx.roster.push_to(addr, chunk) {
                    write_line(conn_write, wire::ACK).await?;
                } else {
                    pf_warn!("push target '{}' not connected", addr);
                    write_line(conn_write, wire::RESEND_ERROR).await?;
                }
                Ok(true)
            }

            Operation::Disconnect => {
                let reply = self.ctx.dispatcher.forward(header).await;
                write_line(conn_write, &reply).await?;
                Ok(true)
            }

            Operation::Unknown => {
                pf_warn!("unknown operation in header '{}'", header);
                write_line(conn_write, wire::ERR_UNKNOWN_OP).await?;
                Ok(true)
            }
        }
    }
}
