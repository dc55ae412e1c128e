//! Agent-facing server loop
//!
//! Accepts agent connections, performs a newline-delimited JSON hello
//! handshake and hands the registration to the control core. This is the
//! minimal concrete host for the transport layer; the production
//! transport (TLS, auth, multiplexing) plugs in at the same seam.

use anyhow::Context;
use portway_control::{ClientConnection, ClientService};
use portway_proto::ClientHello;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Server configuration assembled by the CLI
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address for agent connections
    pub listen_addr: SocketAddr,
    /// Allow one credential to be shared by several connected clients
    pub allow_multiuse_creds: bool,
    /// How often to purge expired disconnected clients
    pub sweep_interval: Duration,
}

/// Reply to the agent's hello, one JSON line
#[derive(Debug, Serialize)]
struct HelloReply {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tunnel_ports: Vec<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Transport handle handed to the control core
///
/// `close` wakes the connection task, which drops the socket; the task
/// also triggers on agent-side EOF.
#[derive(Debug)]
struct TcpAgentConnection {
    peer: SocketAddr,
    closed: AtomicBool,
    notify: Notify,
}

impl TcpAgentConnection {
    fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    async fn closed_by_server(&self) {
        self.notify.notified().await;
    }
}

impl ClientConnection for TcpAgentConnection {
    fn remote_addr(&self) -> SocketAddr {
        self.peer
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.notify.notify_one();
        }
    }
}

/// Agent-facing server
pub struct PortwayServer {
    config: ServerConfig,
    service: Arc<ClientService>,
    listener: TcpListener,
}

impl PortwayServer {
    /// Bind the agent listener
    pub async fn bind(config: ServerConfig, service: Arc<ClientService>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.listen_addr))?;
        info!("Agent listener bound on {}", listener.local_addr()?);
        Ok(Self {
            config,
            service,
            listener,
        })
    }

    /// Actual bound address (relevant when the CLI passed port 0)
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept agent connections until the process stops
    pub async fn run(self) -> anyhow::Result<()> {
        let service = self.service.clone();
        let sweep_interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                ticker.tick().await;
                service.sweep_expired(chrono::Utc::now());
            }
        });

        loop {
            let (stream, peer) = self.listener.accept().await?;
            debug!(%peer, "Accepted agent connection");
            let service = self.service.clone();
            let allow_multiuse = self.config.allow_multiuse_creds;
            tokio::spawn(async move {
                if let Err(e) = handle_agent(service, stream, peer, allow_multiuse).await {
                    warn!(%peer, "Agent connection ended with error: {}", e);
                }
            });
        }
    }
}

/// One agent connection: hello handshake, registration, then wait for
/// disconnect (agent EOF or server-side close) and terminate.
async fn handle_agent(
    service: Arc<ClientService>,
    stream: TcpStream,
    peer: SocketAddr,
    allow_multiuse_creds: bool,
) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        debug!(%peer, "Agent disconnected before hello");
        return Ok(());
    }

    let hello: ClientHello = match serde_json::from_str(line.trim()) {
        Ok(hello) => hello,
        Err(e) => {
            let reply = HelloReply {
                ok: false,
                client_id: None,
                tunnel_ports: Vec::new(),
                error: Some(format!("malformed hello: {}", e)),
            };
            send_reply(&mut write_half, &reply).await?;
            anyhow::bail!("malformed hello from {}: {}", peer, e);
        }
    };

    let client_id = hello
        .client_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let connection = Arc::new(TcpAgentConnection::new(peer));

    let mut client = match service.start_client(
        &hello.client_auth_id,
        &client_id,
        connection.clone(),
        allow_multiuse_creds,
        &hello.request,
    ) {
        Ok(client) => client,
        Err(e) => {
            warn!(%peer, %client_id, "Registration rejected: {}", e);
            let reply = HelloReply {
                ok: false,
                client_id: Some(client_id),
                tunnel_ports: Vec::new(),
                error: Some(e.to_string()),
            };
            send_reply(&mut write_half, &reply).await?;
            return Ok(());
        }
    };

    let reply = HelloReply {
        ok: true,
        client_id: Some(client_id.clone()),
        tunnel_ports: client.tunnels.iter().map(|t| t.local_port).collect(),
        error: None,
    };
    send_reply(&mut write_half, &reply).await?;

    // hold the connection open until the agent drops or the server closes it
    loop {
        let mut buf = String::new();
        tokio::select! {
            _ = connection.closed_by_server() => {
                debug!(%client_id, "Connection closed server-side");
                break;
            }
            read = reader.read_line(&mut buf) => {
                match read {
                    Ok(0) => {
                        debug!(%client_id, "Agent closed the connection");
                        break;
                    }
                    Ok(_) => continue, // keepalive chatter, ignored
                    Err(e) => {
                        debug!(%client_id, "Read error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    // terminate skips records that no longer exist, so a client removed
    // via force_delete is not resurrected here
    service
        .terminate(&mut client)
        .map_err(|e| anyhow::anyhow!("terminate failed for {}: {}", client_id, e))?;
    Ok(())
}

async fn send_reply(
    write_half: &mut tokio::net::tcp::OwnedWriteHalf,
    reply: &HelloReply,
) -> anyhow::Result<()> {
    let mut payload = serde_json::to_vec(reply)?;
    payload.push(b'\n');
    write_half.write_all(&payload).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use portway_control::{ClientRepository, PortDistributor, PortRange};
    use tokio::io::AsyncReadExt;

    fn test_service(keep_lost: Option<chrono::Duration>) -> Arc<ClientService> {
        let repo = Arc::new(ClientRepository::new(keep_lost));
        let distributor = PortDistributor::new(&[PortRange::range(21000, 21009)]);
        Arc::new(ClientService::new(distributor, repo))
    }

    async fn spawn_server(service: Arc<ClientService>) -> SocketAddr {
        let config = ServerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            allow_multiuse_creds: false,
            sweep_interval: Duration::from_secs(3600),
        };
        let server = PortwayServer::bind(config, service).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        addr
    }

    async fn read_reply(stream: &mut TcpStream) -> serde_json::Value {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            stream.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\n' {
                break;
            }
            buf.push(byte[0]);
        }
        serde_json::from_slice(&buf).unwrap()
    }

    async fn wait_until(mut probe: impl FnMut() -> bool) {
        for _ in 0..100 {
            if probe() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_hello_registers_and_eof_terminates() {
        let service = test_service(None);
        let addr = spawn_server(service.clone()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let hello = r#"{"client_id":"c1","client_auth_id":"auth1","request":{"name":"box","remotes":[{"remote_host":"127.0.0.1","remote_port":22}]}}"#;
        stream.write_all(hello.as_bytes()).await.unwrap();
        stream.write_all(b"\n").await.unwrap();

        let reply = read_reply(&mut stream).await;
        assert_eq!(reply["ok"], true);
        assert_eq!(reply["client_id"], "c1");
        assert_eq!(reply["tunnel_ports"].as_array().unwrap().len(), 1);

        let client = service.get_by_id("c1").unwrap();
        assert!(client.is_connected());
        assert_eq!(client.tunnels.len(), 1);

        // agent drops; retention is disabled so the record goes away
        drop(stream);
        wait_until(|| service.get_by_id("c1").is_none()).await;
    }

    #[tokio::test]
    async fn test_duplicate_client_id_rejected() {
        let service = test_service(None);
        let addr = spawn_server(service.clone()).await;

        let hello = r#"{"client_id":"dup","client_auth_id":"auth1","request":{"remotes":[]}}"#;

        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(hello.as_bytes()).await.unwrap();
        first.write_all(b"\n").await.unwrap();
        let reply = read_reply(&mut first).await;
        assert_eq!(reply["ok"], true);

        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(hello.as_bytes()).await.unwrap();
        second.write_all(b"\n").await.unwrap();
        let reply = read_reply(&mut second).await;
        assert_eq!(reply["ok"], false);
        assert!(reply["error"].as_str().unwrap().contains("already in use"));

        // the first registration is untouched
        assert!(service.get_active_by_id("dup").is_some());
    }

    #[tokio::test]
    async fn test_malformed_hello_rejected() {
        let service = test_service(None);
        let addr = spawn_server(service.clone()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"this is not json\n").await.unwrap();
        let reply = read_reply(&mut stream).await;
        assert_eq!(reply["ok"], false);
        assert!(reply["error"].as_str().unwrap().contains("malformed hello"));
        assert_eq!(service.count(), 0);
    }

    #[tokio::test]
    async fn test_force_delete_closes_agent_connection() {
        let service = test_service(Some(chrono::Duration::hours(1)));
        let addr = spawn_server(service.clone()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let hello = r#"{"client_id":"c1","client_auth_id":"auth1","request":{"remotes":[]}}"#;
        stream.write_all(hello.as_bytes()).await.unwrap();
        stream.write_all(b"\n").await.unwrap();
        let reply = read_reply(&mut stream).await;
        assert_eq!(reply["ok"], true);

        let mut client = service.get_by_id("c1").unwrap();
        service.force_delete(&mut client).unwrap();

        // the record stays deleted even after the connection task runs
        // its terminate-on-disconnect path
        wait_until(|| service.count_active() == 0).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(service.get_by_id("c1").is_none());
    }
}
