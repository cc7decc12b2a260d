use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::lifecycle::LifecycleComponent;
use crate::core::orchestrator::{Event, HandleOutcome, Orchestrator, OutboundMessage, Transport};

pub const TCP_TRANSPORT: &str = "tcp";
pub const TCP_SOURCE: &str = "tcp";

pub fn new_conversation_id() -> String {
    format!("{}:{}", TCP_TRANSPORT, uuid::Uuid::new_v4().simple())
}

fn reply_line(status: &str, response: &str) -> String {
    json!({ "status": status, "response": response }).to_string()
}

/// Connected clients keyed by the conversation they currently own.
#[derive(Clone, Default)]
pub struct TcpClients {
    inner: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<String>>>>,
}

impl TcpClients {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<String>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, conversation_id: &str, writer: mpsc::UnboundedSender<String>) {
        self.lock().insert(conversation_id.to_string(), writer);
    }

    pub fn remove(&self, conversation_id: &str) {
        self.lock().remove(conversation_id);
    }

    pub fn rename(&self, from: &str, to: &str) {
        let mut clients = self.lock();
        if let Some(writer) = clients.remove(from) {
            clients.insert(to.to_string(), writer);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// False when no live client owns the conversation.
    pub fn send(&self, conversation_id: &str, line: String) -> bool {
        let mut clients = self.lock();
        match clients.get(conversation_id) {
            Some(writer) if writer.send(line).is_ok() => true,
            Some(_) => {
                clients.remove(conversation_id);
                false
            }
            None => false,
        }
    }

    /// Returns how many clients took the line.
    pub fn broadcast(&self, line: &str) -> usize {
        let mut clients = self.lock();
        clients.retain(|_, writer| writer.send(line.to_string()).is_ok());
        clients.len()
    }
}

/// Outbound side of the TCP interface. Replies go to the owning client;
/// proactive messages nobody owns are broadcast.
pub struct TcpTransport {
    clients: TcpClients,
}

impl TcpTransport {
    pub fn new(clients: TcpClients) -> Self {
        Self { clients }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn id(&self) -> &str {
        TCP_TRANSPORT
    }

    async fn deliver(&self, message: &OutboundMessage) -> Result<()> {
        let status = if message.proactive { "notification" } else { "ok" };
        let line = reply_line(status, &message.text);
        if self.clients.send(&message.conversation_id, line.clone()) {
            return Ok(());
        }
        if message.proactive {
            let reached = self.clients.broadcast(&line);
            if reached > 0 {
                debug!(clients = reached, "Broadcast proactive message");
                return Ok(());
            }
            bail!("no TCP clients connected");
        }
        bail!("client for {} is not connected", message.conversation_id)
    }
}

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default = "default_command")]
    command: String,
    #[serde(default)]
    message: String,
}

fn default_command() -> String {
    "chat".to_string()
}

struct ClientState {
    conversation_id: String,
    writer: mpsc::UnboundedSender<String>,
    log_task: Option<JoinHandle<()>>,
}

impl Drop for ClientState {
    fn drop(&mut self) {
        if let Some(task) = self.log_task.take() {
            task.abort();
        }
    }
}

struct Shared {
    orchestrator: Arc<Orchestrator>,
    clients: TcpClients,
    logs: broadcast::Sender<String>,
}

impl Shared {
    /// Handle one request line. Chat replies travel through the transport,
    /// so `None` means nothing more to write.
    async fn respond(&self, state: &mut ClientState, line: &str) -> Option<String> {
        let request: Request = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(_) => return Some(reply_line("error", "Invalid JSON")),
        };

        match request.command.as_str() {
            "chat" => {
                if request.message.trim().is_empty() {
                    return Some(reply_line("error", "Empty message"));
                }
                let event = Event::new(
                    TCP_SOURCE,
                    state.conversation_id.clone(),
                    state.conversation_id.clone(),
                    request.message,
                );
                match self.orchestrator.handle_event(event).await {
                    HandleOutcome::Delivered(_) | HandleOutcome::Failed { .. } => None,
                    HandleOutcome::NoOp => Some(reply_line("ok", "")),
                    HandleOutcome::Blocked { reason } => Some(reply_line("error", &reason)),
                    HandleOutcome::DeliveryFailed { error, .. } => {
                        warn!(conversation = %state.conversation_id, "Reply lost: {}", error);
                        None
                    }
                }
            }
            "clear" => {
                self.orchestrator.end_session(&state.conversation_id).await;
                let fresh = new_conversation_id();
                self.clients.rename(&state.conversation_id, &fresh);
                state.conversation_id = fresh;
                Some(reply_line("ok", "Conversation cleared."))
            }
            "ping" => Some(reply_line("ok", "pong")),
            "logs" => {
                if state.log_task.is_none() {
                    let mut rx = self.logs.subscribe();
                    let writer = state.writer.clone();
                    state.log_task = Some(tokio::spawn(async move {
                        loop {
                            match rx.recv().await {
                                Ok(line) => {
                                    if writer.send(reply_line("log", &line)).is_err() {
                                        break;
                                    }
                                }
                                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                                Err(broadcast::error::RecvError::Closed) => break,
                            }
                        }
                    }));
                }
                Some(reply_line("ok", "Streaming logs."))
            }
            other => Some(reply_line("error", &format!("Unknown command: {}", other))),
        }
    }

    async fn serve_client(self: Arc<Self>, stream: TcpStream, peer: SocketAddr, cancel: CancellationToken) {
        let (read_half, mut write_half) = stream.into_split();
        let (writer, mut outgoing) = mpsc::unbounded_channel::<String>();
        let write_task = tokio::spawn(async move {
            while let Some(mut line) = outgoing.recv().await {
                line.push('\n');
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let mut state = ClientState {
            conversation_id: new_conversation_id(),
            writer: writer.clone(),
            log_task: None,
        };
        self.clients.register(&state.conversation_id, writer);
        info!(peer = %peer, conversation = %state.conversation_id, "Client connected");

        let mut lines = BufReader::new(read_half).lines();
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if let Some(reply) = self.respond(&mut state, line).await
                        && state.writer.send(reply).is_err()
                    {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(peer = %peer, "Client read error: {}", e);
                    break;
                }
            }
        }

        info!(peer = %peer, "Client disconnected");
        self.clients.remove(&state.conversation_id);
        drop(state);
        let _ = write_task.await;
    }
}

/// Newline-delimited JSON server on `host:port`.
pub struct TcpServer {
    host: String,
    port: u16,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    local_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
}

impl TcpServer {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        orchestrator: Arc<Orchestrator>,
        clients: TcpClients,
        logs: broadcast::Sender<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            shared: Arc::new(Shared {
                orchestrator,
                clients,
                logs,
            }),
            cancel,
            local_addr: None,
            accept_task: None,
        }
    }

    /// Bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

#[async_trait]
impl LifecycleComponent for TcpServer {
    fn name(&self) -> &str {
        "tcp-server"
    }

    async fn on_start(&mut self) -> Result<()> {
        let listener = TcpListener::bind((self.host.as_str(), self.port)).await?;
        let addr = listener.local_addr()?;
        self.local_addr = Some(addr);
        info!("TCP server listening on {}", addr);

        let shared = self.shared.clone();
        let cancel = self.cancel.clone();
        self.accept_task = Some(tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(shared.clone().serve_client(stream, peer, cancel.clone()));
                    }
                    Err(e) => error!("Accept failed: {}", e),
                }
            }
        }));
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        info!("TCP server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hooks::HookPipeline;
    use crate::core::llm::Completion;
    use crate::core::llm::embedding::HashEmbedder;
    use crate::core::memory::{MemoryStore, test_memory_system};
    use crate::core::orchestrator::OutboundRouter;
    use crate::core::orchestrator::tests::fixtures::{ScriptedLlm, last_user_text, no_tools, settings};
    use serde_json::Value;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::io::Lines;

    struct Client {
        lines: Lines<BufReader<OwnedReadHalf>>,
        write: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            let (read, write) = TcpStream::connect(addr).await.unwrap().into_split();
            Self {
                lines: BufReader::new(read).lines(),
                write,
            }
        }

        async fn send(&mut self, line: &str) {
            self.write.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
        }

        async fn recv(&mut self) -> Value {
            let line = tokio::time::timeout(std::time::Duration::from_secs(5), self.lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            serde_json::from_str(&line).unwrap()
        }
    }

    async fn start_server(clients: TcpClients) -> (TcpServer, Arc<Orchestrator>) {
        let db = test_memory_system();
        let memory = Arc::new(MemoryStore::new(db.clone(), Arc::new(HashEmbedder::new(32))));
        let mut router = OutboundRouter::new();
        router.add(Arc::new(TcpTransport::new(clients.clone())));
        let llm = ScriptedLlm::new(|req, _| Ok(Completion::text(format!("echo: {}", last_user_text(req)))));
        let orchestrator = Arc::new(Orchestrator::new(
            settings(),
            Arc::new(llm),
            no_tools(),
            HookPipeline::empty(),
            db,
            memory,
            router,
        ));
        let (logs, _) = broadcast::channel(16);
        let mut server = TcpServer::new(
            "127.0.0.1",
            0,
            orchestrator.clone(),
            clients,
            logs,
            CancellationToken::new(),
        );
        server.on_start().await.unwrap();
        (server, orchestrator)
    }

    #[tokio::test]
    async fn chat_ping_and_errors() {
        let (mut server, _) = start_server(TcpClients::new()).await;
        let mut client = Client::connect(server.local_addr().unwrap()).await;

        client.send(r#"{"command":"ping"}"#).await;
        assert_eq!(client.recv().await["response"], "pong");

        client.send(r#"{"command":"chat","message":"hello"}"#).await;
        let reply = client.recv().await;
        assert_eq!(reply["status"], "ok");
        assert_eq!(reply["response"], "echo: hello");

        client.send("not json").await;
        let reply = client.recv().await;
        assert_eq!(reply["status"], "error");
        assert_eq!(reply["response"], "Invalid JSON");

        client.send(r#"{"command":"dance"}"#).await;
        assert_eq!(client.recv().await["response"], "Unknown command: dance");

        server.on_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn clear_starts_a_fresh_conversation() {
        let clients = TcpClients::new();
        let (mut server, _) = start_server(clients.clone()).await;
        let mut client = Client::connect(server.local_addr().unwrap()).await;

        client.send(r#"{"message":"first"}"#).await;
        assert_eq!(client.recv().await["response"], "echo: first");

        client.send(r#"{"command":"clear"}"#).await;
        assert_eq!(client.recv().await["response"], "Conversation cleared.");
        assert_eq!(clients.len(), 1);

        client.send(r#"{"command":"chat","message":"second"}"#).await;
        assert_eq!(client.recv().await["response"], "echo: second");

        server.on_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unowned_proactive_messages_are_broadcast() {
        let clients = TcpClients::new();
        let transport = TcpTransport::new(clients.clone());
        let message = OutboundMessage {
            conversation_id: "tcp:heartbeat".into(),
            text: "Time to stretch".into(),
            in_reply_to: "e1".into(),
            proactive: true,
        };
        assert!(transport.deliver(&message).await.is_err());

        let (tx, mut rx) = mpsc::unbounded_channel();
        clients.register("tcp:someone", tx);
        transport.deliver(&message).await.unwrap();
        let line: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(line["status"], "notification");
        assert_eq!(line["response"], "Time to stretch");

        let reply = OutboundMessage {
            proactive: false,
            ..message
        };
        assert!(transport.deliver(&reply).await.is_err());
    }

    #[test]
    fn dead_writers_are_dropped() {
        let clients = TcpClients::new();
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        clients.register("tcp:a", tx);
        drop(rx);
        assert!(!clients.send("tcp:a", "x".into()));
        assert!(clients.is_empty());
    }
}
