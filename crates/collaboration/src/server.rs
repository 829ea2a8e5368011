/// WebSocket server exposing the realtime document store
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::protocol::{
    ClientMessage, Request, Response, ServerMessage, SubscriptionId, WatchEvent,
};
use crate::{
    AccountStore, AuthToken, Authenticator, CollaborationError, DocumentService, DocumentStore,
    Identity, Result,
};

type Tx = mpsc::UnboundedSender<Message>;

/// Per-connection state
struct Connection {
    addr: SocketAddr,
    tx: Tx,
    identity: Option<Identity>,
    token: Option<AuthToken>,
    watches: HashMap<SubscriptionId, JoinHandle<()>>,
}

impl Connection {
    fn new(addr: SocketAddr, tx: Tx) -> Self {
        Self {
            addr,
            tx,
            identity: None,
            token: None,
            watches: HashMap::new(),
        }
    }

    fn identity(&self) -> Result<&Identity> {
        self.identity
            .as_ref()
            .ok_or(CollaborationError::Unauthenticated)
    }

    fn add_watch(&mut self, subscription: SubscriptionId, task: JoinHandle<()>) {
        // Forwarders end on their own after Deleted or AccessLost
        self.watches.retain(|_, watch| !watch.is_finished());
        if let Some(previous) = self.watches.insert(subscription, task) {
            previous.abort();
        }
    }

    fn clear_watches(&mut self) {
        for (_, task) in self.watches.drain() {
            task.abort();
        }
    }
}

fn send_json(tx: &Tx, message: &ServerMessage) -> Result<()> {
    let json = serde_json::to_string(message)?;
    tx.send(Message::Text(json))
        .map_err(|_| CollaborationError::Closed)
}

/// Serves document requests, auth and live subscriptions to WebSocket clients
pub struct CollaborationServer {
    service: DocumentService,
    authenticator: Arc<Authenticator>,
}

impl CollaborationServer {
    pub fn new(service: DocumentService, authenticator: Arc<Authenticator>) -> Self {
        Self {
            service,
            authenticator,
        }
    }

    /// Server whose documents and accounts live in the same store
    pub fn with_store<S>(store: Arc<S>, min_password_len: usize) -> Self
    where
        S: DocumentStore + AccountStore + 'static,
    {
        let service = DocumentService::new(store.clone());
        let authenticator = Arc::new(Authenticator::new(store, min_password_len));
        Self::new(service, authenticator)
    }

    /// Accept connections until `shutdown` resolves
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        let local = listener
            .local_addr()
            .map_err(|e| CollaborationError::NetworkError(e.to_string()))?;
        info!("Collaboration server listening on: {}", local);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        info!("New connection from: {}", addr);
                        tokio::spawn(self.clone().handle_connection(stream, addr));
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
                _ = &mut shutdown => {
                    info!("Collaboration server shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let ws_stream = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                error!("WebSocket handshake failed for {}: {}", addr, e);
                return;
            }
        };

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel();

        // Task to send messages to client
        let send_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = ws_sender.send(msg).await {
                    debug!("Failed to send message: {}", e);
                    break;
                }
            }
        });

        let mut conn = Connection::new(addr, tx.clone());

        while let Some(msg) = ws_receiver.next().await {
            let msg = match msg {
                Ok(m) => m,
                Err(e) => {
                    warn!("Error receiving message from {}: {}", addr, e);
                    break;
                }
            };

            match msg {
                Message::Text(text) => self.handle_text(&mut conn, &text),
                Message::Ping(data) => {
                    let _ = tx.send(Message::Pong(data));
                }
                Message::Close(_) => {
                    debug!("Client {} requested close", addr);
                    let _ = tx.send(Message::Close(None));
                    break;
                }
                _ => {}
            }
        }

        // Cleanup on disconnect
        conn.clear_watches();
        if let Some(identity) = &conn.identity {
            info!("User {} disconnected from {}", identity.email, conn.addr);
        }
        drop(conn);
        drop(tx);
        let _ = send_task.await;
        info!("Connection closed: {}", addr);
    }

    fn handle_text(&self, conn: &mut Connection, text: &str) {
        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                let err = CollaborationError::SerializationError(e.to_string());
                let _ = send_json(&conn.tx, &ServerMessage::error(None, &err));
                return;
            }
        };

        let reply = match message {
            ClientMessage::Ping => ServerMessage::Pong,
            ClientMessage::Request { id, request } => match self.handle_request(conn, request) {
                Ok(response) => ServerMessage::Response { id, response },
                Err(e) => {
                    debug!("Request {} from {} failed: {}", id, conn.addr, e);
                    ServerMessage::error(Some(id), &e)
                }
            },
        };

        if let Err(e) = send_json(&conn.tx, &reply) {
            debug!("Failed to reply to {}: {}", conn.addr, e);
        }
    }

    fn handle_request(&self, conn: &mut Connection, request: Request) -> Result<Response> {
        if request.requires_identity() {
            conn.identity()?;
        }

        match request {
            Request::SignUp { credentials } => {
                let session = self.authenticator.sign_up(&credentials)?;
                Ok(self.start_session(conn, session.identity, session.token))
            }

            Request::SignIn { credentials } => {
                let session = self.authenticator.sign_in(&credentials)?;
                Ok(self.start_session(conn, session.identity, session.token))
            }

            Request::Resume { token } => {
                let identity = self.authenticator.resume(&token)?;
                conn.clear_watches();
                conn.identity = Some(identity.clone());
                conn.token = Some(token);
                Ok(Response::Resumed { identity })
            }

            Request::SignOut => {
                if let Some(token) = conn.token.take() {
                    self.authenticator.sign_out(&token);
                }
                conn.identity = None;
                conn.clear_watches();
                Ok(Response::Done)
            }

            Request::Create { title } => {
                let document = self.service.create(conn.identity()?, &title)?;
                Ok(Response::Document {
                    document: Some(document),
                })
            }

            Request::Get { document } => Ok(Response::Document {
                document: self.service.get(conn.identity()?, document)?,
            }),

            Request::Update { document, patch } => Ok(Response::Document {
                document: Some(self.service.update(conn.identity()?, document, &patch)?),
            }),

            Request::Share {
                document,
                email,
                role,
            } => Ok(Response::Document {
                document: Some(self.service.share(conn.identity()?, document, &email, role)?),
            }),

            Request::Revoke { document, email } => Ok(Response::Document {
                document: Some(self.service.revoke(conn.identity()?, document, &email)?),
            }),

            Request::Delete { document } => {
                self.service.delete(conn.identity()?, document)?;
                Ok(Response::Done)
            }

            Request::Query { query } => Ok(Response::Documents {
                documents: self.service.query(conn.identity()?, &query)?,
            }),

            Request::WatchDocument {
                document,
                subscription,
            } => {
                let mut source = self.service.watch_document(conn.identity()?, document)?;
                let tx = conn.tx.clone();
                let task = tokio::spawn(async move {
                    while let Some(event) = source.recv().await {
                        let msg = ServerMessage::Event {
                            subscription,
                            event: WatchEvent::Document { event },
                        };
                        if send_json(&tx, &msg).is_err() {
                            break;
                        }
                    }
                });
                conn.add_watch(subscription, task);
                Ok(Response::Done)
            }

            Request::WatchQuery {
                query,
                subscription,
            } => {
                let mut source = self.service.watch_query(conn.identity()?, &query)?;
                let tx = conn.tx.clone();
                let task = tokio::spawn(async move {
                    while let Some(documents) = source.recv().await {
                        let msg = ServerMessage::Event {
                            subscription,
                            event: WatchEvent::Query { documents },
                        };
                        if send_json(&tx, &msg).is_err() {
                            break;
                        }
                    }
                });
                conn.add_watch(subscription, task);
                Ok(Response::Done)
            }

            Request::Unwatch { subscription } => {
                if let Some(task) = conn.watches.remove(&subscription) {
                    task.abort();
                }
                Ok(Response::Done)
            }
        }
    }

    fn start_session(&self, conn: &mut Connection, identity: Identity, token: AuthToken) -> Response {
        conn.clear_watches();
        conn.identity = Some(identity.clone());
        conn.token = Some(token.clone());
        Response::SignedIn { identity, token }
    }
}
