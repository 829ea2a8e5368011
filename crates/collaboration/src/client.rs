/// Document clients used by rendering code: in-process and over WebSocket
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::protocol::{
    ClientMessage, Request, RequestId, Response, ServerMessage, SubscriptionId, WatchEvent,
};
use crate::{
    AuthBackend, AuthSession, AuthToken, Authenticator, CollaborationError, Credentials,
    Document, DocumentEvent, DocumentId, DocumentPatch, DocumentQuery, DocumentService,
    Identity, Result, Role, SignedIn, Subscription,
};

/// Document operations on behalf of the signed-in user
#[async_trait]
pub trait DocumentClient: Send + Sync {
    fn auth(&self) -> &AuthSession;

    fn current_user(&self) -> Result<Identity> {
        self.auth().require_user()
    }

    async fn create_document(&self, title: &str) -> Result<Document>;

    async fn get_document(&self, id: DocumentId) -> Result<Option<Document>>;

    async fn update_document(&self, id: DocumentId, patch: DocumentPatch) -> Result<Document>;

    async fn share_document(&self, id: DocumentId, email: &str, role: Role) -> Result<Document>;

    async fn revoke_access(&self, id: DocumentId, email: &str) -> Result<Document>;

    async fn delete_document(&self, id: DocumentId) -> Result<()>;

    async fn query_documents(&self, query: DocumentQuery) -> Result<Vec<Document>>;

    async fn watch_document(&self, id: DocumentId) -> Result<Subscription<DocumentEvent>>;

    async fn watch_query(&self, query: DocumentQuery) -> Result<Subscription<Vec<Document>>>;
}

/// Client talking directly to an in-process service
pub struct LocalClient {
    service: DocumentService,
    authenticator: Arc<Authenticator>,
    auth: AuthSession,
    token: Mutex<Option<AuthToken>>,
}

impl LocalClient {
    pub fn new(service: DocumentService, authenticator: Arc<Authenticator>) -> Self {
        let auth = AuthSession::new();
        auth.set_signed_out();
        Self {
            service,
            authenticator,
            auth,
            token: Mutex::new(None),
        }
    }

    fn signed_in(&self, session: SignedIn) -> SignedIn {
        *self.token.lock() = Some(session.token.clone());
        self.auth.set_signed_in(session.identity.clone());
        session
    }
}

#[async_trait]
impl AuthBackend for LocalClient {
    async fn sign_up(&self, credentials: Credentials) -> Result<SignedIn> {
        let session = self.authenticator.sign_up(&credentials)?;
        Ok(self.signed_in(session))
    }

    async fn sign_in(&self, credentials: Credentials) -> Result<SignedIn> {
        let session = self.authenticator.sign_in(&credentials)?;
        Ok(self.signed_in(session))
    }

    async fn resume(&self, token: AuthToken) -> Result<Identity> {
        let identity = self.authenticator.resume(&token)?;
        *self.token.lock() = Some(token);
        self.auth.set_signed_in(identity.clone());
        Ok(identity)
    }

    async fn sign_out(&self) -> Result<()> {
        if let Some(token) = self.token.lock().take() {
            self.authenticator.sign_out(&token);
        }
        self.auth.set_signed_out();
        Ok(())
    }
}

#[async_trait]
impl DocumentClient for LocalClient {
    fn auth(&self) -> &AuthSession {
        &self.auth
    }

    async fn create_document(&self, title: &str) -> Result<Document> {
        self.service.create(&self.current_user()?, title)
    }

    async fn get_document(&self, id: DocumentId) -> Result<Option<Document>> {
        self.service.get(&self.current_user()?, id)
    }

    async fn update_document(&self, id: DocumentId, patch: DocumentPatch) -> Result<Document> {
        self.service.update(&self.current_user()?, id, &patch)
    }

    async fn share_document(&self, id: DocumentId, email: &str, role: Role) -> Result<Document> {
        self.service.share(&self.current_user()?, id, email, role)
    }

    async fn revoke_access(&self, id: DocumentId, email: &str) -> Result<Document> {
        self.service.revoke(&self.current_user()?, id, email)
    }

    async fn delete_document(&self, id: DocumentId) -> Result<()> {
        self.service.delete(&self.current_user()?, id)
    }

    async fn query_documents(&self, query: DocumentQuery) -> Result<Vec<Document>> {
        self.service.query(&self.current_user()?, &query)
    }

    async fn watch_document(&self, id: DocumentId) -> Result<Subscription<DocumentEvent>> {
        self.service.watch_document(&self.current_user()?, id)
    }

    async fn watch_query(&self, query: DocumentQuery) -> Result<Subscription<Vec<Document>>> {
        self.service.watch_query(&self.current_user()?, &query)
    }
}

enum WatchRoute {
    Document(mpsc::UnboundedSender<DocumentEvent>),
    Query(mpsc::UnboundedSender<Vec<Document>>),
}

struct RemoteInner {
    outbound: mpsc::UnboundedSender<Message>,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<Result<Response>>>>,
    watches: Mutex<HashMap<SubscriptionId, WatchRoute>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl RemoteInner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, message: &ClientMessage) -> Result<()> {
        let text = serde_json::to_string(message)?;
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| CollaborationError::Closed)
    }

    /// Fire a request without waiting for its response
    fn send_forget(&self, request: Request) {
        let id = self.next_id();
        if let Err(e) = self.send(&ClientMessage::Request { id, request }) {
            debug!("Dropped request {}: {}", id, e);
        }
    }

    fn dispatch(&self, text: &str) {
        let message: ServerMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                error!("Failed to parse server message: {}", e);
                return;
            }
        };

        match message {
            ServerMessage::Response { id, response } => self.complete(id, Ok(response)),
            ServerMessage::Error {
                id: Some(id),
                code,
                message,
            } => self.complete(id, Err(CollaborationError::from_wire(&code, message))),
            ServerMessage::Error {
                id: None,
                code,
                message,
            } => warn!("Server error {}: {}", code, message),
            ServerMessage::Event {
                subscription,
                event,
            } => self.route(subscription, event),
            ServerMessage::Pong => debug!("Received pong"),
        }
    }

    fn complete(&self, id: RequestId, result: Result<Response>) {
        match self.pending.lock().remove(&id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!("Response for unknown request {}", id),
        }
    }

    fn route(&self, subscription: SubscriptionId, event: WatchEvent) {
        let mut watches = self.watches.lock();
        let delivered = match (watches.get(&subscription), event) {
            (Some(WatchRoute::Document(tx)), WatchEvent::Document { event }) => {
                tx.send(event).is_ok()
            }
            (Some(WatchRoute::Query(tx)), WatchEvent::Query { documents }) => {
                tx.send(documents).is_ok()
            }
            (Some(_), _) => {
                warn!("Event kind mismatch for subscription {}", subscription);
                true
            }
            (None, _) => return,
        };
        if !delivered {
            watches.remove(&subscription);
        }
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let pending: Vec<_> = self.pending.lock().drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(CollaborationError::NetworkError(
                "connection closed".to_string(),
            )));
        }
        self.watches.lock().clear();
    }
}

/// Client for a remote `CollaborationServer`
#[derive(Clone)]
pub struct RemoteClient {
    inner: Arc<RemoteInner>,
    auth: AuthSession,
}

impl RemoteClient {
    /// Connect to a server at a `ws://` URL
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| CollaborationError::NetworkError(format!("connect {url}: {e}")))?;
        info!("Connected to {}", url);

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let inner = Arc::new(RemoteInner {
            outbound: tx,
            pending: Mutex::new(HashMap::new()),
            watches: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });

        // Task to send messages to the server
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = ws_sender.send(msg).await {
                    debug!("Failed to send message: {}", e);
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        // Task to dispatch server messages; holds only a weak handle so
        // dropping the last client closes the connection
        let weak: Weak<RemoteInner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                let Some(inner) = weak.upgrade() else { break };
                match msg {
                    Ok(Message::Text(text)) => inner.dispatch(&text),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Connection error: {}", e);
                        break;
                    }
                }
            }
            if let Some(inner) = weak.upgrade() {
                inner.shutdown();
            }
            debug!("Connection reader stopped");
        });

        let auth = AuthSession::new();
        Ok(Self { inner, auth })
    }

    /// Mark the auth state as checked with no session to restore
    pub fn mark_signed_out(&self) {
        self.auth.set_signed_out();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close the connection; pending requests fail
    pub fn close(&self) {
        let _ = self.inner.outbound.send(Message::Close(None));
    }

    pub fn ping(&self) -> Result<()> {
        self.inner.send(&ClientMessage::Ping)
    }

    async fn request(&self, request: Request) -> Result<Response> {
        let id = self.inner.next_id();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, tx);

        if self.inner.closed.load(Ordering::SeqCst) {
            self.inner.pending.lock().remove(&id);
            return Err(CollaborationError::Closed);
        }
        if let Err(e) = self.inner.send(&ClientMessage::Request { id, request }) {
            self.inner.pending.lock().remove(&id);
            return Err(e);
        }

        rx.await.map_err(|_| CollaborationError::Closed)?
    }

    async fn request_document(&self, request: Request) -> Result<Document> {
        match self.request(request).await? {
            Response::Document {
                document: Some(document),
            } => Ok(document),
            other => Err(unexpected(other)),
        }
    }

    async fn watch(
        &self,
        route: WatchRoute,
        request: impl FnOnce(SubscriptionId) -> Request,
    ) -> Result<SubscriptionId> {
        let subscription = self.inner.next_id();
        self.inner.watches.lock().insert(subscription, route);

        match self.request(request(subscription)).await {
            Ok(Response::Done) => Ok(subscription),
            Ok(other) => {
                self.inner.watches.lock().remove(&subscription);
                Err(unexpected(other))
            }
            Err(e) => {
                self.inner.watches.lock().remove(&subscription);
                Err(e)
            }
        }
    }

    fn unwatch_on_drop(&self, subscription: SubscriptionId) -> impl FnOnce() + Send + 'static {
        let weak = Arc::downgrade(&self.inner);
        move || {
            if let Some(inner) = weak.upgrade() {
                inner.watches.lock().remove(&subscription);
                inner.send_forget(Request::Unwatch { subscription });
            }
        }
    }
}

fn unexpected(response: Response) -> CollaborationError {
    CollaborationError::NetworkError(format!("unexpected response {response:?}"))
}

#[async_trait]
impl AuthBackend for RemoteClient {
    async fn sign_up(&self, credentials: Credentials) -> Result<SignedIn> {
        match self.request(Request::SignUp { credentials }).await? {
            Response::SignedIn { identity, token } => {
                self.auth.set_signed_in(identity.clone());
                Ok(SignedIn { identity, token })
            }
            other => Err(unexpected(other)),
        }
    }

    async fn sign_in(&self, credentials: Credentials) -> Result<SignedIn> {
        match self.request(Request::SignIn { credentials }).await? {
            Response::SignedIn { identity, token } => {
                self.auth.set_signed_in(identity.clone());
                Ok(SignedIn { identity, token })
            }
            other => Err(unexpected(other)),
        }
    }

    async fn resume(&self, token: AuthToken) -> Result<Identity> {
        match self.request(Request::Resume { token }).await {
            Ok(Response::Resumed { identity }) => {
                self.auth.set_signed_in(identity.clone());
                Ok(identity)
            }
            Ok(other) => Err(unexpected(other)),
            Err(e) => {
                self.auth.set_signed_out();
                Err(e)
            }
        }
    }

    async fn sign_out(&self) -> Result<()> {
        self.request(Request::SignOut).await?;
        self.auth.set_signed_out();
        Ok(())
    }
}

#[async_trait]
impl DocumentClient for RemoteClient {
    fn auth(&self) -> &AuthSession {
        &self.auth
    }

    async fn create_document(&self, title: &str) -> Result<Document> {
        self.request_document(Request::Create {
            title: title.to_string(),
        })
        .await
    }

    async fn get_document(&self, id: DocumentId) -> Result<Option<Document>> {
        match self.request(Request::Get { document: id }).await? {
            Response::Document { document } => Ok(document),
            other => Err(unexpected(other)),
        }
    }

    async fn update_document(&self, id: DocumentId, patch: DocumentPatch) -> Result<Document> {
        self.request_document(Request::Update {
            document: id,
            patch,
        })
        .await
    }

    async fn share_document(&self, id: DocumentId, email: &str, role: Role) -> Result<Document> {
        self.request_document(Request::Share {
            document: id,
            email: email.to_string(),
            role,
        })
        .await
    }

    async fn revoke_access(&self, id: DocumentId, email: &str) -> Result<Document> {
        self.request_document(Request::Revoke {
            document: id,
            email: email.to_string(),
        })
        .await
    }

    async fn delete_document(&self, id: DocumentId) -> Result<()> {
        match self.request(Request::Delete { document: id }).await? {
            Response::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn query_documents(&self, query: DocumentQuery) -> Result<Vec<Document>> {
        match self.request(Request::Query { query }).await? {
            Response::Documents { documents } => Ok(documents),
            other => Err(unexpected(other)),
        }
    }

    async fn watch_document(&self, id: DocumentId) -> Result<Subscription<DocumentEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self
            .watch(WatchRoute::Document(tx), |subscription| {
                Request::WatchDocument {
                    document: id,
                    subscription,
                }
            })
            .await?;
        Ok(Subscription::with_cancel(
            rx,
            self.unwatch_on_drop(subscription),
        ))
    }

    async fn watch_query(&self, query: DocumentQuery) -> Result<Subscription<Vec<Document>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self
            .watch(WatchRoute::Query(tx), |subscription| Request::WatchQuery {
                query,
                subscription,
            })
            .await?;
        Ok(Subscription::with_cancel(
            rx,
            self.unwatch_on_drop(subscription),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    fn local_pair() -> (LocalClient, LocalClient) {
        let store = Arc::new(MemoryStore::new());
        let service = DocumentService::new(store.clone());
        let authenticator = Arc::new(Authenticator::new(store, 6));
        (
            LocalClient::new(service.clone(), authenticator.clone()),
            LocalClient::new(service, authenticator),
        )
    }

    #[tokio::test]
    async fn test_local_client_requires_sign_in() {
        let (alice, _) = local_pair();
        let err = alice.create_document("Notes").await.unwrap_err();
        assert_eq!(err, CollaborationError::Unauthenticated);
    }

    #[tokio::test]
    async fn test_local_clients_share_a_store() {
        let (alice, bob) = local_pair();
        alice
            .sign_up(Credentials::new("alice@example.com", "hunter22"))
            .await
            .unwrap();
        bob.sign_up(Credentials::new("bob@example.com", "hunter22"))
            .await
            .unwrap();

        let doc = alice.create_document("Notes").await.unwrap();
        assert!(bob.get_document(doc.id).await.is_err());

        alice
            .share_document(doc.id, "bob@example.com", Role::Editor)
            .await
            .unwrap();
        bob.update_document(doc.id, DocumentPatch::content("from bob"))
            .await
            .unwrap();
        let seen = alice.get_document(doc.id).await.unwrap().unwrap();
        assert_eq!(seen.content, "from bob");
    }

    #[tokio::test]
    async fn test_local_sign_out_and_resume() {
        let (alice, other) = local_pair();
        let session = alice
            .sign_up(Credentials::new("alice@example.com", "hunter22"))
            .await
            .unwrap();

        other.resume(session.token.clone()).await.unwrap();
        assert_eq!(other.current_user().unwrap(), session.identity);

        alice.sign_out().await.unwrap();
        assert!(alice.current_user().is_err());
        assert!(other.resume(session.token).await.is_err());
    }
}
