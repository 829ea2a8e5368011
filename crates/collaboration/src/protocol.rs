/// Wire protocol between the document server and its clients
///
/// JSON text frames over WebSocket. Requests carry a client-chosen id that the
/// matching response or error echoes back. Watch requests also carry a
/// client-chosen subscription id so events can be routed before the response
/// arrives.
use serde::{Deserialize, Serialize};

use crate::{
    AuthToken, CollaborationError, Credentials, Document, DocumentEvent, DocumentId,
    DocumentPatch, DocumentQuery, Identity, Role,
};

pub type RequestId = u64;
pub type SubscriptionId = u64;

/// Messages sent by clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "request")]
    Request { id: RequestId, request: Request },

    #[serde(rename = "ping")]
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Request {
    #[serde(rename = "sign_up")]
    SignUp { credentials: Credentials },

    #[serde(rename = "sign_in")]
    SignIn { credentials: Credentials },

    #[serde(rename = "resume")]
    Resume { token: AuthToken },

    #[serde(rename = "sign_out")]
    SignOut,

    #[serde(rename = "create")]
    Create { title: String },

    #[serde(rename = "get")]
    Get { document: DocumentId },

    #[serde(rename = "update")]
    Update {
        document: DocumentId,
        patch: DocumentPatch,
    },

    #[serde(rename = "share")]
    Share {
        document: DocumentId,
        email: String,
        role: Role,
    },

    #[serde(rename = "revoke")]
    Revoke { document: DocumentId, email: String },

    #[serde(rename = "delete")]
    Delete { document: DocumentId },

    #[serde(rename = "query")]
    Query { query: DocumentQuery },

    #[serde(rename = "watch_document")]
    WatchDocument {
        document: DocumentId,
        subscription: SubscriptionId,
    },

    #[serde(rename = "watch_query")]
    WatchQuery {
        query: DocumentQuery,
        subscription: SubscriptionId,
    },

    #[serde(rename = "unwatch")]
    Unwatch { subscription: SubscriptionId },
}

impl Request {
    /// Requests that need a signed-in connection
    pub fn requires_identity(&self) -> bool {
        !matches!(
            self,
            Request::SignUp { .. } | Request::SignIn { .. } | Request::Resume { .. }
        )
    }
}

/// Messages sent by the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "response")]
    Response { id: RequestId, response: Response },

    #[serde(rename = "error")]
    Error {
        id: Option<RequestId>,
        code: String,
        message: String,
    },

    #[serde(rename = "event")]
    Event {
        subscription: SubscriptionId,
        event: WatchEvent,
    },

    #[serde(rename = "pong")]
    Pong,
}

impl ServerMessage {
    pub fn error(id: Option<RequestId>, err: &CollaborationError) -> Self {
        ServerMessage::Error {
            id,
            code: err.code().to_string(),
            message: err.detail(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Response {
    #[serde(rename = "signed_in")]
    SignedIn { identity: Identity, token: AuthToken },

    #[serde(rename = "resumed")]
    Resumed { identity: Identity },

    #[serde(rename = "document")]
    Document { document: Option<Document> },

    #[serde(rename = "documents")]
    Documents { documents: Vec<Document> },

    #[serde(rename = "done")]
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum WatchEvent {
    #[serde(rename = "document")]
    Document { event: DocumentEvent },

    #[serde(rename = "query")]
    Query { documents: Vec<Document> },
}
