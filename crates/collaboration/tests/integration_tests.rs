/// Collaborative editing integration tests
/// Multi-user scenarios over the in-process client and over a real WebSocket server
use collaboration::config::{DashboardConfig, EditorConfig};
use collaboration::*;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

fn fast_editor() -> EditorConfig {
    EditorConfig {
        content_debounce_ms: 20,
        title_debounce_ms: 30,
        status_clear_ms: 50,
    }
}

async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

struct Local {
    service: DocumentService,
    authenticator: Arc<Authenticator>,
}

impl Local {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            service: DocumentService::new(store.clone()),
            authenticator: Arc::new(Authenticator::new(store, 6)),
        }
    }

    async fn user(&self, email: &str) -> Arc<LocalClient> {
        let client = Arc::new(LocalClient::new(
            self.service.clone(),
            self.authenticator.clone(),
        ));
        client
            .sign_up(Credentials::new(email, "hunter22"))
            .await
            .unwrap();
        client
    }
}

#[tokio::test(start_paused = true)]
async fn test_two_editors_converge() {
    let local = Local::new();
    let alice = local.user("alice@example.com").await;
    let bob = local.user("bob@example.com").await;

    let doc = alice.create_document("Trip").await.unwrap();
    alice
        .share_document(doc.id, "bob@example.com", Role::Editor)
        .await
        .unwrap();

    let config = EditorConfig::default();
    let alice_editor = EditorSession::open(alice.clone(), doc.id, &config)
        .await
        .unwrap();
    let bob_editor = EditorSession::open(bob.clone(), doc.id, &config)
        .await
        .unwrap();
    assert_eq!(bob_editor.view().role, Some(Role::Editor));

    bob_editor.edit_content("Pack sunscreen").unwrap();
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(alice_editor.view().content, "Pack sunscreen");

    alice_editor.edit_title("Beach trip").unwrap();
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(bob_editor.view().title, "Beach trip");
    assert_eq!(bob_editor.view().content, "Pack sunscreen");
}

#[tokio::test(start_paused = true)]
async fn test_last_writer_wins_on_the_same_field() {
    let local = Local::new();
    let alice = local.user("alice@example.com").await;
    let bob = local.user("bob@example.com").await;

    let doc = alice.create_document("Shared").await.unwrap();
    alice
        .share_document(doc.id, "bob@example.com", Role::Editor)
        .await
        .unwrap();

    let config = EditorConfig::default();
    let alice_editor = EditorSession::open(alice.clone(), doc.id, &config)
        .await
        .unwrap();
    let bob_editor = EditorSession::open(bob.clone(), doc.id, &config)
        .await
        .unwrap();

    alice_editor.edit_content("alice was here").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    bob_editor.edit_content("bob was here").unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    let stored = alice.get_document(doc.id).await.unwrap().unwrap();
    assert_eq!(stored.content, "bob was here");
    assert_eq!(alice_editor.view().content, "bob was here");
    assert_eq!(bob_editor.view().content, "bob was here");
}

#[tokio::test]
async fn test_dashboard_sees_shares_and_deletes() {
    let local = Local::new();
    let alice = local.user("alice@example.com").await;
    let bob = local.user("bob@example.com").await;

    let dashboard = Dashboard::open(bob.clone(), &DashboardConfig::default())
        .await
        .unwrap();
    let mut rx = dashboard.subscribe();

    let doc = alice.create_document("Minutes").await.unwrap();
    alice
        .share_document(doc.id, "BOB@example.com", Role::Viewer)
        .await
        .unwrap();
    within(rx.wait_for(|view| view.shared.len() == 1))
        .await
        .unwrap();

    alice.delete_document(doc.id).await.unwrap();
    within(rx.wait_for(|view| view.shared.is_empty()))
        .await
        .unwrap();
}

#[test]
fn test_sqlite_store_keeps_documents_and_accounts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("docs.db");

    let (identity, doc_id) = {
        let store = Arc::new(SqliteStore::open_or_create(&path).unwrap());
        let service = DocumentService::new(store.clone());
        let auth = Authenticator::new(store, 6);

        let owner = auth
            .sign_up(&Credentials::new("owner@example.com", "hunter22"))
            .unwrap()
            .identity;
        let doc = service.create(&owner, "Persistent").unwrap();
        service
            .update(&owner, doc.id, &DocumentPatch::content("still here"))
            .unwrap();
        service
            .share(&owner, doc.id, "friend@example.com", Role::Editor)
            .unwrap();
        (owner, doc.id)
    };

    let store = Arc::new(SqliteStore::open_or_create(&path).unwrap());
    let service = DocumentService::new(store.clone());
    let auth = Authenticator::new(store, 6);

    let again = auth
        .sign_in(&Credentials::new("owner@example.com", "hunter22"))
        .unwrap();
    assert_eq!(again.identity, identity);

    let doc = service.get(&identity, doc_id).unwrap().unwrap();
    assert_eq!(doc.content, "still here");
    assert_eq!(doc.collaborators.get("friend@example.com"), Some(&Role::Editor));
}

async fn start_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(CollaborationServer::with_store(
        Arc::new(MemoryStore::new()),
        6,
    ));
    tokio::spawn(server.serve(listener, std::future::pending()));
    format!("ws://{addr}")
}

async fn remote_user(url: &str, email: &str) -> RemoteClient {
    let client = RemoteClient::connect(url).await.unwrap();
    client
        .sign_up(Credentials::new(email, "hunter22"))
        .await
        .unwrap();
    client
}

#[tokio::test]
async fn test_server_requires_sign_in() {
    let url = start_server().await;
    let client = RemoteClient::connect(&url).await.unwrap();

    let err = client.create_document("Nope").await.unwrap_err();
    assert_eq!(err, CollaborationError::Unauthenticated);

    let err = client
        .sign_in(Credentials::new("ghost@example.com", "hunter22"))
        .await
        .unwrap_err();
    assert!(matches!(err, CollaborationError::AuthFailed(_)));

    client.ping().unwrap();
    client.close();
    within(async {
        while !client.is_closed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    let err = client
        .sign_in(Credentials::new("ghost@example.com", "hunter22"))
        .await
        .unwrap_err();
    assert_eq!(err, CollaborationError::Closed);
}

#[tokio::test]
async fn test_remote_round_trip_with_live_updates() {
    let url = start_server().await;
    let alice = remote_user(&url, "alice@example.com").await;
    let bob = remote_user(&url, "bob@example.com").await;

    let doc = alice.create_document("Remote notes").await.unwrap();
    let err = bob.get_document(doc.id).await.unwrap_err();
    assert!(matches!(err, CollaborationError::PermissionDenied(_)));

    alice
        .share_document(doc.id, "bob@example.com", Role::Editor)
        .await
        .unwrap();

    let mut events = bob.watch_document(doc.id).await.unwrap();
    match within(events.recv()).await {
        Some(DocumentEvent::Changed { document }) => assert_eq!(document.title, "Remote notes"),
        other => panic!("unexpected {other:?}"),
    }

    alice
        .update_document(doc.id, DocumentPatch::content("hello bob"))
        .await
        .unwrap();
    match within(events.recv()).await {
        Some(DocumentEvent::Changed { document }) => assert_eq!(document.content, "hello bob"),
        other => panic!("unexpected {other:?}"),
    }

    alice.revoke_access(doc.id, "bob@example.com").await.unwrap();
    assert_eq!(within(events.recv()).await, Some(DocumentEvent::AccessLost));
}

#[tokio::test]
async fn test_remote_editor_and_dashboard() {
    let url = start_server().await;
    let alice = Arc::new(remote_user(&url, "alice@example.com").await);
    let bob = Arc::new(remote_user(&url, "bob@example.com").await);

    let dashboard = Dashboard::open(bob.clone(), &DashboardConfig::default())
        .await
        .unwrap();
    let mut listing = dashboard.subscribe();

    let doc = alice.create_document("Agenda").await.unwrap();
    alice
        .share_document(doc.id, "bob@example.com", Role::Editor)
        .await
        .unwrap();
    within(listing.wait_for(|view| view.shared.len() == 1))
        .await
        .unwrap();

    let config = fast_editor();
    let alice_editor = EditorSession::open(alice.clone(), doc.id, &config)
        .await
        .unwrap();
    let bob_editor = EditorSession::open(bob.clone(), doc.id, &config)
        .await
        .unwrap();

    bob_editor.edit_content("1. Budget").unwrap();
    let mut alice_view = alice_editor.subscribe();
    within(alice_view.wait_for(|view| view.content == "1. Budget"))
        .await
        .unwrap();

    let shared = within(listing.wait_for(|view| {
        view.shared
            .first()
            .is_some_and(|summary| summary.preview.starts_with("1. Budget"))
    }))
    .await
    .unwrap()
    .clone();
    assert_eq!(shared.shared[0].role, Role::Editor);

    let mut bob_view = bob_editor.subscribe();
    alice.delete_document(doc.id).await.unwrap();
    within(bob_view.wait_for(|view| view.phase == DocumentPhase::Deleted))
        .await
        .unwrap();
    bob_editor.close().await;
    alice_editor.close().await;
}

#[tokio::test]
async fn test_resume_on_a_new_connection() {
    let url = start_server().await;
    let first = RemoteClient::connect(&url).await.unwrap();
    let session = first
        .sign_up(Credentials::new("carol@example.com", "hunter22"))
        .await
        .unwrap();
    let doc = first.create_document("Diary").await.unwrap();
    first.close();

    let second = RemoteClient::connect(&url).await.unwrap();
    let identity = second.resume(session.token.clone()).await.unwrap();
    assert_eq!(identity, session.identity);
    assert!(second.get_document(doc.id).await.unwrap().is_some());

    second.sign_out().await.unwrap();
    let third = RemoteClient::connect(&url).await.unwrap();
    assert!(third.resume(session.token).await.is_err());
}
