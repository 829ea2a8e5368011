/// Realtime document storage: CRUD plus change subscriptions
///
/// Stores perform no authorization; `DocumentService` layers the permission
/// checks on top.
use tokio::sync::mpsc;

use crate::{Document, DocumentEvent, DocumentId, DocumentQuery, Result};

mod hub;
pub(crate) use hub::ChangeHub;

mod memory;
pub use memory::MemoryStore;

mod sqlite;
pub use sqlite::SqliteStore;

pub trait DocumentStore: Send + Sync {
    /// Insert a new document
    fn insert(&self, doc: Document) -> Result<()>;

    fn get(&self, id: DocumentId) -> Result<Option<Document>>;

    /// Atomically read, change and write back a document
    ///
    /// Nothing is written when `f` fails. Fails with `DocumentNotFound` if the
    /// document does not exist.
    fn modify(
        &self,
        id: DocumentId,
        f: &mut dyn FnMut(&mut Document) -> Result<()>,
    ) -> Result<Document>;

    /// Delete a document, returning whether it existed
    fn remove(&self, id: DocumentId) -> Result<bool>;

    /// Matching documents, most recently updated first
    fn query(&self, query: &DocumentQuery) -> Result<Vec<Document>>;

    /// Current state followed by every later change of one document
    fn watch_document(&self, id: DocumentId) -> Result<Subscription<DocumentEvent>>;

    /// Current result set followed by the re-evaluated set after each change
    fn watch_query(&self, query: &DocumentQuery) -> Result<Subscription<Vec<Document>>>;
}

/// Stream of change notifications
///
/// Dropping the subscription detaches it from its source.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self { rx, on_drop: None }
    }

    /// Subscription that runs `cancel` when dropped
    pub fn with_cancel(rx: mpsc::UnboundedReceiver<T>, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            rx,
            on_drop: Some(Box::new(cancel)),
        }
    }

    /// Next notification, or `None` once the source has gone away
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Next notification if one is already queued
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(cancel) = self.on_drop.take() {
            cancel();
        }
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// Shared behaviour every store implementation must satisfy
#[cfg(test)]
pub(crate) mod conformance {
    use super::*;
    use crate::{CollaborationError, DocumentPatch, Identity, Role, UserId};

    fn owner() -> Identity {
        Identity::new(UserId::new(), "owner@example.com")
    }

    pub fn crud(store: &dyn DocumentStore) {
        let doc = Document::new(&owner(), "Notes");
        store.insert(doc.clone()).unwrap();
        assert_eq!(store.get(doc.id).unwrap(), Some(doc.clone()));

        let updated = store
            .modify(doc.id, &mut |d| {
                d.apply(&DocumentPatch::content("hello"));
                Ok(())
            })
            .unwrap();
        assert_eq!(updated.content, "hello");
        assert_eq!(store.get(doc.id).unwrap().unwrap().content, "hello");

        // a failing closure leaves the stored document alone
        let err = store
            .modify(doc.id, &mut |d| {
                d.content = "lost".to_string();
                Err(CollaborationError::InvalidInput("nope".to_string()))
            })
            .unwrap_err();
        assert!(matches!(err, CollaborationError::InvalidInput(_)));
        assert_eq!(store.get(doc.id).unwrap().unwrap().content, "hello");

        assert!(store.remove(doc.id).unwrap());
        assert!(!store.remove(doc.id).unwrap());
        assert_eq!(store.get(doc.id).unwrap(), None);
        assert!(matches!(
            store.modify(doc.id, &mut |_| Ok(())),
            Err(CollaborationError::DocumentNotFound(_))
        ));
    }

    pub fn collaborators_roundtrip(store: &dyn DocumentStore) {
        let mut doc = Document::new(&owner(), "Shared");
        doc.collaborators
            .insert("ed@example.com".to_string(), Role::Editor);
        doc.collaborators
            .insert("vi@example.com".to_string(), Role::Viewer);
        store.insert(doc.clone()).unwrap();
        assert_eq!(store.get(doc.id).unwrap().unwrap().collaborators, doc.collaborators);

        store
            .modify(doc.id, &mut |d| {
                d.collaborators.remove("vi@example.com");
                Ok(())
            })
            .unwrap();
        let stored = store.get(doc.id).unwrap().unwrap();
        assert_eq!(stored.collaborators.len(), 1);
        assert_eq!(stored.collaborators.get("ed@example.com"), Some(&Role::Editor));
    }

    pub fn queries(store: &dyn DocumentStore) {
        let alice = owner();
        let bob = Identity::new(UserId::new(), "bob@example.com");

        let mut older = Document::new(&alice, "older");
        older.updated_at = 1_000;
        let mut newer = Document::new(&alice, "newer");
        newer.updated_at = 2_000;
        newer
            .collaborators
            .insert(bob.email.clone(), Role::Viewer);
        let mut other = Document::new(&bob, "bob's");
        other.updated_at = 3_000;

        for doc in [&older, &newer, &other] {
            store.insert(doc.clone()).unwrap();
        }

        let owned = store.query(&DocumentQuery::owned_by(&alice)).unwrap();
        let titles: Vec<&str> = owned.iter().map(|d| d.title.as_str()).collect();
        assert_eq!(titles, vec!["newer", "older"]);

        let shared = store.query(&DocumentQuery::shared_with(&bob)).unwrap();
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].id, newer.id);
    }

    pub async fn watches(store: &dyn DocumentStore) {
        let alice = owner();
        let doc = Document::new(&alice, "Watched");
        store.insert(doc.clone()).unwrap();

        let mut doc_events = store.watch_document(doc.id).unwrap();
        let mut owned = store.watch_query(&DocumentQuery::owned_by(&alice)).unwrap();

        // initial state arrives first
        assert_eq!(
            doc_events.recv().await,
            Some(DocumentEvent::Changed { document: doc.clone() })
        );
        assert_eq!(owned.recv().await.unwrap().len(), 1);

        store
            .modify(doc.id, &mut |d| {
                d.apply(&DocumentPatch::title("Renamed"));
                Ok(())
            })
            .unwrap();
        match doc_events.recv().await {
            Some(DocumentEvent::Changed { document }) => assert_eq!(document.title, "Renamed"),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(owned.recv().await.unwrap()[0].title, "Renamed");

        store.remove(doc.id).unwrap();
        assert_eq!(doc_events.recv().await, Some(DocumentEvent::Deleted));
        assert!(owned.recv().await.unwrap().is_empty());

        // unrelated documents do not wake the document watcher
        store.insert(Document::new(&alice, "Another")).unwrap();
        assert!(doc_events.try_recv().is_none());
    }

    pub async fn missing_document_watch(store: &dyn DocumentStore) {
        let mut events = store.watch_document(crate::DocumentId::new()).unwrap();
        assert_eq!(events.recv().await, Some(DocumentEvent::Deleted));
    }
}
