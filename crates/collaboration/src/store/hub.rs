use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::Subscription;
use crate::{Document, DocumentEvent, DocumentId, DocumentQuery, Result};

type QueryWatcher = (DocumentQuery, mpsc::UnboundedSender<Vec<Document>>);
type DocumentWatchers = HashMap<DocumentId, Vec<mpsc::UnboundedSender<DocumentEvent>>>;

/// Fan-out of document changes to document and query watchers
///
/// Stores call into the hub while holding their own lock so a watcher can
/// never miss a change between reading the initial state and subscribing.
#[derive(Default)]
pub(crate) struct ChangeHub {
    documents: Arc<Mutex<DocumentWatchers>>,
    queries: Mutex<Vec<QueryWatcher>>,
}

impl ChangeHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_document(
        &self,
        id: DocumentId,
        current: Option<&Document>,
    ) -> Subscription<DocumentEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(event_for(current));
        self.documents.lock().entry(id).or_default().push(tx.clone());

        // Unsubscribe on drop; a document that never changes again would
        // otherwise keep the sender forever
        let documents = Arc::downgrade(&self.documents);
        Subscription::with_cancel(rx, move || {
            let Some(documents) = documents.upgrade() else {
                return;
            };
            let mut documents = documents.lock();
            if let Some(senders) = documents.get_mut(&id) {
                senders.retain(|other| !other.same_channel(&tx));
                if senders.is_empty() {
                    documents.remove(&id);
                }
            }
        })
    }

    pub fn subscribe_query(
        &self,
        query: &DocumentQuery,
        current: Vec<Document>,
    ) -> Subscription<Vec<Document>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(current);
        self.queries.lock().push((query.clone(), tx));
        Subscription::new(rx)
    }

    /// Notify watchers that `id` went from `before` to `after`
    ///
    /// `run_query` re-evaluates a query against the store's new state.
    pub fn publish<F>(
        &self,
        id: DocumentId,
        before: Option<&Document>,
        after: Option<&Document>,
        run_query: F,
    ) where
        F: Fn(&DocumentQuery) -> Result<Vec<Document>>,
    {
        {
            let mut documents = self.documents.lock();
            if let Some(senders) = documents.get_mut(&id) {
                let event = event_for(after);
                senders.retain(|tx| tx.send(event.clone()).is_ok());
                if senders.is_empty() || after.is_none() {
                    documents.remove(&id);
                }
            }
        }

        let mut queries = self.queries.lock();
        let mut results: HashMap<DocumentQuery, Vec<Document>> = HashMap::new();
        queries.retain(|(query, tx)| {
            if tx.is_closed() {
                return false;
            }
            let affected = before.map_or(false, |d| query.matches(d))
                || after.map_or(false, |d| query.matches(d));
            if !affected {
                return true;
            }

            let docs = match results.get(query) {
                Some(docs) => docs.clone(),
                None => match run_query(query) {
                    Ok(docs) => {
                        results.insert(query.clone(), docs.clone());
                        docs
                    }
                    Err(e) => {
                        warn!("Failed to re-run query {:?}: {}", query, e);
                        return true;
                    }
                },
            };
            tx.send(docs).is_ok()
        });
        debug!(
            "Published change of {} to {} query watchers",
            id,
            queries.len()
        );
    }
}

fn event_for(doc: Option<&Document>) -> DocumentEvent {
    match doc {
        Some(document) => DocumentEvent::Changed {
            document: document.clone(),
        },
        None => DocumentEvent::Deleted,
    }
}
