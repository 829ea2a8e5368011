/// Access-controlled document operations on top of a raw store
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{
    authorize, grant, permissions, Action, CollaborationError, Document, DocumentEvent,
    DocumentId, DocumentPatch, DocumentQuery, DocumentStore, Identity, Result, Role,
    Subscription,
};

/// Every operation is performed on behalf of an acting identity whose role
/// on the document is resolved from the document's permission map.
#[derive(Clone)]
pub struct DocumentService {
    store: Arc<dyn DocumentStore>,
}

impl DocumentService {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub fn create(&self, actor: &Identity, title: &str) -> Result<Document> {
        let doc = Document::new(actor, title);
        self.store.insert(doc.clone())?;
        info!("User {} created document {}", actor.email, doc.id);
        Ok(doc)
    }

    /// The document if it exists; fails when it exists but is unreadable
    pub fn get(&self, actor: &Identity, id: DocumentId) -> Result<Option<Document>> {
        match self.store.get(id)? {
            Some(doc) => {
                authorize(&doc, actor, Action::Read)?;
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    pub fn update(
        &self,
        actor: &Identity,
        id: DocumentId,
        patch: &DocumentPatch,
    ) -> Result<Document> {
        patch.validate()?;
        let doc = self.store.modify(id, &mut |doc| {
            authorize(doc, actor, Action::Write)?;
            doc.apply(patch);
            Ok(())
        })?;
        debug!("User {} updated document {}", actor.email, id);
        Ok(doc)
    }

    pub fn share(
        &self,
        actor: &Identity,
        id: DocumentId,
        email: &str,
        role: Role,
    ) -> Result<Document> {
        let mut granted = String::new();
        let doc = self.store.modify(id, &mut |doc| {
            authorize(doc, actor, Action::Share)?;
            granted = grant(doc, actor, email, role)?;
            Ok(())
        })?;
        info!("Document {} shared with {} as {}", id, granted, role);
        Ok(doc)
    }

    pub fn revoke(&self, actor: &Identity, id: DocumentId, email: &str) -> Result<Document> {
        let doc = self.store.modify(id, &mut |doc| {
            authorize(doc, actor, Action::Share)?;
            permissions::revoke(doc, email)?;
            Ok(())
        })?;
        info!("Revoked access of {} to document {}", email.trim(), id);
        Ok(doc)
    }

    pub fn delete(&self, actor: &Identity, id: DocumentId) -> Result<()> {
        let doc = self
            .store
            .get(id)?
            .ok_or_else(|| CollaborationError::DocumentNotFound(id.to_string()))?;
        authorize(&doc, actor, Action::Delete)?;
        self.store.remove(id)?;
        info!("User {} deleted document {}", actor.email, id);
        Ok(())
    }

    pub fn query(&self, actor: &Identity, query: &DocumentQuery) -> Result<Vec<Document>> {
        check_query(actor, query)?;
        self.store.query(query)
    }

    /// Live view of one document for `actor`
    ///
    /// Read access is re-checked on every change; when it disappears the
    /// watcher gets `AccessLost` and the stream ends.
    pub fn watch_document(
        &self,
        actor: &Identity,
        id: DocumentId,
    ) -> Result<Subscription<DocumentEvent>> {
        if let Some(doc) = self.store.get(id)? {
            authorize(&doc, actor, Action::Read)?;
        }
        let mut source = self.store.watch_document(id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = actor.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = source.recv() => event,
                    _ = tx.closed() => break,
                };
                let Some(event) = event else { break };

                let (event, last) = match event {
                    DocumentEvent::Changed { document } => {
                        if permissions::resolve_role(&document, &actor).is_some() {
                            (DocumentEvent::Changed { document }, false)
                        } else {
                            (DocumentEvent::AccessLost, true)
                        }
                    }
                    other => (other, false),
                };
                if tx.send(event).is_err() || last {
                    break;
                }
            }
            debug!("Stopped watching document {} for {}", id, actor.email);
        });

        Ok(Subscription::new(rx))
    }

    /// Live listing; only the actor's own owned/shared queries are allowed
    pub fn watch_query(
        &self,
        actor: &Identity,
        query: &DocumentQuery,
    ) -> Result<Subscription<Vec<Document>>> {
        check_query(actor, query)?;
        self.store.watch_query(query)
    }
}

fn check_query(actor: &Identity, query: &DocumentQuery) -> Result<()> {
    let allowed = match query {
        DocumentQuery::OwnedBy { owner_id } => *owner_id == actor.uid,
        DocumentQuery::SharedWith { email } => *email == actor.email,
    };
    if allowed {
        Ok(())
    } else {
        Err(CollaborationError::PermissionDenied(
            "documents of other users cannot be listed".to_string(),
        ))
    }
}
