use parking_lot::Mutex;
use std::collections::HashMap;

use super::{ChangeHub, DocumentStore, Subscription};
use crate::{
    sort_by_recency, Account, AccountStore, CollaborationError, Document, DocumentEvent,
    DocumentId, DocumentQuery, Result,
};

#[derive(Default)]
struct MemoryState {
    documents: HashMap<DocumentId, Document>,
    accounts: HashMap<String, Account>,
}

impl MemoryState {
    fn query(&self, query: &DocumentQuery) -> Vec<Document> {
        let mut docs: Vec<Document> = self
            .documents
            .values()
            .filter(|d| query.matches(d))
            .cloned()
            .collect();
        sort_by_recency(&mut docs);
        docs
    }
}

/// In-process store, used for tests and ephemeral servers
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    hub: ChangeHub,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            hub: ChangeHub::new(),
        }
    }
}

impl DocumentStore for MemoryStore {
    fn insert(&self, doc: Document) -> Result<()> {
        let mut state = self.state.lock();
        if state.documents.contains_key(&doc.id) {
            return Err(CollaborationError::InvalidInput(format!(
                "document {} already exists",
                doc.id
            )));
        }
        let id = doc.id;
        state.documents.insert(id, doc);

        let state = &*state;
        self.hub
            .publish(id, None, state.documents.get(&id), |q| Ok(state.query(q)));
        Ok(())
    }

    fn get(&self, id: DocumentId) -> Result<Option<Document>> {
        Ok(self.state.lock().documents.get(&id).cloned())
    }

    fn modify(
        &self,
        id: DocumentId,
        f: &mut dyn FnMut(&mut Document) -> Result<()>,
    ) -> Result<Document> {
        let mut state = self.state.lock();
        let before = state
            .documents
            .get(&id)
            .cloned()
            .ok_or_else(|| CollaborationError::DocumentNotFound(id.to_string()))?;

        let mut after = before.clone();
        f(&mut after)?;
        state.documents.insert(id, after.clone());

        let state = &*state;
        self.hub
            .publish(id, Some(&before), Some(&after), |q| Ok(state.query(q)));
        Ok(after)
    }

    fn remove(&self, id: DocumentId) -> Result<bool> {
        let mut state = self.state.lock();
        let Some(before) = state.documents.remove(&id) else {
            return Ok(false);
        };

        let state = &*state;
        self.hub
            .publish(id, Some(&before), None, |q| Ok(state.query(q)));
        Ok(true)
    }

    fn query(&self, query: &DocumentQuery) -> Result<Vec<Document>> {
        Ok(self.state.lock().query(query))
    }

    fn watch_document(&self, id: DocumentId) -> Result<Subscription<DocumentEvent>> {
        let state = self.state.lock();
        Ok(self.hub.subscribe_document(id, state.documents.get(&id)))
    }

    fn watch_query(&self, query: &DocumentQuery) -> Result<Subscription<Vec<Document>>> {
        let state = self.state.lock();
        Ok(self.hub.subscribe_query(query, state.query(query)))
    }
}

impl AccountStore for MemoryStore {
    fn insert_account(&self, account: Account) -> Result<()> {
        let mut state = self.state.lock();
        if state.accounts.contains_key(&account.email) {
            return Err(CollaborationError::AuthFailed(format!(
                "an account already exists for {}",
                account.email
            )));
        }
        state.accounts.insert(account.email.clone(), account);
        Ok(())
    }

    fn find_account(&self, email: &str) -> Result<Option<Account>> {
        Ok(self.state.lock().accounts.get(email).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;

    #[test]
    fn test_crud() {
        conformance::crud(&MemoryStore::new());
    }

    #[test]
    fn test_collaborators_roundtrip() {
        conformance::collaborators_roundtrip(&MemoryStore::new());
    }

    #[test]
    fn test_queries() {
        conformance::queries(&MemoryStore::new());
    }

    #[tokio::test]
    async fn test_watches() {
        conformance::watches(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_missing_document_watch() {
        conformance::missing_document_watch(&MemoryStore::new()).await;
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let store = MemoryStore::new();
        let doc = Document::new(
            &crate::Identity::new(crate::UserId::new(), "a@example.com"),
            "x",
        );
        store.insert(doc.clone()).unwrap();
        assert!(store.insert(doc).is_err());
    }
}
