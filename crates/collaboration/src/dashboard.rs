/// Live listing of the documents a user owns or has been given access to
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::DashboardConfig;
use crate::{
    resolve_role, Document, DocumentClient, DocumentId, DocumentQuery, Identity, Result, Role,
    Subscription,
};

/// One row of the listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSummary {
    pub id: DocumentId,
    pub title: String,
    pub preview: String,
    pub updated_at: i64,
    pub role: Role,
}

impl DocumentSummary {
    /// Summary of `doc` as seen by `identity`, if they can see it at all
    pub fn from_document(doc: &Document, identity: &Identity, preview_chars: usize) -> Option<Self> {
        Some(Self {
            id: doc.id,
            title: doc.display_title().to_string(),
            preview: doc.preview(preview_chars),
            updated_at: doc.updated_at,
            role: resolve_role(doc, identity)?,
        })
    }
}

fn by_recency(a: &DocumentSummary, b: &DocumentSummary) -> std::cmp::Ordering {
    b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id))
}

/// Owned and shared listings combined, newest first
///
/// A document present in both lists appears once, with its owned entry.
pub fn merge_recent(owned: &[DocumentSummary], shared: &[DocumentSummary]) -> Vec<DocumentSummary> {
    let mut seen = HashSet::new();
    let mut merged: Vec<DocumentSummary> = owned
        .iter()
        .chain(shared)
        .filter(|summary| seen.insert(summary.id))
        .cloned()
        .collect();
    merged.sort_by(by_recency);
    merged
}

fn summarize(docs: &[Document], identity: &Identity, preview_chars: usize) -> Vec<DocumentSummary> {
    let mut summaries: Vec<_> = docs
        .iter()
        .filter_map(|doc| DocumentSummary::from_document(doc, identity, preview_chars))
        .collect();
    summaries.sort_by(by_recency);
    summaries
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DashboardView {
    pub owned: Vec<DocumentSummary>,
    pub shared: Vec<DocumentSummary>,
    /// True until either listing has reported once
    pub loading: bool,
}

impl Default for DashboardView {
    fn default() -> Self {
        Self {
            owned: Vec::new(),
            shared: Vec::new(),
            loading: true,
        }
    }
}

impl DashboardView {
    pub fn recent(&self) -> Vec<DocumentSummary> {
        merge_recent(&self.owned, &self.shared)
    }

    pub fn is_empty(&self) -> bool {
        self.owned.is_empty() && self.shared.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
enum Listing {
    Owned,
    Shared,
}

async fn follow(
    view: Arc<watch::Sender<DashboardView>>,
    mut source: Subscription<Vec<Document>>,
    listing: Listing,
    identity: Identity,
    preview_chars: usize,
) {
    while let Some(docs) = source.recv().await {
        let summaries = summarize(&docs, &identity, preview_chars);
        debug!("{:?} listing now has {} documents", listing, summaries.len());
        view.send_modify(|view| {
            match listing {
                Listing::Owned => view.owned = summaries,
                Listing::Shared => view.shared = summaries,
            }
            view.loading = false;
        });
    }
}

pub struct Dashboard {
    client: Arc<dyn DocumentClient>,
    view: Arc<watch::Sender<DashboardView>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Dashboard {
    /// Start following the signed-in user's owned and shared documents
    pub async fn open(client: Arc<dyn DocumentClient>, config: &DashboardConfig) -> Result<Self> {
        let identity = client.current_user()?;
        let owned = client
            .watch_query(DocumentQuery::owned_by(&identity))
            .await?;
        let shared = client
            .watch_query(DocumentQuery::shared_with(&identity))
            .await?;

        let view = Arc::new(watch::Sender::new(DashboardView::default()));
        let tasks = vec![
            tokio::spawn(follow(
                view.clone(),
                owned,
                Listing::Owned,
                identity.clone(),
                config.preview_chars,
            )),
            tokio::spawn(follow(
                view.clone(),
                shared,
                Listing::Shared,
                identity,
                config.preview_chars,
            )),
        ];

        Ok(Self {
            client,
            view,
            tasks,
        })
    }

    /// One-shot listing without live updates
    pub async fn list(
        client: &dyn DocumentClient,
        config: &DashboardConfig,
    ) -> Result<Vec<DocumentSummary>> {
        let identity = client.current_user()?;
        let owned = client
            .query_documents(DocumentQuery::owned_by(&identity))
            .await?;
        let shared = client
            .query_documents(DocumentQuery::shared_with(&identity))
            .await?;
        Ok(merge_recent(
            &summarize(&owned, &identity, config.preview_chars),
            &summarize(&shared, &identity, config.preview_chars),
        ))
    }

    pub fn view(&self) -> DashboardView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DashboardView> {
        self.view.subscribe()
    }

    /// Create a document owned by the signed-in user
    pub async fn create(&self, title: &str) -> Result<Document> {
        self.client.create_document(title).await
    }
}

impl Drop for Dashboard {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        AuthBackend, Authenticator, Credentials, DocumentPatch, DocumentService, LocalClient,
        MemoryStore, NO_CONTENT, UNTITLED,
    };

    fn summary(updated_at: i64, role: Role) -> DocumentSummary {
        DocumentSummary {
            id: DocumentId::new(),
            title: "t".to_string(),
            preview: NO_CONTENT.to_string(),
            updated_at,
            role,
        }
    }

    #[test]
    fn test_merge_recent_orders_and_dedupes() {
        let a = summary(10, Role::Owner);
        let b = summary(30, Role::Owner);
        let c = summary(20, Role::Editor);
        let mut dup = b.clone();
        dup.role = Role::Viewer;

        let merged = merge_recent(&[a.clone(), b.clone()], &[c.clone(), dup]);
        let ids: Vec<_> = merged.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![b.id, c.id, a.id]);
        assert_eq!(merged[0].role, Role::Owner);
    }

    #[test]
    fn test_merge_recent_ties_are_deterministic() {
        let a = summary(5, Role::Owner);
        let b = summary(5, Role::Viewer);
        let first = merge_recent(&[a.clone()], &[b.clone()]);
        let second = merge_recent(&[], &[b, a]);
        assert_eq!(first, second);
    }

    async fn signed_in_pair() -> (Arc<LocalClient>, Arc<LocalClient>) {
        let store = Arc::new(MemoryStore::new());
        let service = DocumentService::new(store.clone());
        let authenticator = Arc::new(Authenticator::new(store, 6));
        let alice = Arc::new(LocalClient::new(service.clone(), authenticator.clone()));
        let bob = Arc::new(LocalClient::new(service, authenticator));
        alice
            .sign_up(Credentials::new("alice@example.com", "hunter22"))
            .await
            .unwrap();
        bob.sign_up(Credentials::new("bob@example.com", "hunter22"))
            .await
            .unwrap();
        (alice, bob)
    }

    #[tokio::test]
    async fn test_dashboard_follows_owned_and_shared() {
        let (alice, bob) = signed_in_pair().await;
        let dashboard = Dashboard::open(bob.clone(), &DashboardConfig::default())
            .await
            .unwrap();
        let mut rx = dashboard.subscribe();
        rx.wait_for(|view| !view.loading).await.unwrap();
        assert!(dashboard.view().is_empty());

        let mine = dashboard.create("  ").await.unwrap();
        let theirs = alice.create_document("Alice's plan").await.unwrap();
        alice
            .update_document(theirs.id, DocumentPatch::content("x".repeat(100)))
            .await
            .unwrap();
        alice
            .share_document(theirs.id, "bob@example.com", Role::Viewer)
            .await
            .unwrap();

        let view = rx
            .wait_for(|view| view.owned.len() == 1 && view.shared.len() == 1)
            .await
            .unwrap()
            .clone();

        assert_eq!(view.owned[0].id, mine.id);
        assert_eq!(view.owned[0].title, UNTITLED);
        assert_eq!(view.owned[0].preview, NO_CONTENT);
        assert_eq!(view.owned[0].role, Role::Owner);

        assert_eq!(view.shared[0].role, Role::Viewer);
        assert_eq!(view.shared[0].preview, format!("{}...", "x".repeat(60)));

        let recent = view.recent();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].updated_at >= recent[1].updated_at);
    }

    #[tokio::test]
    async fn test_revoked_document_leaves_shared_listing() {
        let (alice, bob) = signed_in_pair().await;
        let doc = alice.create_document("Temp").await.unwrap();
        alice
            .share_document(doc.id, "bob@example.com", Role::Editor)
            .await
            .unwrap();

        let dashboard = Dashboard::open(bob.clone(), &DashboardConfig::default())
            .await
            .unwrap();
        let mut rx = dashboard.subscribe();
        rx.wait_for(|view| view.shared.len() == 1).await.unwrap();

        alice.revoke_access(doc.id, "bob@example.com").await.unwrap();
        rx.wait_for(|view| view.shared.is_empty()).await.unwrap();
    }

    #[tokio::test]
    async fn test_one_shot_list() {
        let (alice, bob) = signed_in_pair().await;
        let doc = alice.create_document("Shared").await.unwrap();
        alice
            .share_document(doc.id, "bob@example.com", Role::Editor)
            .await
            .unwrap();
        bob.create_document("Own").await.unwrap();

        let listing = Dashboard::list(bob.as_ref(), &DashboardConfig::default())
            .await
            .unwrap();
        assert_eq!(listing.len(), 2);
        assert!(listing
            .iter()
            .any(|s| s.id == doc.id && s.role == Role::Editor));
    }

    #[tokio::test]
    async fn test_open_requires_sign_in() {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(LocalClient::new(
            DocumentService::new(store.clone()),
            Arc::new(Authenticator::new(store, 6)),
        ));
        assert!(Dashboard::open(client, &DashboardConfig::default())
            .await
            .is_err());
    }
}
