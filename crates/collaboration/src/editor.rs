/// Editing session for one open document
///
/// Keystrokes update the local view at once and reach the store through two
/// debounced writers, one per field. Incoming snapshots are reconciled with
/// last-writer-wins, except that a field with an unsaved local edit keeps its
/// local value until that edit is written. A snapshot held back that way is
/// re-applied afterwards if it is newer than the write.
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EditorConfig;
use crate::{
    normalize_email, resolve_role, CollaborationError, Debouncer, Document, DocumentClient,
    DocumentEvent, DocumentId, DocumentPatch, Identity, Result, Role, Subscription, UNTITLED,
};

/// Status line text shown when a content write fails
pub const SAVE_ERROR: &str = "Error saving";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveStatus {
    Idle,
    Saving,
    Saved,
    Error(String),
}

/// Whether the document is still available to this session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentPhase {
    Open,
    Deleted,
    AccessLost,
}

/// What the editor renders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditorView {
    pub document_id: DocumentId,
    pub title: String,
    pub content: String,
    pub role: Option<Role>,
    pub status: SaveStatus,
    pub phase: DocumentPhase,
    pub updated_at: i64,
}

impl EditorView {
    pub fn can_edit(&self) -> bool {
        self.phase == DocumentPhase::Open && self.role.is_some_and(Role::can_write)
    }

    pub fn can_share(&self) -> bool {
        self.phase == DocumentPhase::Open && self.role.is_some_and(Role::can_share)
    }

    pub fn display_title(&self) -> &str {
        if self.title.trim().is_empty() {
            UNTITLED
        } else {
            &self.title
        }
    }
}

/// Local edits of one field against the edits whose write has finished
#[derive(Default)]
struct FieldEdits {
    edited: AtomicU64,
    settled: AtomicU64,
}

impl FieldEdits {
    /// Record a keystroke; returns its generation
    fn edit(&self) -> u64 {
        self.edited.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn settle(&self, generation: u64) {
        self.settled.fetch_max(generation, Ordering::SeqCst);
    }

    /// Some local edit has not been written yet
    fn is_dirty(&self) -> bool {
        self.settled.load(Ordering::SeqCst) < self.edited.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Content,
}

struct Shared {
    client: Arc<dyn DocumentClient>,
    identity: Identity,
    id: DocumentId,
    view: watch::Sender<EditorView>,
    content_edits: FieldEdits,
    title_edits: FieldEdits,
    /// Latest remote snapshot that arrived while a field was dirty
    withheld: Mutex<Option<Document>>,
    /// Set before each write so the write's own snapshot is not re-applied
    skip_next_echo: AtomicBool,
    /// Bumped on every status change so a stale clear timer does nothing
    status_epoch: AtomicU64,
    status_clear: Duration,
}

impl Shared {
    fn set_status(&self, status: SaveStatus) -> u64 {
        let epoch = self.status_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.view.send_modify(|view| view.status = status);
        epoch
    }

    fn edits(&self, field: Field) -> &FieldEdits {
        match field {
            Field::Title => &self.title_edits,
            Field::Content => &self.content_edits,
        }
    }

    /// Copy the clean fields of `document` into the view
    fn apply_clean(&self, view: &mut EditorView, document: &Document) {
        if !self.content_edits.is_dirty() {
            view.content.clone_from(&document.content);
        }
        if !self.title_edits.is_dirty() {
            view.title.clone_from(&document.title);
        }
        view.updated_at = view.updated_at.max(document.updated_at);
    }

    /// Reconcile an incoming snapshot; dirty fields keep their local value
    /// and the snapshot is held back until their write finishes
    fn receive(&self, document: Document, role: Option<Role>) {
        let mut withheld = self.withheld.lock();
        self.view.send_modify(|view| {
            view.role = role;
            if role.is_none() {
                view.phase = DocumentPhase::AccessLost;
            }
            self.apply_clean(view, &document);
        });

        if self.content_edits.is_dirty() || self.title_edits.is_dirty() {
            let newer = withheld
                .as_ref()
                .map_or(true, |held| held.updated_at < document.updated_at);
            if newer {
                debug!("Holding back snapshot of {} behind a local edit", self.id);
                *withheld = Some(document);
            }
        } else {
            *withheld = None;
        }
    }

    /// Mark a write of `field` finished and re-apply a held-back snapshot
    /// that reflects the store afterwards
    ///
    /// `written_at` is the timestamp the write produced, or `None` when it
    /// failed and the store kept its previous state.
    fn settle(&self, field: Field, generation: u64, written_at: Option<i64>) {
        let mut withheld = self.withheld.lock();
        self.edits(field).settle(generation);

        let Some(document) = withheld.take() else {
            return;
        };
        if written_at.is_some_and(|at| document.updated_at <= at) {
            debug!("Dropping snapshot of {} older than own write", self.id);
            return;
        }
        self.view
            .send_modify(|view| self.apply_clean(view, &document));
        if self.content_edits.is_dirty() || self.title_edits.is_dirty() {
            *withheld = Some(document);
        }
    }
}

async fn save(shared: Arc<Shared>, field: Field, generation: u64, value: String) {
    let patch = match field {
        Field::Title => DocumentPatch::title(value),
        Field::Content => DocumentPatch::content(value),
    };
    let tracks_status = field == Field::Content;
    if tracks_status {
        shared.set_status(SaveStatus::Saving);
    }

    shared.skip_next_echo.store(true, Ordering::SeqCst);
    match shared.client.update_document(shared.id, patch).await {
        Ok(doc) => {
            shared
                .view
                .send_modify(|view| view.updated_at = view.updated_at.max(doc.updated_at));
            shared.settle(field, generation, Some(doc.updated_at));
            if tracks_status {
                let epoch = shared.set_status(SaveStatus::Saved);
                let clear = shared.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(clear.status_clear).await;
                    if clear.status_epoch.load(Ordering::SeqCst) == epoch {
                        clear.set_status(SaveStatus::Idle);
                    }
                });
            }
        }
        Err(e) => {
            shared.skip_next_echo.store(false, Ordering::SeqCst);
            shared.settle(field, generation, None);
            warn!("Failed to save document {}: {}", shared.id, e);
            if tracks_status {
                shared.set_status(SaveStatus::Error(SAVE_ERROR.to_string()));
            }
        }
    }
}

async fn listen(shared: Arc<Shared>, mut events: Subscription<DocumentEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            DocumentEvent::Changed { document } => {
                if shared.skip_next_echo.swap(false, Ordering::SeqCst) {
                    debug!("Skipping echo of own write to {}", document.id);
                    continue;
                }

                let role = resolve_role(&document, &shared.identity);
                shared.receive(document, role);
                if role.is_none() {
                    break;
                }
            }
            DocumentEvent::Deleted => {
                info!("Document {} was deleted", shared.id);
                shared
                    .view
                    .send_modify(|view| view.phase = DocumentPhase::Deleted);
                break;
            }
            DocumentEvent::AccessLost => {
                info!("Lost access to document {}", shared.id);
                shared.view.send_modify(|view| {
                    view.role = None;
                    view.phase = DocumentPhase::AccessLost;
                });
                break;
            }
        }
    }
}

pub struct EditorSession {
    shared: Arc<Shared>,
    content: Debouncer<(u64, String)>,
    title: Debouncer<(u64, String)>,
    listener: JoinHandle<()>,
}

impl EditorSession {
    /// Load `id` for the signed-in user and start following its snapshots
    pub async fn open(
        client: Arc<dyn DocumentClient>,
        id: DocumentId,
        config: &EditorConfig,
    ) -> Result<Self> {
        let identity = client.current_user()?;
        let document = client
            .get_document(id)
            .await?
            .ok_or_else(|| CollaborationError::DocumentNotFound(id.to_string()))?;
        let role = resolve_role(&document, &identity).ok_or_else(|| {
            CollaborationError::PermissionDenied(format!("no access to document {id}"))
        })?;
        let events = client.watch_document(id).await?;

        let (view, _) = watch::channel(EditorView {
            document_id: id,
            title: document.title.clone(),
            content: document.content.clone(),
            role: Some(role),
            status: SaveStatus::Idle,
            phase: DocumentPhase::Open,
            updated_at: document.updated_at,
        });
        let shared = Arc::new(Shared {
            client,
            identity,
            id,
            view,
            content_edits: FieldEdits::default(),
            title_edits: FieldEdits::default(),
            withheld: Mutex::new(None),
            skip_next_echo: AtomicBool::new(false),
            status_epoch: AtomicU64::new(0),
            status_clear: config.status_clear(),
        });

        let writer = shared.clone();
        let content = Debouncer::new(config.content_debounce(), move |(generation, content): (u64, String)| {
            save(writer.clone(), Field::Content, generation, content)
        });
        let writer = shared.clone();
        let title = Debouncer::new(config.title_debounce(), move |(generation, title): (u64, String)| {
            save(writer.clone(), Field::Title, generation, title)
        });

        let listener = tokio::spawn(listen(shared.clone(), events));

        info!("Opened document {} as {}", id, role);
        Ok(Self {
            shared,
            content,
            title,
            listener,
        })
    }

    pub fn id(&self) -> DocumentId {
        self.shared.id
    }

    pub fn view(&self) -> EditorView {
        self.shared.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<EditorView> {
        self.shared.view.subscribe()
    }

    pub fn edit_content(&self, content: impl Into<String>) -> Result<()> {
        self.ensure_editable()?;
        let content = content.into();
        let generation = self.shared.content_edits.edit();
        self.shared
            .view
            .send_modify(|view| view.content = content.clone());
        let _ = self.content.push((generation, content));
        Ok(())
    }

    pub fn edit_title(&self, title: impl Into<String>) -> Result<()> {
        self.ensure_editable()?;
        let title = title.into();
        let generation = self.shared.title_edits.edit();
        self.shared.view.send_modify(|view| view.title = title.clone());
        let _ = self.title.push((generation, title));
        Ok(())
    }

    /// Share with `email`; returns the confirmation message
    pub async fn share(&self, email: &str, role: Role) -> Result<String> {
        let email = self.share_target(email)?;
        self.shared
            .client
            .share_document(self.shared.id, &email, role)
            .await?;
        Ok(format!("Document shared with {email}"))
    }

    pub async fn revoke(&self, email: &str) -> Result<String> {
        let email = self.share_target(email)?;
        self.shared.client.revoke_access(self.shared.id, &email).await?;
        Ok(format!("Access removed for {email}"))
    }

    /// Write any pending edits now
    pub async fn flush(&self) {
        self.content.flush().await;
        self.title.flush().await;
    }

    /// Flush pending edits and stop following the document
    pub async fn close(self) {
        self.flush().await;
        debug!("Closed document {}", self.shared.id);
    }

    fn ensure_editable(&self) -> Result<()> {
        let view = self.shared.view.borrow();
        match view.phase {
            DocumentPhase::Deleted => Err(CollaborationError::DocumentNotFound(
                self.shared.id.to_string(),
            )),
            DocumentPhase::AccessLost => Err(CollaborationError::PermissionDenied(
                "access to this document was removed".to_string(),
            )),
            DocumentPhase::Open if view.can_edit() => Ok(()),
            DocumentPhase::Open => Err(CollaborationError::PermissionDenied(
                "viewers cannot edit".to_string(),
            )),
        }
    }

    fn share_target(&self, email: &str) -> Result<String> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(CollaborationError::InvalidInput(
                "Please enter an email".to_string(),
            ));
        }
        if !self.shared.view.borrow().can_share() {
            return Err(CollaborationError::PermissionDenied(
                "only the owner can manage access".to_string(),
            ));
        }
        Ok(email)
    }
}

impl Drop for EditorSession {
    fn drop(&mut self) {
        self.listener.abort();
    }
}
