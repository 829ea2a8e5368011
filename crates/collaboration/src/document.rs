/// Shared text documents and the patches applied to them
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{now_millis, CollaborationError, DocumentId, Identity, Result, Role, UserId};

/// Title shown and stored when none is given
pub const UNTITLED: &str = "Untitled";

/// Preview shown for a document without content
pub const NO_CONTENT: &str = "No content yet";

/// A collaborative text document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub title: String,
    pub content: String,
    pub owner_id: UserId,

    /// Collaborator roles keyed by normalized email
    pub collaborators: BTreeMap<String, Role>,

    pub created_at: chrono::DateTime<chrono::Utc>,

    /// Milliseconds since the Unix epoch of the last write
    pub updated_at: i64,
}

impl Document {
    /// Build a fresh document owned by `owner`
    pub fn new(owner: &Identity, title: &str) -> Self {
        let trimmed = title.trim();
        Self {
            id: DocumentId::new(),
            title: if trimmed.is_empty() {
                UNTITLED.to_string()
            } else {
                trimmed.to_string()
            },
            content: String::new(),
            owner_id: owner.uid,
            collaborators: BTreeMap::new(),
            created_at: chrono::Utc::now(),
            updated_at: now_millis(),
        }
    }

    /// Title to display, falling back when blank
    pub fn display_title(&self) -> &str {
        if self.title.trim().is_empty() {
            UNTITLED
        } else {
            &self.title
        }
    }

    /// Short content preview for listings
    pub fn preview(&self, max_chars: usize) -> String {
        if self.content.is_empty() {
            return NO_CONTENT.to_string();
        }
        let head: String = self.content.chars().take(max_chars).collect();
        format!("{head}...")
    }

    /// Apply a patch and bump `updated_at`
    pub fn apply(&mut self, patch: &DocumentPatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(content) = &patch.content {
            self.content = content.clone();
        }
        self.touch();
    }

    /// Bump `updated_at` strictly past its previous value
    ///
    /// Two writes to one document inside the same millisecond still order.
    pub fn touch(&mut self) {
        self.updated_at = now_millis().max(self.updated_at + 1);
    }
}

/// Partial update of a document's editable fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl DocumentPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            content: None,
        }
    }

    pub fn content(content: impl Into<String>) -> Self {
        Self {
            title: None,
            content: Some(content.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.content.is_none()
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(CollaborationError::InvalidInput(
                "patch changes nothing".to_string(),
            ));
        }
        Ok(())
    }
}

/// Change notification for a watched document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DocumentEvent {
    #[serde(rename = "changed")]
    Changed { document: Document },

    #[serde(rename = "deleted")]
    Deleted,

    /// The watcher can no longer read the document
    #[serde(rename = "access_lost")]
    AccessLost,
}

/// Live listing queries against the document collection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DocumentQuery {
    #[serde(rename = "owned_by")]
    OwnedBy { owner_id: UserId },

    #[serde(rename = "shared_with")]
    SharedWith { email: String },
}

impl DocumentQuery {
    pub fn owned_by(identity: &Identity) -> Self {
        Self::OwnedBy {
            owner_id: identity.uid,
        }
    }

    pub fn shared_with(identity: &Identity) -> Self {
        Self::SharedWith {
            email: identity.email.clone(),
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Self::OwnedBy { owner_id } => doc.owner_id == *owner_id,
            Self::SharedWith { email } => doc.collaborators.contains_key(email),
        }
    }
}

/// Order documents most recently updated first
pub fn sort_by_recency(docs: &mut [Document]) {
    docs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Identity {
        Identity::new(UserId::new(), "alice@example.com")
    }

    #[test]
    fn test_new_document_defaults() {
        let doc = Document::new(&alice(), "   ");
        assert_eq!(doc.title, UNTITLED);
        assert!(doc.content.is_empty());
        assert!(doc.collaborators.is_empty());

        let doc = Document::new(&alice(), "  Notes ");
        assert_eq!(doc.title, "Notes");
    }

    #[test]
    fn test_preview() {
        let mut doc = Document::new(&alice(), "Notes");
        assert_eq!(doc.preview(60), NO_CONTENT);

        doc.content = "é".repeat(80);
        let preview = doc.preview(60);
        assert_eq!(preview.chars().count(), 63);
        assert!(preview.ends_with("..."));

        doc.content = "short".to_string();
        assert_eq!(doc.preview(60), "short...");
    }

    #[test]
    fn test_apply_patch_bumps_updated_at() {
        let mut doc = Document::new(&alice(), "Notes");
        doc.updated_at = 0;
        doc.apply(&DocumentPatch::content("hello"));
        assert_eq!(doc.content, "hello");
        assert_eq!(doc.title, "Notes");
        assert!(doc.updated_at > 0);
    }

    #[test]
    fn test_back_to_back_writes_are_ordered() {
        let mut doc = Document::new(&alice(), "Notes");
        let mut last = doc.updated_at;
        for text in ["a", "b", "c"] {
            doc.apply(&DocumentPatch::content(text));
            assert!(doc.updated_at > last);
            last = doc.updated_at;
        }

        doc.updated_at = i64::MAX / 2;
        doc.touch();
        assert_eq!(doc.updated_at, i64::MAX / 2 + 1);
    }

    #[test]
    fn test_empty_patch_is_rejected() {
        assert!(DocumentPatch::default().validate().is_err());
        assert!(DocumentPatch::title("x").validate().is_ok());
    }

    #[test]
    fn test_sort_by_recency() {
        let owner = alice();
        let mut docs: Vec<Document> = (0..3)
            .map(|i| {
                let mut d = Document::new(&owner, &format!("doc {i}"));
                d.updated_at = i;
                d
            })
            .collect();
        sort_by_recency(&mut docs);
        let order: Vec<i64> = docs.iter().map(|d| d.updated_at).collect();
        assert_eq!(order, vec![2, 1, 0]);
    }
}
