/// Role resolution from the permissions map embedded in each document
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{normalize_email, CollaborationError, Document, Identity, Result};

/// Graduated access level on a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Editor,
    Owner,
}

impl Role {
    pub fn can_read(self) -> bool {
        true
    }

    pub fn can_write(self) -> bool {
        self >= Role::Editor
    }

    pub fn can_share(self) -> bool {
        self == Role::Owner
    }

    pub fn can_delete(self) -> bool {
        self == Role::Owner
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Editor => "editor",
            Role::Owner => "owner",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = CollaborationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "viewer" => Ok(Role::Viewer),
            "editor" => Ok(Role::Editor),
            "owner" => Ok(Role::Owner),
            other => Err(CollaborationError::InvalidInput(format!(
                "unknown role {other:?}"
            ))),
        }
    }
}

/// Something a user may try to do with a document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Write,
    Share,
    Delete,
}

impl Action {
    fn allowed(self, role: Role) -> bool {
        match self {
            Action::Read => role.can_read(),
            Action::Write => role.can_write(),
            Action::Share => role.can_share(),
            Action::Delete => role.can_delete(),
        }
    }

    fn verb(self) -> &'static str {
        match self {
            Action::Read => "read",
            Action::Write => "edit",
            Action::Share => "share",
            Action::Delete => "delete",
        }
    }
}

/// What the current user may do with a document
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub read: bool,
    pub write: bool,
    pub share: bool,
    pub delete: bool,
}

impl From<Option<Role>> for Capabilities {
    fn from(role: Option<Role>) -> Self {
        match role {
            Some(role) => Self {
                read: role.can_read(),
                write: role.can_write(),
                share: role.can_share(),
                delete: role.can_delete(),
            },
            None => Self::default(),
        }
    }
}

/// Effective role of `identity` on `doc`, if any
///
/// The owner is recognised by uid. Everyone else is looked up in the
/// collaborator map by normalized email; an owner entry in the map is ignored.
pub fn resolve_role(doc: &Document, identity: &Identity) -> Option<Role> {
    if doc.owner_id == identity.uid {
        return Some(Role::Owner);
    }

    doc.collaborators
        .get(&normalize_email(&identity.email))
        .copied()
        .filter(|role| *role != Role::Owner)
}

pub fn capabilities(doc: &Document, identity: &Identity) -> Capabilities {
    resolve_role(doc, identity).into()
}

/// Check that `identity` may perform `action`, returning its role
pub fn authorize(doc: &Document, identity: &Identity, action: Action) -> Result<Role> {
    match resolve_role(doc, identity) {
        Some(role) if action.allowed(role) => Ok(role),
        Some(role) => Err(CollaborationError::PermissionDenied(format!(
            "{role} cannot {} document {}",
            action.verb(),
            doc.id
        ))),
        None => Err(CollaborationError::PermissionDenied(format!(
            "no access to document {}",
            doc.id
        ))),
    }
}

/// Grant `role` to `email` in the document's permission map
pub fn grant(doc: &mut Document, owner: &Identity, email: &str, role: Role) -> Result<String> {
    let email = normalize_email(email);
    if email.is_empty() {
        return Err(CollaborationError::InvalidInput(
            "Please enter an email".to_string(),
        ));
    }
    if role == Role::Owner {
        return Err(CollaborationError::InvalidInput(
            "ownership cannot be shared".to_string(),
        ));
    }
    if doc.owner_id == owner.uid && normalize_email(&owner.email) == email {
        return Err(CollaborationError::InvalidInput(
            "the owner already has full access".to_string(),
        ));
    }

    doc.collaborators.insert(email.clone(), role);
    doc.touch();
    Ok(email)
}

/// Remove `email` from the permission map
pub fn revoke(doc: &mut Document, email: &str) -> Result<String> {
    let email = normalize_email(email);
    if doc.collaborators.remove(&email).is_none() {
        return Err(CollaborationError::InvalidInput(format!(
            "{email} is not a collaborator"
        )));
    }
    doc.touch();
    Ok(email)
}
