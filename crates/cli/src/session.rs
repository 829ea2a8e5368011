use anyhow::{Context, Result};
use collaboration::{AuthToken, SignedIn};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Sign-in remembered between invocations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedSession {
    pub server_url: String,
    pub email: String,
    pub token: AuthToken,
}

impl SavedSession {
    pub fn new(server_url: &str, signed_in: &SignedIn) -> Self {
        Self {
            server_url: server_url.to_string(),
            email: signed_in.identity.email.clone(),
            token: signed_in.token.clone(),
        }
    }

    /// The saved session, if one exists
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let session = serde_json::from_str(&text)
            .with_context(|| format!("corrupt session file {}", path.display()))?;
        Ok(Some(session))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn clear(path: &Path) -> Result<()> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collaboration::{Identity, UserId};

    #[test]
    fn test_save_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.json");
        assert_eq!(SavedSession::load(&path).unwrap(), None);

        let signed_in = SignedIn {
            identity: Identity::new(UserId::new(), "Alice@Example.com"),
            token: AuthToken("abc123".to_string()),
        };
        let session = SavedSession::new("ws://127.0.0.1:9001", &signed_in);
        session.save(&path).unwrap();

        let loaded = SavedSession::load(&path).unwrap().unwrap();
        assert_eq!(loaded, session);
        assert_eq!(loaded.email, "alice@example.com");

        SavedSession::clear(&path).unwrap();
        assert!(!path.exists());
        SavedSession::clear(&path).unwrap();
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(SavedSession::load(&path).is_err());
    }
}
