//! Handshake authenticators.

use std::path::Path;

use dot_proto::AuthMethod;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::ServerError;

/// Checks the credential a client presents during the handshake.
pub trait Authenticator: Send + Sync + 'static {
    /// Methods offered to the client, in order of preference.
    fn methods(&self) -> Vec<AuthMethod>;

    fn authenticate(&self, method: AuthMethod, credential: &[u8]) -> bool;
}

/// Accepts everyone.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuth;

impl Authenticator for NoAuth {
    fn methods(&self) -> Vec<AuthMethod> {
        vec![AuthMethod::None]
    }

    fn authenticate(&self, method: AuthMethod, _credential: &[u8]) -> bool {
        method == AuthMethod::None
    }
}

/// Shared secret read from a key file.
///
/// Only the digest is kept; credentials are compared by digest.
pub struct KeyAuth {
    digest: [u8; 32],
}

impl std::fmt::Debug for KeyAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyAuth").finish_non_exhaustive()
    }
}

impl KeyAuth {
    pub fn new(key: &[u8]) -> Self {
        Self {
            digest: Sha256::digest(key).into(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ServerError> {
        let key = std::fs::read(path).map_err(|source| ServerError::KeyFile {
            path: path.to_path_buf(),
            source,
        })?;
        if key.is_empty() {
            return Err(ServerError::EmptyKey(path.to_path_buf()));
        }
        debug!(path = %path.display(), "Loaded key file");
        Ok(Self::new(&key))
    }
}

impl Authenticator for KeyAuth {
    fn methods(&self) -> Vec<AuthMethod> {
        vec![AuthMethod::Key]
    }

    fn authenticate(&self, method: AuthMethod, credential: &[u8]) -> bool {
        if method != AuthMethod::Key {
            return false;
        }
        let presented: [u8; 32] = Sha256::digest(credential).into();
        presented
            .iter()
            .zip(&self.digest)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_auth_only_takes_none() {
        assert!(NoAuth.authenticate(AuthMethod::None, b""));
        assert!(!NoAuth.authenticate(AuthMethod::Key, b"x"));
    }

    #[test]
    fn key_auth_compares_key() {
        let auth = KeyAuth::new(b"sekrit");
        assert_eq!(auth.methods(), vec![AuthMethod::Key]);
        assert!(auth.authenticate(AuthMethod::Key, b"sekrit"));
        assert!(!auth.authenticate(AuthMethod::Key, b"sekrit2"));
        assert!(!auth.authenticate(AuthMethod::None, b"sekrit"));
    }

    #[test]
    fn key_file_loading() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"from-file").unwrap();
        let auth = KeyAuth::from_file(file.path()).unwrap();
        assert!(auth.authenticate(AuthMethod::Key, b"from-file"));

        let empty = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            KeyAuth::from_file(empty.path()),
            Err(ServerError::EmptyKey(_))
        ));
        assert!(KeyAuth::from_file(Path::new("/nonexistent/dotshare.key")).is_err());
    }
}
