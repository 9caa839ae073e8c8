use std::fmt;
use std::path::PathBuf;

/// Errors that can occur in the user store.
#[derive(Debug)]
pub enum StoreError {
    /// Failed to read or write the backing file.
    Io { path: PathBuf, source: std::io::Error },
    /// The backing file exists but is not valid JSON.
    Corrupt { path: PathBuf, source: serde_json::Error },
    /// Failed to serialize store contents.
    Serialize(serde_json::Error),
    /// No record exists for the given id.
    NotFound(i64),
    /// The acting user lacks the role required for the operation.
    PermissionDenied,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "storage error on '{}': {}", path.display(), source)
            }
            Self::Corrupt { path, source } => {
                write!(f, "corrupt store file '{}': {}", path.display(), source)
            }
            Self::Serialize(source) => write!(f, "failed to serialize store: {}", source),
            Self::NotFound(id) => write!(f, "no record for user {}", id),
            Self::PermissionDenied => write!(f, "permission denied"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Corrupt { source, .. } => Some(source),
            Self::Serialize(source) => Some(source),
            Self::NotFound(_) | Self::PermissionDenied => None,
        }
    }
}
