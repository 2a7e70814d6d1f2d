use thiserror::Error;

/// Errors surfaced by the object-store layer.
///
/// Gateway timeouts and client-side deadlines are folded into a single
/// `Timeout` variant here; callers never have to distinguish them. A missing
/// object is usually reported as `Ok(None)` by read operations, `NotFound`
/// only shows up where an operation on a specific key failed (for example in
/// the bulk-delete error callback).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found")]
    NotFound,

    #[error("object store request timed out")]
    Timeout,

    #[error("object store error: {0}")]
    Transport(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::StoreError;

    #[test]
    fn test_display() {
        assert_eq!(
            StoreError::Timeout.to_string(),
            "object store request timed out",
        );
        assert_eq!(
            StoreError::Transport("read returned 500 Internal Server Error".to_owned()).to_string(),
            "object store error: read returned 500 Internal Server Error",
        );
    }
}
