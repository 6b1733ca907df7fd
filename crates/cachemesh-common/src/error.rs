//! Error types for cachemesh
//!
//! Configuration and discovery-start errors are fatal for the caller.
//! Remote communication errors are expected at runtime and are handled
//! by the replication layer as "peer unreachable", never propagated to
//! the code that mutated the local cache.

/// Application-specific error types
#[derive(thiserror::Error, Debug)]
pub enum CacheMeshError {
    #[error("cannot encode '{0}': peer urls must not contain the '|' delimiter")]
    Encoding(String),

    #[error("corrupt payload: {0}")]
    CorruptPayload(String),

    #[error("could not start peer discovery: {0}")]
    DiscoveryStart(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("remote communication error: {0}")]
    RemoteCommunication(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CacheMeshError {
    /// Whether the error means the remote side could not be reached or answered badly.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            CacheMeshError::RemoteCommunication(_) | CacheMeshError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CacheMeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CacheMeshError::Encoding("tcp://a|b:1/c".to_string());
        assert_eq!(
            err.to_string(),
            "cannot encode 'tcp://a|b:1/c': peer urls must not contain the '|' delimiter"
        );

        let err = CacheMeshError::Config("bad ttl".to_string());
        assert_eq!(err.to_string(), "configuration error: bad ttl");
    }

    #[test]
    fn test_is_remote() {
        assert!(CacheMeshError::RemoteCommunication("timeout".to_string()).is_remote());
        assert!(
            CacheMeshError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused"
            ))
            .is_remote()
        );
        assert!(!CacheMeshError::Config("x".to_string()).is_remote());
    }
}
