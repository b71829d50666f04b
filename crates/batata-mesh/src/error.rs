//! Error types for the mesh crate

/// Error type for push bridge operations
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("push bridge already started")]
    AlreadyStarted,

    #[error("push channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            MeshError::AlreadyStarted.to_string(),
            "push bridge already started"
        );
        assert_eq!(MeshError::ChannelClosed.to_string(), "push channel closed");
    }
}
