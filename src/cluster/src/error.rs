/// Error type for peer protocol exchanges
#[derive(Debug)]
pub enum ClusterError {
    IoError(std::io::Error),
    /// The peer answered with an opcode the exchange did not expect
    UnexpectedOpcode(u8),
    /// A replication ack named a different sequence than the entry in
    /// flight; the link is desynchronized and must reconnect
    AckMismatch { expected: u64, got: u64 },
    MalformedSnapshot(serde_json::Error),
}

impl std::fmt::Display for ClusterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterError::IoError(e) => write!(f, "IO error: {}", e),
            ClusterError::UnexpectedOpcode(op) => write!(f, "Unexpected opcode: {}", op),
            ClusterError::AckMismatch { expected, got } => {
                write!(f, "Ack for seq {} while awaiting {}", got, expected)
            }
            ClusterError::MalformedSnapshot(e) => write!(f, "Malformed snapshot: {}", e),
        }
    }
}

impl std::error::Error for ClusterError {}

impl From<std::io::Error> for ClusterError {
    fn from(err: std::io::Error) -> Self {
        ClusterError::IoError(err)
    }
}

impl From<tokio::time::error::Elapsed> for ClusterError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        ClusterError::IoError(err.into())
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::MalformedSnapshot(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            ClusterError::UnexpectedOpcode(99).to_string(),
            "Unexpected opcode: 99"
        );
        assert_eq!(
            ClusterError::AckMismatch {
                expected: 5,
                got: 3
            }
            .to_string(),
            "Ack for seq 3 while awaiting 5"
        );
    }

    #[test]
    fn test_from_io_error() {
        let err: ClusterError =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into();
        assert!(matches!(err, ClusterError::IoError(_)));
    }
}
