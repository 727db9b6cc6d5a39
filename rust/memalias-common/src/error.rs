use thiserror::Error;

#[derive(Debug, Error)]
#[error(transparent)]
pub struct Error(Box<ErrorKind>);

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        self.0.as_ref()
    }

    pub fn into_kind(self) -> ErrorKind {
        *self.0
    }

    pub fn invalid_arg(name: impl Into<String>, message: impl Into<String>) -> Error {
        Error(
            ErrorKind::InvalidArgument {
                name: name.into(),
                message: message.into(),
            }
            .into(),
        )
    }

    pub fn invalid_operation(name: impl Into<String>) -> Error {
        Error(ErrorKind::InvalidOperation { name: name.into() }.into())
    }

    pub fn mapping(operation: impl Into<String>, source: std::io::Error) -> Error {
        Error(
            ErrorKind::PlatformMappingFailure {
                operation: operation.into(),
                source,
            }
            .into(),
        )
    }

    pub fn busy(live_views: usize) -> Error {
        Error(ErrorKind::ResourceBusy { live_views }.into())
    }

    pub fn placement_exhausted(attempts: usize, last_error: Option<Error>) -> Error {
        Error(
            ErrorKind::PlacementExhausted {
                attempts,
                last_error: last_error.map(Box::new),
            }
            .into(),
        )
    }

    pub fn protocol_mismatch(expected: u64, actual: u64) -> Error {
        Error(ErrorKind::ProtocolMismatch { expected, actual }.into())
    }

    /// The OS status code of a failed platform call, if this error carries one.
    pub fn os_code(&self) -> Option<i32> {
        match self.kind() {
            ErrorKind::PlatformMappingFailure { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self.kind(), ErrorKind::InvalidArgument { .. })
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.kind(), ErrorKind::ResourceBusy { .. })
    }

    pub fn is_placement_exhausted(&self) -> bool {
        matches!(self.kind(), ErrorKind::PlacementExhausted { .. })
    }

    pub fn is_protocol_mismatch(&self) -> bool {
        matches!(self.kind(), ErrorKind::ProtocolMismatch { .. })
    }
}

#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error("invalid argument {name}: {message}")]
    InvalidArgument { name: String, message: String },

    #[error("invalid operation {name}")]
    InvalidOperation { name: String },

    #[error("platform mapping call '{operation}' failed: {source}")]
    PlatformMappingFailure {
        operation: String,
        source: std::io::Error,
    },

    #[error("memory segment is still in use by {live_views} view(s)")]
    ResourceBusy { live_views: usize },

    #[error(
        "no free address range could be claimed after {attempts} attempt(s){}",
        last_error.as_ref().map(|e| format!(", last error: {e}")).unwrap_or_default())]
    PlacementExhausted {
        attempts: usize,
        last_error: Option<Box<Error>>,
    },

    #[error("guest acknowledged {actual} bytes, expected {expected}")]
    ProtocolMismatch { expected: u64, actual: u64 },
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error(kind.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_code_is_preserved() {
        let err = Error::mapping("mmap", std::io::Error::from_raw_os_error(12));
        assert_eq!(err.os_code(), Some(12));
        assert!(err.to_string().contains("mmap"));
        assert_eq!(Error::busy(1).os_code(), None);
    }

    #[test]
    fn test_placement_exhausted_message() {
        let err = Error::placement_exhausted(3, Some(Error::busy(2)));
        assert!(err.is_placement_exhausted());
        let message = err.to_string();
        assert!(message.contains("3 attempt"), "{message}");
        assert!(message.contains("2 view"), "{message}");

        let err = Error::placement_exhausted(1, None);
        assert!(!err.to_string().contains("last error"));
    }

    #[test]
    fn test_kind_predicates() {
        assert!(Error::invalid_arg("capacity", "too small").is_invalid_argument());
        assert!(Error::busy(1).is_busy());
        assert!(Error::protocol_mismatch(4096, 0).is_protocol_mismatch());
        assert!(matches!(
            Error::invalid_operation("close").into_kind(),
            ErrorKind::InvalidOperation { .. }
        ));
    }
}
