/// Storage failure with a retry classification.
///
/// Retryable errors (busy store, lost connection) are retried by the
/// dispatchers after abandoning the locked work. Permanent errors (missing
/// execution, duplicate creation, unknown lock token) are surfaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Operation that failed, e.g. `create_execution`.
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Convert for persistence in history.
    pub fn to_infrastructure_error(&self) -> crate::ErrorDetails {
        crate::ErrorDetails::Infrastructure {
            operation: self.operation.clone(),
            message: self.message.clone(),
            retryable: self.retryable,
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_and_display() {
        let busy = ProviderError::retryable("append", "store busy");
        assert!(busy.is_retryable());
        let dup = ProviderError::permanent("create_execution", "execution already exists");
        assert!(!dup.is_retryable());
        assert_eq!(dup.to_string(), "create_execution: execution already exists");
        assert_ne!(busy, ProviderError::permanent("append", "store busy"));
    }

    #[test]
    fn converts_to_infrastructure_details() {
        match ProviderError::permanent("read", "corrupt").to_infrastructure_error() {
            crate::ErrorDetails::Infrastructure {
                operation,
                message,
                retryable,
            } => {
                assert_eq!(operation, "read");
                assert_eq!(message, "corrupt");
                assert!(!retryable);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
