use std::fmt;

use fsk_authority::AuthorityError;

/// Every failure a caller of [`crate::ComplianceService`] can see.
///
/// Each variant leaves the service in a well-defined, retryable state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComplianceError {
    /// Required settings are missing. Never retried automatically.
    Configuration(String),
    /// Authority unreachable. Retried on the next drain or tick.
    Link(String),
    /// Certificate upload with an unsupported container.
    UnsupportedFormat(String),
    /// Export requested while export is disabled or has no target.
    NotReady(String),
    /// Another operation is in flight. Not a failure of the operation itself.
    Busy(&'static str),
    /// Durable store or audit log failure. Queue mutation stops until storage
    /// is restored.
    Storage(String),
}

impl ComplianceError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            ComplianceError::Configuration(_) => "CONFIGURATION",
            ComplianceError::Link(_) => "LINK",
            ComplianceError::UnsupportedFormat(_) => "UNSUPPORTED_FORMAT",
            ComplianceError::NotReady(_) => "NOT_READY",
            ComplianceError::Busy(_) => "BUSY",
            ComplianceError::Storage(_) => "STORAGE",
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, ComplianceError::Busy(_))
    }
}

impl fmt::Display for ComplianceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComplianceError::Configuration(m) => write!(f, "configuration error: {m}"),
            ComplianceError::Link(m) => write!(f, "link error: {m}"),
            ComplianceError::UnsupportedFormat(m) => write!(f, "unsupported format: {m}"),
            ComplianceError::NotReady(m) => write!(f, "not ready: {m}"),
            ComplianceError::Busy(what) => write!(f, "busy: {what}"),
            ComplianceError::Storage(m) => write!(f, "storage error: {m}"),
        }
    }
}

impl std::error::Error for ComplianceError {}

impl From<anyhow::Error> for ComplianceError {
    fn from(e: anyhow::Error) -> Self {
        ComplianceError::Storage(format!("{e:#}"))
    }
}

impl From<AuthorityError> for ComplianceError {
    fn from(e: AuthorityError) -> Self {
        match e {
            AuthorityError::Config(m) => ComplianceError::Configuration(m),
            other => ComplianceError::Link(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anyhow_becomes_storage_with_context_chain() {
        let e: ComplianceError = anyhow::anyhow!("disk full").context("write queue.json").into();
        assert_eq!(
            e,
            ComplianceError::Storage("write queue.json: disk full".to_string())
        );
    }

    #[test]
    fn authority_errors_map_to_link_except_config() {
        let link: ComplianceError = AuthorityError::Transport("refused".to_string()).into();
        assert_eq!(link.code(), "LINK");
        let cfg: ComplianceError = AuthorityError::Config("bad url".to_string()).into();
        assert_eq!(cfg.code(), "CONFIGURATION");
    }
}
