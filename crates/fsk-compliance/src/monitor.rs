use std::sync::Arc;

use fsk_authority::{AuthorityCredentials, AuthorityTransport};
use fsk_schemas::ComplianceSettings;
use tracing::{debug, warn};

use crate::error::ComplianceError;

/// On-demand reachability probe of the authority.
///
/// Holds no state of its own; the service records the outcome in its
/// connection status.
pub struct ConnectionMonitor {
    transport: Arc<dyn AuthorityTransport>,
}

impl ConnectionMonitor {
    pub fn new(transport: Arc<dyn AuthorityTransport>) -> Self {
        Self { transport }
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// `Configuration` if credentials are incomplete (no probe is sent),
    /// `Link` if the probe fails.
    pub async fn test(&self, settings: &ComplianceSettings) -> Result<(), ComplianceError> {
        require_credentials(settings)?;

        let creds = AuthorityCredentials::from_settings(settings);
        match self.transport.probe(&creds).await {
            Ok(()) => {
                debug!(transport = self.transport.name(), "authority probe ok");
                Ok(())
            }
            Err(e) => {
                warn!(transport = self.transport.name(), error = %e, "authority probe failed");
                Err(e.into())
            }
        }
    }
}

pub(crate) fn require_credentials(settings: &ComplianceSettings) -> Result<(), ComplianceError> {
    let missing = settings.missing_credentials();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ComplianceError::Configuration(format!(
            "missing credentials: {}",
            missing.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsk_authority::PaperAuthority;

    fn complete() -> ComplianceSettings {
        ComplianceSettings {
            participant_id: "ATU1".to_string(),
            user_id: "u".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn incomplete_credentials_do_not_probe() {
        let paper = Arc::new(PaperAuthority::new());
        let m = ConnectionMonitor::new(paper.clone());
        let err = m.test(&ComplianceSettings::default()).await.unwrap_err();
        assert_eq!(
            err,
            ComplianceError::Configuration("missing credentials: participant_id, user_id".to_string())
        );
        assert_eq!(paper.probe_count(), 0);
    }

    #[tokio::test]
    async fn link_down_is_link_error() {
        let paper = Arc::new(PaperAuthority::new());
        paper.set_link(false);
        let m = ConnectionMonitor::new(paper.clone());
        assert!(matches!(
            m.test(&complete()).await,
            Err(ComplianceError::Link(_))
        ));
        paper.set_link(true);
        m.test(&complete()).await.unwrap();
    }
}
