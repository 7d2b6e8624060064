//! In-process authority for tests and local runs.
//!
//! Behaviour is fully scripted:
//! - `set_link(false)` makes every probe and submit fail with a transport error.
//! - `fail_order(id)` makes submits for that order fail with an API error.
//! - `set_submit_delay(d)` holds each submit for `d` (used to widen race
//!   windows in concurrency tests).
//!
//! Accepted receipts are kept by `receipt_id`; a second submit of the same
//! receipt acks with `duplicate = true`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;

use uuid::Uuid;

use crate::{AuthorityCredentials, AuthorityError, AuthorityTransport, SignedReceipt, SubmitAck};

#[derive(Debug)]
struct PaperState {
    link_up: bool,
    failing_orders: BTreeSet<String>,
    accepted: BTreeMap<Uuid, SignedReceipt>,
    /// Every submit call in order, including failed and duplicate ones.
    submissions: Vec<Uuid>,
    probes: u64,
    submit_delay: Option<Duration>,
}

#[derive(Debug)]
pub struct PaperAuthority {
    state: Mutex<PaperState>,
}

impl Default for PaperAuthority {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperAuthority {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PaperState {
                link_up: true,
                failing_orders: BTreeSet::new(),
                accepted: BTreeMap::new(),
                submissions: Vec::new(),
                probes: 0,
                submit_delay: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PaperState> {
        // Poisoning only happens if a test panicked mid-call; keep going.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_link(&self, up: bool) {
        self.lock().link_up = up;
    }

    pub fn fail_order(&self, order_id: impl Into<String>) {
        self.lock().failing_orders.insert(order_id.into());
    }

    pub fn clear_failures(&self) {
        self.lock().failing_orders.clear();
    }

    pub fn set_submit_delay(&self, delay: Option<Duration>) {
        self.lock().submit_delay = delay;
    }

    pub fn submissions(&self) -> Vec<Uuid> {
        self.lock().submissions.clone()
    }

    pub fn accepted_count(&self) -> usize {
        self.lock().accepted.len()
    }

    pub fn accepted(&self, receipt_id: &Uuid) -> Option<SignedReceipt> {
        self.lock().accepted.get(receipt_id).cloned()
    }

    pub fn probe_count(&self) -> u64 {
        self.lock().probes
    }
}

#[async_trait::async_trait]
impl AuthorityTransport for PaperAuthority {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn probe(&self, creds: &AuthorityCredentials) -> Result<(), AuthorityError> {
        let mut st = self.lock();
        st.probes += 1;
        if !st.link_up {
            return Err(AuthorityError::Transport("paper link down".to_string()));
        }
        if creds.participant_id.is_empty() || creds.user_id.is_empty() {
            return Err(AuthorityError::Api {
                code: Some(401),
                message: "unknown participant".to_string(),
            });
        }
        Ok(())
    }

    async fn submit(
        &self,
        _creds: &AuthorityCredentials,
        receipt: &SignedReceipt,
    ) -> Result<SubmitAck, AuthorityError> {
        let receipt_id = receipt.receipt.receipt_id;
        let delay = {
            let mut st = self.lock();
            st.submissions.push(receipt_id);
            st.submit_delay
        };

        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }

        let mut st = self.lock();
        if !st.link_up {
            return Err(AuthorityError::Transport("paper link down".to_string()));
        }
        if st.failing_orders.contains(&receipt.receipt.order_id) {
            return Err(AuthorityError::Api {
                code: Some(422),
                message: format!("rejected order {}", receipt.receipt.order_id),
            });
        }

        let duplicate = st.accepted.contains_key(&receipt_id);
        if !duplicate {
            st.accepted.insert(receipt_id, receipt.clone());
        }
        let seq = st.accepted.len();
        Ok(SubmitAck {
            receipt_id,
            authority_ref: format!("PAPER-{seq:06}"),
            duplicate,
        })
    }
}
