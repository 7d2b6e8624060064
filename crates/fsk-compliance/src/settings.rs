//! Compliance settings: stored snapshot plus env-provided secret fallbacks.

use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Result;
use fsk_config::AuthoritySecrets;
use fsk_schemas::{ComplianceSettings, SettingsPatch};
use tokio::sync::Mutex;
use tracing::info;

use crate::store::ComplianceStore;

pub struct SettingsStore {
    store: Arc<dyn ComplianceStore>,
    current: RwLock<ComplianceSettings>,
    /// Held across read, merge, save and swap so overlapping patches apply
    /// one after another.
    update_lock: Mutex<()>,
    /// Secrets resolved from the environment at startup. Used only when the
    /// stored value is blank; never persisted.
    env_secrets: AuthoritySecrets,
}

impl SettingsStore {
    pub async fn load(store: Arc<dyn ComplianceStore>, env_secrets: AuthoritySecrets) -> Result<Self> {
        let current = store.load_settings().await?.unwrap_or_default();
        Ok(Self {
            store,
            current: RwLock::new(current),
            update_lock: Mutex::new(()),
            env_secrets,
        })
    }

    /// Merge `patch`, persist, and return the new snapshot.
    ///
    /// No credential validation: incomplete settings may be saved.
    pub async fn update(&self, patch: SettingsPatch) -> Result<ComplianceSettings> {
        let _update = self.update_lock.lock().await;
        let mut next = self.current();
        next.apply(patch);
        self.store.save_settings(&next).await?;
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next.clone();
        info!(
            enabled = next.enabled,
            signing_device = ?next.signing_device,
            export_enabled = next.export_enabled,
            "compliance settings updated"
        );
        Ok(next)
    }

    /// Stored settings, as last saved.
    pub fn current(&self) -> ComplianceSettings {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stored settings with blank secrets filled from the environment.
    pub fn effective(&self) -> ComplianceSettings {
        let mut s = self.current();
        if s.pin.is_empty() {
            if let Some(pin) = &self.env_secrets.pin {
                s.pin = pin.clone();
            }
        }
        if s.signing_key.is_empty() {
            if let Some(key) = &self.env_secrets.signing_key {
                s.signing_key = key.clone();
            }
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use fsk_schemas::SecretString;
    use std::time::Duration;

    #[tokio::test]
    async fn partial_update_keeps_other_fields_and_persists() {
        let store = Arc::new(MemoryStore::new());
        let s = SettingsStore::load(store.clone(), AuthoritySecrets::default())
            .await
            .unwrap();

        s.update(SettingsPatch {
            participant_id: Some("ATU1".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
        let after = s
            .update(SettingsPatch {
                user_id: Some("kassa".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(after.participant_id, "ATU1");
        assert_eq!(after.user_id, "kassa");
        assert_eq!(store.load_settings().await.unwrap(), Some(after));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlapping_updates_keep_both_patches() {
        let store = Arc::new(MemoryStore::new());
        let s = Arc::new(
            SettingsStore::load(store.clone(), AuthoritySecrets::default())
                .await
                .unwrap(),
        );
        store.set_save_delay(Some(Duration::from_millis(100)));

        let a = {
            let s = s.clone();
            tokio::spawn(async move {
                s.update(SettingsPatch {
                    participant_id: Some("ATU1".to_string()),
                    ..Default::default()
                })
                .await
            })
        };
        let b = {
            let s = s.clone();
            tokio::spawn(async move {
                s.update(SettingsPatch {
                    user_id: Some("kassa".to_string()),
                    ..Default::default()
                })
                .await
            })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let now = s.current();
        assert_eq!(now.participant_id, "ATU1");
        assert_eq!(now.user_id, "kassa");
        assert_eq!(store.load_settings().await.unwrap(), Some(now));
    }

    #[tokio::test]
    async fn env_secret_fills_blank_only() {
        let store = Arc::new(MemoryStore::new());
        let env = AuthoritySecrets {
            pin: Some(SecretString::new("env-pin")),
            signing_key: Some(SecretString::new("env-key")),
        };
        let s = SettingsStore::load(store.clone(), env).await.unwrap();
        assert_eq!(s.effective().pin.expose(), "env-pin");

        s.update(SettingsPatch {
            pin: Some(SecretString::new("stored-pin")),
            ..Default::default()
        })
        .await
        .unwrap();
        let eff = s.effective();
        assert_eq!(eff.pin.expose(), "stored-pin");
        assert_eq!(eff.signing_key.expose(), "env-key");
        // env secrets are never written back
        let persisted = store.load_settings().await.unwrap().unwrap();
        assert!(persisted.signing_key.is_empty());
    }

    #[tokio::test]
    async fn failed_persist_leaves_snapshot_unchanged() {
        let store = Arc::new(MemoryStore::new());
        let s = SettingsStore::load(store.clone(), AuthoritySecrets::default())
            .await
            .unwrap();
        store.set_fail_writes(true);
        let res = s
            .update(SettingsPatch {
                enabled: Some(true),
                ..Default::default()
            })
            .await;
        assert!(res.is_err());
        assert!(!s.current().enabled);
    }
}
