//! Compliance settings and their partial-update patch.

use serde::{Deserialize, Serialize};

/// A string that must never show up in logs.
///
/// Serializes to its plain value (the durable store needs it); `Debug`
/// always prints `<REDACTED>`. API layers that echo settings back must use
/// [`ComplianceSettings::redacted`].
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            f.write_str("\"\"")
        } else {
            f.write_str("<REDACTED>")
        }
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SigningDevice {
    #[default]
    SoftwareCertificate,
    HardwareToken,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceSettings {
    pub enabled: bool,
    pub participant_id: String,
    pub user_id: String,
    pub pin: SecretString,
    pub device_id: String,
    pub signing_key: SecretString,
    pub signing_device: SigningDevice,
    pub export_enabled: bool,
    pub export_path: String,
}

impl ComplianceSettings {
    /// Names of the credential fields that are still blank.
    pub fn missing_credentials(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.participant_id.trim().is_empty() {
            missing.push("participant_id");
        }
        if self.user_id.trim().is_empty() {
            missing.push("user_id");
        }
        missing
    }

    /// Merge every field present in `patch`; absent fields keep their value.
    pub fn apply(&mut self, patch: SettingsPatch) {
        let SettingsPatch {
            enabled,
            participant_id,
            user_id,
            pin,
            device_id,
            signing_key,
            signing_device,
            export_enabled,
            export_path,
        } = patch;

        if let Some(v) = enabled {
            self.enabled = v;
        }
        if let Some(v) = participant_id {
            self.participant_id = v;
        }
        if let Some(v) = user_id {
            self.user_id = v;
        }
        if let Some(v) = pin {
            self.pin = v;
        }
        if let Some(v) = device_id {
            self.device_id = v;
        }
        if let Some(v) = signing_key {
            self.signing_key = v;
        }
        if let Some(v) = signing_device {
            self.signing_device = v;
        }
        if let Some(v) = export_enabled {
            self.export_enabled = v;
        }
        if let Some(v) = export_path {
            self.export_path = v;
        }
    }

    /// Copy with secret values replaced, safe to return over an API.
    pub fn redacted(&self) -> Self {
        let mask = |s: &SecretString| {
            if s.is_empty() {
                SecretString::default()
            } else {
                SecretString::new("<REDACTED>")
            }
        };
        Self {
            pin: mask(&self.pin),
            signing_key: mask(&self.signing_key),
            ..self.clone()
        }
    }
}

/// Partial settings update. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsPatch {
    pub enabled: Option<bool>,
    pub participant_id: Option<String>,
    pub user_id: Option<String>,
    pub pin: Option<SecretString>,
    pub device_id: Option<String>,
    pub signing_key: Option<SecretString>,
    pub signing_device: Option<SigningDevice>,
    pub export_enabled: Option<bool>,
    pub export_path: Option<String>,
}
