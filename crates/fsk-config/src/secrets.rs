//! Runtime secret resolution for the authority credentials.
//!
//! # Contract
//! - Config YAML stores only **env var NAMES** (`authority.keys_env.*`).
//! - Binaries call [`resolve_authority_secrets`] once at startup and pass the
//!   result on; nothing else reads these env vars.
//! - Values are [`SecretString`]s, so `Debug` output is redacted.
//! - Error messages name the env var, never the value.

use anyhow::{bail, Result};
use fsk_schemas::SecretString;

use crate::ServiceConfig;

/// Authority secrets resolved from the environment.
#[derive(Debug, Clone, Default)]
pub struct AuthoritySecrets {
    /// Authority login PIN. `None` if the named env var was absent or blank.
    pub pin: Option<SecretString>,
    /// Signing key for the hardware-token signing device.
    pub signing_key: Option<SecretString>,
}

/// Resolve a named environment variable; `None` if unset or blank.
fn resolve_env(var_name: &str) -> Option<SecretString> {
    match std::env::var(var_name) {
        Ok(v) if !v.trim().is_empty() => Some(SecretString::new(v)),
        _ => None,
    }
}

/// Resolve authority secrets named in `config`.
///
/// When `authority.require_env_secrets` is set, a missing PIN is an error
/// (the signing key stays optional; software certificates do not need it).
pub fn resolve_authority_secrets(config: &ServiceConfig) -> Result<AuthoritySecrets> {
    let names = &config.authority.keys_env;
    let pin = resolve_env(&names.pin);
    let signing_key = resolve_env(&names.signing_key);

    if config.authority.require_env_secrets && pin.is_none() {
        bail!(
            "SECRETS_MISSING: required env var '{}' (authority pin) is not set or empty",
            names.pin
        );
    }

    Ok(AuthoritySecrets { pin, signing_key })
}
