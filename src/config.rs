use crate::models::Settings;
use anyhow::{Context, Result};
use keyring::Entry;

// --- API Token Resolution ---

const KEYRING_SERVICE: &str = "toolchat_api_token";

/// Resolves the API token configured in `settings`.
///
/// The `api_token` field accepts a literal token, an `env:VAR_NAME`
/// reference, or the literal `keyring` to read the OS keyring entry for
/// the configured endpoint. `None`/empty means the request goes out
/// without an Authorization header.
pub fn resolve_api_token(settings: &Settings) -> Result<Option<String>> {
    match settings.api_token.as_deref() {
        None | Some("") => Ok(None),
        Some(ref_str) if ref_str.starts_with("env:") => {
            let env_var_name = ref_str.trim_start_matches("env:");
            log::debug!("Retrieving API token from environment variable: {}", env_var_name);
            std::env::var(env_var_name)
                .map(Some)
                .context(format!(
                    "Failed to get API token from environment variable '{}'",
                    env_var_name
                ))
        }
        Some("keyring") => {
            let entry = Entry::new(KEYRING_SERVICE, &settings.api_base_url)
                .context("Failed to create keyring entry")?;
            log::debug!(
                "Retrieving API token from keyring for endpoint: {}",
                settings.api_base_url
            );
            entry.get_password().map(Some).context(format!(
                "Failed to get API token from keyring for '{}'. Please set it in settings.",
                settings.api_base_url
            ))
        }
        Some(token) => Ok(Some(token.to_string())),
    }
}

/// Stores an API token in the OS keyring for the configured endpoint.
pub fn set_api_token_in_keyring(settings: &Settings, api_token: &str) -> Result<()> {
    let entry = Entry::new(KEYRING_SERVICE, &settings.api_base_url)
        .context("Failed to create keyring entry for setting password")?;
    log::info!(
        "Setting API token in keyring for endpoint: {}",
        settings.api_base_url
    );
    entry.set_password(api_token).context(format!(
        "Failed to set API token in keyring for '{}'",
        settings.api_base_url
    ))
}
