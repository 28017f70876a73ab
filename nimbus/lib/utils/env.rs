use std::path::PathBuf;

use super::NIMBUS_HOME_DIR;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Environment variable overriding the nimbus home directory.
pub const NIMBUS_HOME_ENV_VAR: &str = "NIMBUS_HOME";

/// Environment variable overriding the public domain sandboxes are exposed under.
pub const NIMBUS_DOMAIN_ENV_VAR: &str = "NIMBUS_DOMAIN";

/// Environment variable holding the secret the server validates bearer tokens with.
pub const NIMBUS_SERVER_KEY_ENV_VAR: &str = "NIMBUS_SERVER_KEY";

/// Environment variable a client reads its API key from.
pub const NIMBUS_API_KEY_ENV_VAR: &str = "NIMBUS_API_KEY";

/// Environment variable a client reads its access token from.
pub const NIMBUS_ACCESS_TOKEN_ENV_VAR: &str = "NIMBUS_ACCESS_TOKEN";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the nimbus home directory.
///
/// `NIMBUS_HOME` wins; otherwise `~/.nimbus`, falling back to `./.nimbus` when the user has no
/// home directory.
pub fn get_nimbus_home_path() -> PathBuf {
    if let Ok(home) = std::env::var(NIMBUS_HOME_ENV_VAR) {
        if !home.is_empty() {
            return PathBuf::from(home);
        }
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(NIMBUS_HOME_DIR)
}
