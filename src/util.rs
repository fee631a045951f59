const CREDENTIAL_KEY: &str = "FLEET_CREDENTIAL_KEY";

/// Credential cipher key from the environment, if set.
pub fn get_credential_key() -> Option<String> {
    std::env::var(CREDENTIAL_KEY).ok()
}

const CONFIG_FILE: &str = "FLEET_CONFIG";

const DEFAULT_CONFIG_FILE: &str = "./fleet.json";

/// Config file path from the environment, falling back to `./fleet.json`.
pub fn get_config_path() -> String {
    std::env::var(CONFIG_FILE).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string())
}
