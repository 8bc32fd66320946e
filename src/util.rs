use crate::config::BrokerConfig;

const MQTT_USERNAME: &str = "MQTT_USERNAME";

const MQTT_PASSWORD: &str = "MQTT_PASSWORD";

pub fn get_username() -> Option<String> {
    std::env::var(MQTT_USERNAME).ok().filter(|v| !v.is_empty())
}

pub fn get_password() -> Option<String> {
    std::env::var(MQTT_PASSWORD).ok().filter(|v| !v.is_empty())
}

/// Let broker credentials from the environment win over the config file
pub fn apply_env_credentials(config: &mut BrokerConfig) {
    apply_credentials(config, get_username(), get_password());
}

fn apply_credentials(config: &mut BrokerConfig, username: Option<String>, password: Option<String>) {
    if let Some(username) = username {
        config.username = Some(username);
    }
    if let Some(password) = password {
        config.password = Some(password);
    }
}
