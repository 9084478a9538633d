//! `streamweave config` — Print configuration.

use std::path::Path;
use streamweave_config::AppConfig;

pub fn show(config_path: Option<&Path>, defaults: bool) -> Result<(), Box<dyn std::error::Error>> {
    if defaults {
        println!("{}", AppConfig::default_toml());
        return Ok(());
    }

    let config = AppConfig::load_with(config_path).map_err(|e| format!("Failed to load config: {e}"))?;
    println!("{}", render_redacted(&config)?);
    Ok(())
}

/// The configuration as TOML with every secret-looking value masked.
pub fn render_redacted(config: &AppConfig) -> Result<String, Box<dyn std::error::Error>> {
    let mut value = toml::Value::try_from(config)?;
    redact_secrets(&mut value);
    Ok(toml::to_string_pretty(&value)?)
}

fn redact_secrets(value: &mut toml::Value) {
    match value {
        toml::Value::Table(table) => {
            for (key, val) in table.iter_mut() {
                let key_lower = key.to_lowercase();
                let secret = ["key", "secret", "token", "password"].iter().any(|s| key_lower.contains(s));
                if secret && val.as_str().is_some_and(|s| !s.is_empty()) {
                    *val = toml::Value::String("***REDACTED***".into());
                } else {
                    redact_secrets(val);
                }
            }
        }
        toml::Value::Array(items) => items.iter_mut().for_each(redact_secrets),
        _ => {}
    }
}
