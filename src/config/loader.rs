use super::schema::ProxyConfig;
use crate::error::{ConfigError, Result};
use figment::providers::{Env, Format, Json, Toml, Yaml};
use figment::Figment;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

const ENV_PREFIX: &str = "INTERCEPT_PROXY_";

/// Environment keys arrive as `URLS_TO_WATCH`; the schema uses camelCase
fn env_provider() -> Env {
    Env::prefixed(ENV_PREFIX).map(|key| camel_case(key.as_str()).into())
}

fn camel_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper = false;
    for c in key.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.extend(c.to_lowercase());
        }
    }
    out
}

/// Load from `intercept-proxy.{toml,json,yaml,yml}` in the working directory,
/// overridden by `INTERCEPT_PROXY_*` environment variables
pub fn load_from_env_or_file() -> Result<ProxyConfig> {
    let config: ProxyConfig = Figment::new()
        .merge(Toml::file("intercept-proxy.toml"))
        .merge(Json::file("intercept-proxy.json"))
        .merge(Yaml::file("intercept-proxy.yaml"))
        .merge(Yaml::file("intercept-proxy.yml"))
        .merge(env_provider())
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    finish(config)
}

pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<ProxyConfig> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigError::Parse(format!("Config file not found: {}", path.display())).into());
    }

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into())
        }
    };

    let config: ProxyConfig = figment
        .merge(env_provider())
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    finish(config)
}

fn finish(config: ProxyConfig) -> Result<ProxyConfig> {
    let config = apply_env_substitutions(config)?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &ProxyConfig) -> Result<()> {
    if config.ip_address.trim().is_empty() {
        return Err(ConfigError::Validation("ipAddress must not be empty".into()).into());
    }

    if config.stdio_chunk_size == 0 {
        return Err(
            ConfigError::Validation("stdioChunkSize must be greater than 0".into()).into(),
        );
    }

    if let Some(0) = config.timeout {
        return Err(ConfigError::Validation("timeout must be greater than 0".into()).into());
    }

    for entry in &config.plugins {
        if entry.name.trim().is_empty() {
            return Err(ConfigError::Validation("Plugin entry has an empty name".into()).into());
        }
    }

    Ok(())
}

fn apply_env_substitutions(mut config: ProxyConfig) -> Result<ProxyConfig> {
    for url in &mut config.urls_to_watch {
        *url = substitute_env_vars(url)?;
    }

    for rule in &mut config.filter_by_headers {
        if let Some(value) = &mut rule.value {
            *value = substitute_env_vars(value)?;
        }
    }

    for entry in &mut config.plugins {
        if let Some(urls) = &mut entry.urls_to_watch {
            for url in urls {
                *url = substitute_env_vars(url)?;
            }
        }
    }

    Ok(config)
}

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("static regex"))
}

fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();

    for cap in env_var_pattern().captures_iter(input) {
        let expr = &cap[1];
        let (name, default) = match expr.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (expr, None),
        };

        let value = match (std::env::var(name), default) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.to_string(),
            (Err(_), None) => {
                return Err(ConfigError::EnvVar(format!(
                    "Environment variable '{name}' not found"
                ))
                .into())
            }
        };
        result = result.replace(&cap[0], &value);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProxyError;
    use std::io::Write;

    #[test]
    fn test_env_substitution() {
        std::env::set_var("INTERCEPT_TEST_HOST", "api.example.com");

        let result = substitute_env_vars("https://${INTERCEPT_TEST_HOST}/*").unwrap();
        assert_eq!(result, "https://api.example.com/*");

        let result = substitute_env_vars("${INTERCEPT_TEST_MISSING:-fallback}").unwrap();
        assert_eq!(result, "fallback");

        assert!(matches!(
            substitute_env_vars("${INTERCEPT_TEST_MISSING}"),
            Err(ProxyError::Config(ConfigError::EnvVar(_)))
        ));

        std::env::remove_var("INTERCEPT_TEST_HOST");
    }

    #[test]
    fn test_camel_case() {
        assert_eq!(camel_case("urls_to_watch"), "urlsToWatch");
        assert_eq!(camel_case("PORT"), "port");
        assert_eq!(camel_case("IP_ADDRESS"), "ipAddress");
    }

    #[test]
    fn test_load_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"port": 9000, "urlsToWatch": ["https://a.test/*"], "plugins": [{{"name": "latency"}}]}}"#
        )
        .unwrap();

        let config = load_from_path(file.path()).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.plugins.len(), 1);
        assert!(config.plugins[0].enabled);
    }

    #[test]
    fn test_load_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "ipAddress: 0.0.0.0\nrecord: true\ntimeout: 30").unwrap();

        let config = load_from_path(file.path()).unwrap();
        assert_eq!(config.ip_address, "0.0.0.0");
        assert!(config.record);
        assert_eq!(config.timeout, Some(30));
    }

    #[test]
    fn test_rejects_unknown_extension_and_bad_values() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        assert!(load_from_path(file.path()).is_err());

        let config = ProxyConfig {
            stdio_chunk_size: 0,
            ..ProxyConfig::default()
        };
        assert!(validate(&config).is_err());
    }
}
