use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::batch::RunPolicy;
use crate::client::ClientConfig;
use crate::retry::{DEFAULT_MAX_ATTEMPTS, RetryPolicy};
use crate::session::Credentials;
use crate::sparql::DEFAULT_SPARQL_ENDPOINT;

pub const DEFAULT_USER_AGENT: &str = "wikibot/0.1";
pub const DEFAULT_CONFIG_FILE: &str = "wikibot.toml";
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAXLAG: u32 = 5;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct BotConfig {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub sparql: SparqlSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub api_url: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ClientSection {
    pub timeout_secs: Option<u64>,
    /// `0` turns maxlag off.
    pub maxlag: Option<u32>,
    pub max_attempts: Option<usize>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_max_secs: Option<u64>,
    pub jitter_ms: Option<u64>,
    pub rate_limit_read_ms: Option<u64>,
    pub rate_limit_write_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct RunSection {
    pub throttle_secs: Option<f64>,
    pub error_sleep_secs: Option<f64>,
    pub dry_run: Option<bool>,
    pub summary: Option<String>,
    pub retry_conflicts: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SparqlSection {
    pub endpoint: Option<String>,
}

/// Load and parse a BotConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<BotConfig> {
    if !config_path.exists() {
        return Ok(BotConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: BotConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

impl BotConfig {
    /// Apply `WIKI_*` environment overrides on top of file values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let value = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(api_url) = value("WIKI_API_URL") {
            self.wiki.api_url = Some(api_url);
        }
        if let Some(user_agent) = value("WIKI_USER_AGENT") {
            self.wiki.user_agent = Some(user_agent);
        }
        if let Some(maxlag) = value("WIKI_MAXLAG") {
            self.client.maxlag = Some(parse_env("WIKI_MAXLAG", &maxlag)?);
        }
        if let Some(retries) = value("WIKI_HTTP_RETRIES") {
            self.client.max_attempts = Some(parse_env("WIKI_HTTP_RETRIES", &retries)?);
        }
        if let Some(timeout) = value("WIKI_HTTP_TIMEOUT_SECS") {
            self.client.timeout_secs = Some(parse_env("WIKI_HTTP_TIMEOUT_SECS", &timeout)?);
        }
        if let Some(throttle) = value("WIKI_THROTTLE_SECS") {
            self.run.throttle_secs = Some(parse_env("WIKI_THROTTLE_SECS", &throttle)?);
        }
        if let Some(dry_run) = value("WIKI_DRY_RUN") {
            self.run.dry_run = Some(parse_flag("WIKI_DRY_RUN", &dry_run)?);
        }
        if let Some(endpoint) = value("WIKIDATA_SPARQL_URL") {
            self.sparql.endpoint = Some(endpoint);
        }
        Ok(())
    }

    pub fn api_url(&self) -> Result<String> {
        match self.wiki.api_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => Ok(url.to_string()),
            _ => bail!("wiki API URL is not configured (set [wiki].api_url or WIKI_API_URL)"),
        }
    }

    pub fn user_agent(&self) -> String {
        self.wiki
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.client.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS))
    }

    pub fn sparql_endpoint(&self) -> String {
        self.sparql
            .endpoint
            .clone()
            .unwrap_or_else(|| DEFAULT_SPARQL_ENDPOINT.to_string())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        let client = &self.client;
        RetryPolicy {
            max_attempts: client.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1),
            base_delay: client
                .backoff_base_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: client
                .backoff_max_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_delay),
            max_jitter: client
                .jitter_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_jitter),
        }
    }

    pub fn client_config(&self) -> Result<ClientConfig> {
        let mut config = ClientConfig::new(self.api_url()?);
        config.maxlag = match self.client.maxlag.unwrap_or(DEFAULT_MAXLAG) {
            0 => None,
            maxlag => Some(maxlag),
        };
        config.rate_limit_read = Duration::from_millis(self.client.rate_limit_read_ms.unwrap_or(0));
        config.rate_limit_write = Duration::from_millis(self.client.rate_limit_write_ms.unwrap_or(0));
        config.retry = self.retry_policy();
        Ok(config)
    }

    pub fn run_policy(&self) -> Result<RunPolicy> {
        let defaults = RunPolicy::default();
        let run = &self.run;
        Ok(RunPolicy {
            throttle: seconds("run.throttle_secs", run.throttle_secs)?.unwrap_or(defaults.throttle),
            error_sleep: seconds("run.error_sleep_secs", run.error_sleep_secs)?
                .unwrap_or(defaults.error_sleep),
            retry_conflicts: run.retry_conflicts.unwrap_or(defaults.retry_conflicts),
            dry_run: run.dry_run.unwrap_or(defaults.dry_run),
            summary: run.summary.clone().unwrap_or(defaults.summary),
            ..defaults
        })
    }
}

impl Credentials {
    /// Read `WIKI_BOT_USER` / `WIKI_BOT_PASS`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let username = lookup("WIKI_BOT_USER")
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("WIKI_BOT_USER is required for editing"))?;
        let password = lookup("WIKI_BOT_PASS")
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow::anyhow!("WIKI_BOT_PASS is required for editing"))?;
        Ok(Self::new(username.trim(), password))
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|error| anyhow::anyhow!("invalid {key}={value}: {error}"))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("invalid {key}={value}: expected true or false"),
    }
}

fn seconds(key: &str, value: Option<f64>) -> Result<Option<Duration>> {
    match value {
        None => Ok(None),
        Some(secs) => Duration::try_from_secs_f64(secs)
            .map(Some)
            .map_err(|error| anyhow::anyhow!("invalid {key}={secs}: {error}")),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use tempfile::tempdir;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect::<BTreeMap<_, _>>();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/wikibot.toml")).expect("load config");
        assert_eq!(config, BotConfig::default());
        assert!(config.client_config().is_err());
    }

    #[test]
    fn defaults_match_documented_values() {
        let mut config = BotConfig::default();
        config.wiki.api_url = Some("https://shinto.miraheze.org/w/api.php".to_string());

        let client = config.client_config().expect("client config");
        assert_eq!(client.maxlag, Some(5));
        assert_eq!(client.retry.max_attempts, 6);
        assert_eq!(client.retry.max_delay, Duration::from_secs(30));
        assert_eq!(config.timeout(), Duration::from_secs(60));
        assert_eq!(config.user_agent(), "wikibot/0.1");
        assert_eq!(config.sparql_endpoint(), "https://query.wikidata.org/sparql");

        let policy = config.run_policy().expect("policy");
        assert_eq!(policy.throttle, Duration::from_secs(1));
        assert_eq!(policy.error_sleep, Duration::from_secs(3));
        assert!(!policy.dry_run);
    }

    #[test]
    fn load_config_parses_all_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("wikibot.toml");
        fs::write(
            &config_path,
            r#"
[wiki]
api_url = "https://www.wikidata.org/w/api.php"
user_agent = "test-agent/1.0 (ops@example.org)"

[client]
timeout_secs = 20
maxlag = 0
max_attempts = 3
backoff_base_ms = 250
rate_limit_write_ms = 1500

[run]
throttle_secs = 0.5
dry_run = true
summary = "Removing deprecated statements"
retry_conflicts = true

[sparql]
endpoint = "https://query.example/sparql"
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        let client = config.client_config().expect("client");
        assert_eq!(client.maxlag, None);
        assert_eq!(client.retry.max_attempts, 3);
        assert_eq!(client.retry.base_delay, Duration::from_millis(250));
        assert_eq!(client.rate_limit_write, Duration::from_millis(1500));
        assert_eq!(config.timeout(), Duration::from_secs(20));
        assert_eq!(config.sparql_endpoint(), "https://query.example/sparql");

        let policy = config.run_policy().expect("policy");
        assert_eq!(policy.throttle, Duration::from_millis(500));
        assert!(policy.dry_run);
        assert!(policy.retry_conflicts);
        assert_eq!(policy.summary, "Removing deprecated statements");
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("wikibot.toml");
        fs::write(&config_path, "[wiki\napi_url = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let mut config = BotConfig::default();
        config.wiki.api_url = Some("https://file.example/w/api.php".to_string());
        config.client.max_attempts = Some(2);

        config
            .apply_overrides(lookup(&[
                ("WIKI_API_URL", " https://env.example/w/api.php "),
                ("WIKI_HTTP_RETRIES", "9"),
                ("WIKI_MAXLAG", "10"),
                ("WIKI_THROTTLE_SECS", "2.5"),
                ("WIKI_DRY_RUN", "yes"),
                ("WIKI_USER_AGENT", ""),
            ]))
            .expect("overrides");

        assert_eq!(config.api_url().expect("url"), "https://env.example/w/api.php");
        assert_eq!(config.client.max_attempts, Some(9));
        assert_eq!(config.client.maxlag, Some(10));
        assert_eq!(config.run.dry_run, Some(true));
        assert_eq!(config.user_agent(), DEFAULT_USER_AGENT);
        assert_eq!(
            config.run_policy().expect("policy").throttle,
            Duration::from_millis(2500)
        );
    }

    #[test]
    fn malformed_env_values_are_reported() {
        let mut config = BotConfig::default();
        let error = config
            .apply_overrides(lookup(&[("WIKI_HTTP_RETRIES", "many")]))
            .expect_err("must fail");
        assert!(error.to_string().contains("WIKI_HTTP_RETRIES"));
        let error = config
            .apply_overrides(lookup(&[("WIKI_DRY_RUN", "maybe")]))
            .expect_err("must fail");
        assert!(error.to_string().contains("WIKI_DRY_RUN"));
    }

    #[test]
    fn negative_throttle_is_rejected() {
        let mut config = BotConfig::default();
        config.run.throttle_secs = Some(-1.0);
        assert!(config.run_policy().is_err());
    }

    #[test]
    fn credentials_come_from_lookup() {
        let credentials = Credentials::from_lookup(lookup(&[
            ("WIKI_BOT_USER", "ShintoBot@import"),
            ("WIKI_BOT_PASS", "secret"),
        ]))
        .expect("credentials");
        assert_eq!(credentials.username, "ShintoBot@import");
        assert!(!format!("{credentials:?}").contains("secret"));

        let error = Credentials::from_lookup(lookup(&[("WIKI_BOT_USER", "ShintoBot")]))
            .expect_err("missing password");
        assert!(error.to_string().contains("WIKI_BOT_PASS"));
    }
}
