//! Configuration management for codeloom
//!
//! Stores settings in ~/.config/codeloom/config.toml. Environment variables
//! override the file, and API keys may also live in the system keychain.

use crate::fuzzy::MatchOptions;
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;
use url::Url;

const KEYRING_SERVICE: &str = "codeloom";
const KEYRING_USERNAME: &str = "api_keys";

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub provider: ProviderConfig,
    pub retry: RetryConfig,
    pub engine: EngineConfig,
    pub tools: ToolsConfig,
    pub classifier: ClassifierConfig,
    pub fuzzy: FuzzyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub model: String,
    /// Keys stored in the config file. Prefer the keychain or environment.
    pub api_keys: Vec<String>,
    pub request_timeout_secs: u64,
    pub max_output_tokens: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_keys: Vec::new(),
            request_timeout_secs: 120,
            max_output_tokens: 8192,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 2000,
            backoff_multiplier: 2,
            max_backoff_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum turns executed per script, chained turns included.
    pub max_turns: usize,
    /// Maximum model calls inside one turn (tool round-trips included).
    pub max_tool_iterations: usize,
    /// Run independent tool calls of one response concurrently.
    pub parallel_tools: bool,
    /// Attach the dependency blueprint to synthesized prompts.
    pub attach_blueprint: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_turns: 32,
            max_tool_iterations: 25,
            parallel_tools: true,
            attach_blueprint: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub shell_timeout_secs: u64,
    pub max_output_bytes: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            shell_timeout_secs: 60,
            max_output_bytes: 16_000,
        }
    }
}

impl ToolsConfig {
    pub fn shell_timeout(&self) -> Duration {
        Duration::from_secs(self.shell_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub high_confidence: f64,
    /// Ask the model when the rule-based pass is not confident enough.
    pub use_model_fallback: bool,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            high_confidence: 0.8,
            use_model_fallback: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FuzzyConfig {
    pub min_similarity: f64,
    pub min_similarity_with_hint: f64,
}

impl Default for FuzzyConfig {
    fn default() -> Self {
        Self {
            min_similarity: 0.85,
            min_similarity_with_hint: 0.80,
        }
    }
}

impl From<&FuzzyConfig> for MatchOptions {
    fn from(config: &FuzzyConfig) -> Self {
        Self {
            min_similarity: config.min_similarity.clamp(0.0, 1.0),
            min_similarity_with_hint: config.min_similarity_with_hint.clamp(0.0, 1.0),
        }
    }
}

fn keyring_entry() -> Result<Entry, keyring::Error> {
    Entry::new(KEYRING_SERVICE, KEYRING_USERNAME)
}

fn read_keyring_keys() -> Result<Vec<String>, keyring::Error> {
    let entry = keyring_entry()?;
    match entry.get_password() {
        Ok(stored) => Ok(split_keys(&stored)),
        Err(keyring::Error::NoEntry) => Ok(Vec::new()),
        Err(err) => Err(err),
    }
}

fn write_keyring_keys(keys: &[String]) -> Result<(), keyring::Error> {
    let entry = keyring_entry()?;
    entry.set_password(&keys.join(","))
}

fn split_keys(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("codeloom"))
    }

    /// Get the config file path
    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.toml"))
    }

    /// Load config from disk (or defaults), then apply environment overrides.
    pub fn load() -> Self {
        let mut config = Self::config_path()
            .map(|path| Self::load_from(&path))
            .unwrap_or_default();
        config.apply_env_overrides();
        config
    }

    /// Load from an explicit file. Missing files yield defaults; corrupt
    /// files are preserved next to the original and defaults are used.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };
        match toml::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                preserve_corrupt_config(path, &content);
                warn!(
                    path = %path.display(),
                    "config file was corrupted ({}); a backup was saved and defaults were loaded",
                    err
                );
                Self::default()
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(model) = std::env::var("CODELOOM_MODEL") {
            if !model.trim().is_empty() {
                self.provider.model = model.trim().to_string();
            }
        }
        if let Ok(base) = std::env::var("CODELOOM_BASE_URL") {
            if !base.trim().is_empty() {
                self.provider.base_url = base.trim().to_string();
            }
        }
    }

    /// Save config to disk
    pub fn save(&self) -> Result<(), String> {
        let dir =
            Self::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;
        self.save_to(&dir.join("config.toml"))
    }

    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Err(e) = fs::set_permissions(dir, fs::Permissions::from_mode(0o700)) {
                    warn!("failed to set config directory permissions: {}", e);
                }
            }
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| format!("Failed to serialize config: {}", e))?;
        write_config_atomic(path, &content).map_err(|e| format!("Failed to write config: {}", e))
    }

    /// API keys in priority order: environment, keychain, config file.
    pub fn api_keys(&self) -> Vec<String> {
        if let Ok(keys) = std::env::var("CODELOOM_API_KEYS") {
            let keys = split_keys(&keys);
            if !keys.is_empty() {
                return keys;
            }
        }
        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            if !key.trim().is_empty() {
                return vec![key.trim().to_string()];
            }
        }

        match read_keyring_keys() {
            Ok(keys) if !keys.is_empty() => return keys,
            Ok(_) => {}
            Err(err) => {
                warn!("failed to read API keys from system keychain: {}", err);
            }
        }

        self.provider
            .api_keys
            .iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect()
    }

    /// Store keys in the keychain and verify by reading them back.
    pub fn set_api_keys(&mut self, keys: &[String]) -> Result<(), String> {
        if let Err(write_err) = write_keyring_keys(keys) {
            return Err(format!(
                "Failed to store API keys in system keychain: {}. \
                 You can set the CODELOOM_API_KEYS environment variable instead.",
                write_err
            ));
        }

        match read_keyring_keys() {
            Ok(stored) if stored == keys => {
                self.provider.api_keys.clear();
                self.save()
            }
            Ok(_) => Err("API key verification failed: stored keys don't match.".to_string()),
            Err(read_err) => Err(format!(
                "API key verification failed: couldn't read back from keychain ({}).",
                read_err
            )),
        }
    }

    /// Validated endpoint base for the provider.
    pub fn base_url(&self) -> Result<Url, String> {
        let mut raw = self.provider.base_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let url = Url::parse(&raw).map_err(|e| format!("Invalid provider base URL: {}", e))?;
        match url.scheme() {
            "https" | "http" => Ok(url),
            other => Err(format!("Unsupported URL scheme: {}", other)),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.provider.request_timeout_secs.max(1))
    }

    /// Get the config file location for display
    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/codeloom/config.toml".to_string())
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("toml.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

fn write_config_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    use std::fs::OpenOptions;

    let tmp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = file.set_permissions(fs::Permissions::from_mode(0o600)) {
            warn!("failed to set temp config file permissions: {}", e);
        }
    }

    file.write_all(content.as_bytes())?;
    file.sync_all()?;

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.provider.api_keys.is_empty());
        assert_eq!(config.fuzzy.min_similarity, 0.85);
        assert_eq!(config.classifier.high_confidence, 0.8);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[engine]\nmax_turns = 4\n").unwrap();

        let config = Config::load_from(&path);
        assert_eq!(config.engine.max_turns, 4);
        assert_eq!(config.engine.max_tool_iterations, 25);
        assert_eq!(config.provider.model, DEFAULT_MODEL);
    }

    #[test]
    fn test_corrupt_file_is_preserved() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[engine\nmax_turns = ").unwrap();

        let config = Config::load_from(&path);
        assert_eq!(config.engine.max_turns, 32);
        assert!(dir.path().join("config.toml.corrupt").exists());
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");
        let mut config = Config::default();
        config.tools.shell_timeout_secs = 5;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path);
        assert_eq!(loaded.tools.shell_timeout_secs, 5);
        assert!(!dir.path().join("nested/config.tmp").exists());
    }

    #[test]
    fn test_base_url_validation() {
        let mut config = Config::default();
        assert!(config.base_url().is_ok());
        config.provider.base_url = "ftp://example.com".to_string();
        assert!(config.base_url().is_err());
        config.provider.base_url = "not a url".to_string();
        assert!(config.base_url().is_err());
    }

    #[test]
    fn test_split_keys() {
        assert_eq!(split_keys(" a, ,b "), vec!["a".to_string(), "b".to_string()]);
    }
}
