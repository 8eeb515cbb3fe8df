//! Runtime configuration: built from defaults, overlaid with an optional
//! `storyloop.toml`, then with environment variables. Env wins.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Personal access token used for clone auth, push, and PR creation.
    /// Without it, public repos still clone but publishing is skipped.
    pub github_token: Option<String>,
    /// Coding agent binary. Overridable for tests and alternative installs.
    pub agent_cmd: String,
    pub model: String,
    /// How long an approval gate stays open before timing out.
    pub gate_timeout: Duration,
    pub build_timeout: Duration,
    pub install_timeout: Duration,
    pub max_turns_per_story: u32,
    pub git_user_name: String,
    pub git_user_email: String,
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            github_token: None,
            agent_cmd: "claude".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            gate_timeout: Duration::from_secs(24 * 60 * 60),
            build_timeout: Duration::from_secs(120),
            install_timeout: Duration::from_secs(300),
            max_turns_per_story: 10,
            git_user_name: "storyloop".to_string(),
            git_user_email: "storyloop@users.noreply.github.com".to_string(),
            port: 3000,
        }
    }
}

/// On-disk shape of `storyloop.toml`. Every field optional; absent fields
/// keep their defaults.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    agent_cmd: Option<String>,
    model: Option<String>,
    gate_timeout_secs: Option<u64>,
    build_timeout_secs: Option<u64>,
    install_timeout_secs: Option<u64>,
    max_turns_per_story: Option<u32>,
    git_user_name: Option<String>,
    git_user_email: Option<String>,
    port: Option<u16>,
}

impl Config {
    /// Load configuration: defaults, then the config file if one exists,
    /// then environment variables.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = Config::default();

        let path = config_path
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| "storyloop.toml".into());
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let file: FileConfig = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            config.apply_file(file);
        } else if config_path.is_some() {
            anyhow::bail!("Config file {} does not exist", path.display());
        }

        config.apply_env();
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(v) = file.agent_cmd {
            self.agent_cmd = v;
        }
        if let Some(v) = file.model {
            self.model = v;
        }
        if let Some(v) = file.gate_timeout_secs {
            self.gate_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.build_timeout_secs {
            self.build_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.install_timeout_secs {
            self.install_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.max_turns_per_story {
            self.max_turns_per_story = v;
        }
        if let Some(v) = file.git_user_name {
            self.git_user_name = v;
        }
        if let Some(v) = file.git_user_email {
            self.git_user_email = v;
        }
        if let Some(v) = file.port {
            self.port = v;
        }
    }

    fn apply_env(&mut self) {
        if let Ok(token) = std::env::var("GITHUB_TOKEN") {
            if !token.is_empty() {
                self.github_token = Some(token);
            }
        }
        if let Ok(cmd) = std::env::var("CLAUDE_CMD") {
            if !cmd.is_empty() {
                self.agent_cmd = cmd;
            }
        }
        if let Ok(model) = std::env::var("STORYLOOP_MODEL") {
            if !model.is_empty() {
                self.model = model;
            }
        }
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
    }
}
