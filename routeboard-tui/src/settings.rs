use std::path::{Path, PathBuf};
use std::{env, fs};

use anyhow::{Context, Result};
use routeboard_core::config::DispatchConfig;
use routeboard_provider_http::HttpConfig;
use serde::Deserialize;

const CONFIG_ENV: &str = "ROUTEBOARD_CONFIG";
const BASE_URL_ENV: &str = "ROUTEBOARD_BASE_URL";
const LOG_ENV: &str = "ROUTEBOARD_LOG";
const DEFAULT_LOG_FILE: &str = "routeboard.log";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct Settings {
    pub dispatch: DispatchConfig,
    pub http: HttpConfig,
    pub log_file: Option<PathBuf>,
}

impl Settings {
    /// Read settings from the first CLI argument or `ROUTEBOARD_CONFIG`, else use defaults.
    pub(crate) fn load() -> Result<Self> {
        let path = env::args_os()
            .nth(1)
            .map(PathBuf::from)
            .or_else(|| env::var_os(CONFIG_ENV).map(PathBuf::from));
        let mut settings = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        if let Ok(base_url) = env::var(BASE_URL_ENV) {
            settings.http.base_url = base_url;
        }
        Ok(settings)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    fn parse(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub(crate) fn log_path(&self) -> PathBuf {
        env::var_os(LOG_ENV)
            .map(PathBuf::from)
            .or_else(|| self.log_file.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE))
    }
}
