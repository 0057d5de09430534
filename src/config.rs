use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Константы путей и параметров
pub const DEFAULT_CONFIG_PATH: &str = "/etc/noc-provisioner/config.toml";
pub const DEFAULT_DATA_DIR: &str = "/var/lib/noc-provisioner";
pub const SERVERS_FILE: &str = "servers.json";
pub const AUDIT_FILE: &str = "audit.jsonl";

// Пути на удалённом хосте
pub const REMOTE_SCRIPT_PATH: &str = "/tmp/noc-install.sh";
pub const AGENT_SCRIPT_PATH: &str = "/usr/local/bin/noc-agent.sh";
pub const AGENT_UNIT_NAME: &str = "noc-agent.service";
pub const NFTABLES_CONF_PATH: &str = "/etc/nftables.conf";

pub const AGENT_POLL_INTERVAL_SECS: u64 = 30;
pub const ZABBIX_AGENT_PORT: u16 = 10050;
pub const SUPPORTED_OS_ID: &str = "debian";
pub const SUPPORTED_OS_VERSION: &str = "12";

/// Код выхода скрипта DNS, если резолвер установлен, но не отвечает на запросы
pub const DNS_CHECK_EXIT_CODE: i32 = 42;

// Переменные окружения
pub const ENV_VAULT_KEY: &str = "NOC_VAULT_KEY";
pub const ENV_CONTROL_URL: &str = "NOC_CONTROL_URL";
pub const ENV_DATA_DIR: &str = "NOC_DATA_DIR";
pub const ENV_LISTEN: &str = "NOC_LISTEN";
pub const ENV_MODE: &str = "NOC_ENV";
pub const ENV_LOG_LEVEL: &str = "NOC_LOG_LEVEL";
pub const ENV_OPERATOR_TOKEN: &str = "NOC_OPERATOR_TOKEN";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Некорректный адрес панели управления: {0}")]
    InvalidControlUrl(String),
    #[error("Неизвестный режим работы: {0}")]
    InvalidMode(String),
    #[error("Таймаут {0} должен быть больше нуля")]
    ZeroTimeout(&'static str),
}

/// Режим работы. В production отсутствие ключа хранилища является ошибкой запуска
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Production,
    Development,
}

impl std::str::FromStr for Mode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Mode::Production),
            "development" | "dev" => Ok(Mode::Development),
            other => Err(ConfigError::InvalidMode(other.to_string())),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: String,
    pub mode: Mode,
    pub data_dir: PathBuf,
    /// Адрес, на котором слушает HTTP-сервер для агентов
    pub listen: String,
    /// Базовый URL, по которому агенты обращаются к панели управления
    pub control_url: String,
    /// Ключ хранилища секретов (base64, 32 байта). Лучше задавать через окружение
    #[serde(skip_serializing)]
    pub vault_key: Option<String>,
    /// Bearer токен для операторских HTTP маршрутов; без него они не подключаются
    #[serde(skip_serializing)]
    pub operator_token: Option<String>,
    pub connect_timeout_secs: u64,
    pub install_timeout_secs: u64,
    pub command_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            mode: Mode::Production,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            listen: "0.0.0.0:8080".to_string(),
            control_url: "http://127.0.0.1:8080".to_string(),
            vault_key: None,
            operator_token: None,
            connect_timeout_secs: 20,
            install_timeout_secs: 30 * 60,
            command_timeout_secs: 60,
        }
    }
}

impl AppConfig {
    /// Загружает конфигурацию из TOML файла и переменных окружения
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        // .env необязателен
        let _ = dotenv::dotenv();

        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Не удалось прочитать файл конфигурации: {:?}", path))?;
            toml::from_str::<AppConfig>(&contents).with_context(|| {
                format!("Не удалось разобрать конфигурацию из файла: {:?}", path)
            })?
        } else {
            info!(
                "Конфигурационный файл {:?} не найден, используются значения по умолчанию",
                path
            );
            Self::default()
        };

        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;

        debug!(
            "Конфигурация загружена: режим {:?}, данные в {:?}",
            config.mode, config.data_dir
        );
        Ok(config)
    }

    /// Применяет переопределения из окружения
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup(ENV_VAULT_KEY).filter(|v| !v.trim().is_empty()) {
            self.vault_key = Some(key.trim().to_string());
        }
        if let Some(token) = lookup(ENV_OPERATOR_TOKEN).filter(|v| !v.trim().is_empty()) {
            self.operator_token = Some(token.trim().to_string());
        }
        if let Some(url) = lookup(ENV_CONTROL_URL) {
            self.control_url = url.trim().to_string();
        }
        if let Some(dir) = lookup(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(listen) = lookup(ENV_LISTEN) {
            self.listen = listen;
        }
        if let Some(mode) = lookup(ENV_MODE) {
            self.mode = mode.parse()?;
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.log_level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.control_url.trim_end_matches('/');
        let has_scheme = url.starts_with("http://") || url.starts_with("https://");
        if !has_scheme || url.contains(char::is_whitespace) || url.contains('\'') {
            return Err(ConfigError::InvalidControlUrl(self.control_url.clone()));
        }

        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout("connect_timeout_secs"));
        }
        if self.install_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout("install_timeout_secs"));
        }
        if self.command_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout("command_timeout_secs"));
        }
        Ok(())
    }

    /// Базовый URL агентского API
    pub fn agent_api_url(&self) -> String {
        format!("{}/api/agent", self.control_url.trim_end_matches('/'))
    }

    pub fn servers_path(&self) -> PathBuf {
        self.data_dir.join(SERVERS_FILE)
    }

    pub fn audit_path(&self) -> PathBuf {
        self.data_dir.join(AUDIT_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn environment_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            (ENV_CONTROL_URL, "https://noc.example.net/"),
            (ENV_MODE, "dev"),
            (ENV_VAULT_KEY, "  a2V5  "),
            (ENV_OPERATOR_TOKEN, ""),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.mode, Mode::Development);
        assert_eq!(config.vault_key.as_deref(), Some("a2V5"));
        assert!(config.operator_token.is_none());
        assert_eq!(
            config.agent_api_url(),
            "https://noc.example.net/api/agent"
        );
    }

    #[test]
    fn rejects_unknown_mode() {
        let mut config = AppConfig::default();
        let err = config
            .apply_overrides(|key| (key == ENV_MODE).then(|| "staging".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidMode(_)));
    }

    #[test]
    fn rejects_control_url_without_scheme() {
        let config = AppConfig {
            control_url: "noc.example.net".to_string(),
            ..AppConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidControlUrl(_))
        ));
    }

    #[test]
    fn parses_toml_file() {
        let config: AppConfig = toml::from_str(
            r#"
            mode = "development"
            control_url = "https://cp.example.org"
            install_timeout_secs = 900
            "#,
        )
        .unwrap();

        assert_eq!(config.mode, Mode::Development);
        assert_eq!(config.install_timeout_secs, 900);
        assert_eq!(config.command_timeout_secs, 60);
        assert!(config.validate().is_ok());
    }
}
