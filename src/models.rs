use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
    path::Path,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    security,
    utils::{self, AddrFamily},
    vault::Vault,
};

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const MAX_LOOPBACKS_PER_FAMILY: usize = 2;
const GENERATED_PASSWORD_LEN: usize = 20;

static USERNAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("valid username regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerRole {
    Dns,
    Zabbix,
}

impl ServerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerRole::Dns => "dns",
            ServerRole::Zabbix => "zabbix",
        }
    }
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Состояние установки
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStatus {
    Pending,
    Installing,
    Installed,
    Error,
    /// Только для DNS: пакеты установлены, но резолвер не прошёл самопроверку
    DnsError,
}

impl InstallStatus {
    /// Из каких состояний оператор может запустить установку
    pub fn can_start_install(&self) -> bool {
        matches!(
            self,
            InstallStatus::Pending | InstallStatus::Error | InstallStatus::DnsError
        )
    }
}

impl fmt::Display for InstallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            InstallStatus::Pending => "pending",
            InstallStatus::Installing => "installing",
            InstallStatus::Installed => "installed",
            InstallStatus::Error => "error",
            InstallStatus::DnsError => "dns_error",
        };
        f.pad(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Running,
    Done,
    Error,
}

impl CommandStatus {
    /// Команда ещё не получила результат от агента
    pub fn is_outstanding(&self) -> bool {
        matches!(self, CommandStatus::Pending | CommandStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshCredentials {
    pub username: String,
    pub port: u16,
    /// Зашифрованный пароль (`iv:ciphertext`)
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsPolicy {
    pub ssh_allow: Vec<String>,
    pub dns_allow_v4: Vec<String>,
    pub dns_allow_v6: Vec<String>,
    pub loopback_v4: Vec<Ipv4Addr>,
    pub loopback_v6: Vec<Ipv6Addr>,
}

impl DnsPolicy {
    pub fn has_loopbacks(&self) -> bool {
        !self.loopback_v4.is_empty() || !self.loopback_v6.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZabbixPolicy {
    pub db_user: String,
    /// Зашифрованный пароль пользователя БД
    pub db_password: String,
    /// Зашифрованный пароль root MariaDB
    pub db_root_password: String,
    pub install_grafana: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum RolePolicy {
    Dns(DnsPolicy),
    Zabbix(ZabbixPolicy),
}

/// Состояние канала агента
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentChannel {
    /// Зашифрованный токен агента; создается один раз вместе с записью
    pub token: String,
    pub pending_command: Option<String>,
    /// Идентификатор текущей команды; агент возвращает его вместе с результатом
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<Uuid>,
    pub command_status: Option<CommandStatus>,
    pub command_output: Option<String>,
    pub last_agent_check: Option<DateTime<Utc>>,
}

impl AgentChannel {
    pub fn has_outstanding_command(&self) -> bool {
        self.command_status.map_or(false, |s| s.is_outstanding())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedServer {
    pub id: Uuid,
    pub name: String,
    pub client: Option<String>,
    pub ipv4: Ipv4Addr,
    pub ipv6: Option<Ipv6Addr>,
    pub ssh: SshCredentials,
    pub policy: RolePolicy,
    pub status: InstallStatus,
    /// pid процесса, выполняющего установку (пока статус installing)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_pid: Option<u32>,
    pub installation_log: String,
    pub agent: AgentChannel,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ManagedServer {
    pub fn role(&self) -> ServerRole {
        match self.policy {
            RolePolicy::Dns(_) => ServerRole::Dns,
            RolePolicy::Zabbix(_) => ServerRole::Zabbix,
        }
    }

    pub fn dns_policy(&self) -> Option<&DnsPolicy> {
        match &self.policy {
            RolePolicy::Dns(policy) => Some(policy),
            RolePolicy::Zabbix(_) => None,
        }
    }

    pub fn zabbix_policy(&self) -> Option<&ZabbixPolicy> {
        match &self.policy {
            RolePolicy::Zabbix(policy) => Some(policy),
            RolePolicy::Dns(_) => None,
        }
    }

    /// Все зашифрованные поля записи: (название, значение)
    pub fn secret_fields(&self) -> Vec<(&'static str, &str)> {
        let mut fields = vec![
            ("ssh.password", self.ssh.password.as_str()),
            ("agent.token", self.agent.token.as_str()),
        ];
        if let RolePolicy::Zabbix(policy) = &self.policy {
            fields.push(("zabbix.db_password", policy.db_password.as_str()));
            fields.push(("zabbix.db_root_password", policy.db_root_password.as_str()));
        }
        fields
    }

    /// Дописывает фрагмент в журнал установки. Журнал никогда не обрезается
    pub fn append_log(&mut self, chunk: &str) {
        if !self.installation_log.is_empty() && !self.installation_log.ends_with('\n') {
            self.installation_log.push('\n');
        }
        self.installation_log.push_str(chunk);
        if !chunk.ends_with('\n') {
            self.installation_log.push('\n');
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    Active,
    Passive,
}

/// Zabbix-прокси, принадлежащий серверу Zabbix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proxy {
    pub id: Uuid,
    pub server_id: Uuid,
    pub name: String,
    pub address: String,
    pub mode: ProxyMode,
    pub created_at: DateTime<Utc>,
}

impl Proxy {
    pub fn new(server_id: Uuid, name: &str, address: &str, mode: ProxyMode) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Err(anyhow::anyhow!("Имя прокси не может быть пустым"));
        }
        if utils::parse_source(address).is_none() || address.contains('/') {
            return Err(anyhow::anyhow!("Некорректный адрес прокси: {}", address));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            server_id,
            name: name.to_string(),
            address: address.trim().to_string(),
            mode,
            created_at: Utc::now(),
        })
    }
}

/// Описание сервера, которое оператор передает в TOML файле
#[derive(Debug, Clone, Deserialize)]
pub struct ServerDefinition {
    pub role: ServerRole,
    pub name: String,
    #[serde(default)]
    pub client: Option<String>,
    pub ipv4: String,
    #[serde(default)]
    pub ipv6: Option<String>,
    pub ssh_user: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    pub ssh_password: String,
    #[serde(default)]
    pub dns: DnsDefinition,
    #[serde(default)]
    pub zabbix: ZabbixDefinition,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DnsDefinition {
    pub ssh_allow: Vec<String>,
    pub dns_allow_v4: Vec<String>,
    pub dns_allow_v6: Vec<String>,
    pub loopback_v4: Vec<String>,
    pub loopback_v6: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ZabbixDefinition {
    pub db_user: String,
    pub db_password: String,
    pub db_root_password: String,
    pub install_grafana: bool,
}

impl Default for ZabbixDefinition {
    fn default() -> Self {
        Self {
            db_user: "zabbix".to_string(),
            db_password: String::new(),
            db_root_password: String::new(),
            install_grafana: false,
        }
    }
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

/// Пароли, сгенерированные при создании записи; показываются оператору один раз
#[derive(Debug, Default)]
pub struct GeneratedSecrets {
    pub db_password: Option<String>,
    pub db_root_password: Option<String>,
}

impl ServerDefinition {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Не удалось прочитать описание сервера: {:?}", path))?;
        toml::from_str(&contents)
            .with_context(|| format!("Не удалось разобрать описание сервера: {:?}", path))
    }

    /// Проверяет описание и создает запись со статусом pending и новым токеном агента
    pub fn into_record(self, vault: &Vault) -> Result<(ManagedServer, GeneratedSecrets)> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(anyhow::anyhow!("Имя сервера не может быть пустым"));
        }

        let ipv4 = utils::parse_ipv4(&self.ipv4)
            .ok_or_else(|| anyhow::anyhow!("Некорректный IPv4 адрес: {}", self.ipv4))?;
        let ipv6 = match self.ipv6.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            Some(value) => Some(
                utils::parse_ipv6(value)
                    .ok_or_else(|| anyhow::anyhow!("Некорректный IPv6 адрес: {}", value))?,
            ),
            None => None,
        };

        validate_username(&self.ssh_user)?;
        if self.ssh_port == 0 {
            return Err(anyhow::anyhow!("SSH порт не может быть равен 0"));
        }
        if self.ssh_password.is_empty() {
            return Err(anyhow::anyhow!("SSH пароль обязателен"));
        }

        let mut generated = GeneratedSecrets::default();
        let policy = match self.role {
            ServerRole::Dns => RolePolicy::Dns(self.dns.validate()?),
            ServerRole::Zabbix => {
                validate_username(&self.zabbix.db_user)?;
                let db_password = or_generate(&self.zabbix.db_password, &mut generated.db_password)?;
                let root_password =
                    or_generate(&self.zabbix.db_root_password, &mut generated.db_root_password)?;
                RolePolicy::Zabbix(ZabbixPolicy {
                    db_user: self.zabbix.db_user.clone(),
                    db_password: vault.encrypt(&db_password)?,
                    db_root_password: vault.encrypt(&root_password)?,
                    install_grafana: self.zabbix.install_grafana,
                })
            }
        };

        let now = Utc::now();
        let server = ManagedServer {
            id: Uuid::new_v4(),
            name,
            client: self
                .client
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty()),
            ipv4,
            ipv6,
            ssh: SshCredentials {
                username: self.ssh_user,
                port: self.ssh_port,
                password: vault.encrypt(&self.ssh_password)?,
            },
            policy,
            status: InstallStatus::Pending,
            install_pid: None,
            installation_log: String::new(),
            agent: AgentChannel {
                token: vault.encrypt(&security::generate_agent_token())?,
                ..AgentChannel::default()
            },
            created_at: now,
            updated_at: now,
        };

        Ok((server, generated))
    }
}

impl DnsDefinition {
    fn validate(&self) -> Result<DnsPolicy> {
        let ssh_allow = clean_sources(&self.ssh_allow, None, "ssh_allow")?;
        let dns_allow_v4 = clean_sources(&self.dns_allow_v4, Some(AddrFamily::V4), "dns_allow_v4")?;
        let dns_allow_v6 = clean_sources(&self.dns_allow_v6, Some(AddrFamily::V6), "dns_allow_v6")?;

        if self.loopback_v4.len() > MAX_LOOPBACKS_PER_FAMILY
            || self.loopback_v6.len() > MAX_LOOPBACKS_PER_FAMILY
        {
            return Err(anyhow::anyhow!(
                "Допускается не более {} loopback адресов каждого семейства",
                MAX_LOOPBACKS_PER_FAMILY
            ));
        }

        let loopback_v4 = self
            .loopback_v4
            .iter()
            .map(|v| {
                utils::parse_ipv4(v)
                    .ok_or_else(|| anyhow::anyhow!("Некорректный IPv4 loopback: {}", v))
            })
            .collect::<Result<Vec<_>>>()?;
        let loopback_v6 = self
            .loopback_v6
            .iter()
            .map(|v| {
                utils::parse_ipv6(v)
                    .ok_or_else(|| anyhow::anyhow!("Некорректный IPv6 loopback: {}", v))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(DnsPolicy {
            ssh_allow,
            dns_allow_v4,
            dns_allow_v6,
            loopback_v4,
            loopback_v6,
        })
    }
}

fn clean_sources(
    entries: &[String],
    family: Option<AddrFamily>,
    field: &str,
) -> Result<Vec<String>> {
    let mut cleaned = Vec::new();
    for entry in entries.iter().map(|e| e.trim()).filter(|e| !e.is_empty()) {
        match utils::parse_source(entry) {
            Some(found) if family.map_or(true, |f| f == found) => cleaned.push(entry.to_string()),
            _ => {
                return Err(anyhow::anyhow!(
                    "Некорректная запись в {}: {}",
                    field,
                    entry
                ))
            }
        }
    }
    Ok(cleaned)
}

fn validate_username(username: &str) -> Result<()> {
    if !USERNAME_RE.is_match(username) {
        return Err(anyhow::anyhow!("Некорректное имя пользователя: {}", username));
    }
    Ok(())
}

fn or_generate(value: &str, generated: &mut Option<String>) -> Result<String> {
    if value.is_empty() {
        let password = security::generate_strong_password(GENERATED_PASSWORD_LEN)?;
        *generated = Some(password.clone());
        return Ok(password);
    }
    if let Err(e) = security::check_password_strength(value) {
        warn!("Слабый пароль базы данных: {}", e);
    }
    Ok(value.to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_vault() -> Vault {
        Vault::new([42u8; 32])
    }

    pub(crate) fn dns_definition() -> ServerDefinition {
        toml::from_str(
            r#"
            role = "dns"
            name = "resolver-1"
            client = "ACME ISP"
            ipv4 = "192.0.2.10"
            ipv6 = "2001:db8::10"
            ssh_user = "root"
            ssh_port = 2222
            ssh_password = "s3cret'pass"

            [dns]
            ssh_allow = ["203.0.113.5"]
            dns_allow_v4 = ["198.51.100.0/24"]
            dns_allow_v6 = ["2001:db8:100::/48"]
            loopback_v4 = ["192.0.2.53"]
            loopback_v6 = ["2001:db8:53::53"]
            "#,
        )
        .unwrap()
    }

    pub(crate) fn zabbix_definition() -> ServerDefinition {
        toml::from_str(
            r#"
            role = "zabbix"
            name = "monitoring"
            ipv4 = "192.0.2.20"
            ssh_user = "admin"
            ssh_password = "Passw0rd"

            [zabbix]
            db_user = "zabbix"
            db_password = "Db'Passw0rd"
            install_grafana = true
            "#,
        )
        .unwrap()
    }

    #[test]
    fn dns_record_is_pending_with_encrypted_secrets() {
        let vault = test_vault();
        let (server, generated) = dns_definition().into_record(&vault).unwrap();

        assert_eq!(server.status, InstallStatus::Pending);
        assert_eq!(server.role(), ServerRole::Dns);
        assert_eq!(server.ssh.port, 2222);
        assert!(generated.db_password.is_none());

        assert_eq!(vault.decrypt(&server.ssh.password).unwrap(), "s3cret'pass");
        let token = vault.decrypt(&server.agent.token).unwrap();
        assert_eq!(token.len(), 64);
        assert!(server.agent.pending_command.is_none());

        let policy = server.dns_policy().unwrap();
        assert_eq!(policy.ssh_allow, vec!["203.0.113.5"]);
        assert_eq!(policy.loopback_v4, vec!["192.0.2.53".parse::<Ipv4Addr>().unwrap()]);
    }

    #[test]
    fn zabbix_missing_root_password_is_generated() {
        let vault = test_vault();
        let (server, generated) = zabbix_definition().into_record(&vault).unwrap();

        let root = generated.db_root_password.expect("root password generated");
        let policy = server.zabbix_policy().unwrap();
        assert_eq!(vault.decrypt(&policy.db_root_password).unwrap(), root);
        assert_eq!(vault.decrypt(&policy.db_password).unwrap(), "Db'Passw0rd");
        assert!(generated.db_password.is_none());
    }

    #[test]
    fn wrong_family_in_dns_list_is_rejected() {
        let mut def = dns_definition();
        def.dns.dns_allow_v4 = vec!["2001:db8::/32".to_string()];
        assert!(def.into_record(&test_vault()).is_err());
    }

    #[test]
    fn too_many_loopbacks_are_rejected() {
        let mut def = dns_definition();
        def.dns.loopback_v4 = vec!["10.0.0.1".into(), "10.0.0.2".into(), "10.0.0.3".into()];
        assert!(def.into_record(&test_vault()).is_err());
    }

    #[test]
    fn invalid_ssh_user_is_rejected() {
        let mut def = dns_definition();
        def.ssh_user = "root; reboot".to_string();
        assert!(def.into_record(&test_vault()).is_err());
    }

    #[test]
    fn log_appends_keep_history() {
        let (mut server, _) = dns_definition().into_record(&test_vault()).unwrap();
        server.append_log("first attempt");
        server.append_log("second attempt\n");
        assert_eq!(server.installation_log, "first attempt\nsecond attempt\n");
    }

    #[test]
    fn proxy_requires_plain_address() {
        let id = Uuid::new_v4();
        assert!(Proxy::new(id, "proxy-1", "192.0.2.30", ProxyMode::Active).is_ok());
        assert!(Proxy::new(id, "proxy-1", "192.0.2.0/24", ProxyMode::Active).is_err());
        assert!(Proxy::new(id, " ", "192.0.2.30", ProxyMode::Passive).is_err());
    }
}
