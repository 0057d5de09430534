//! Оркестрация установки: pending -> installing -> installed/error
//!
//! Запуск установки атомарно переводит запись в installing и сразу возвращает
//! управление. Удалённая работа идёт в фоновой задаче, а её результат виден
//! только через статус и журнал установки в хранилище.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    bash_script::{self, ScriptInputs, ZabbixSecrets},
    config::{AppConfig, DNS_CHECK_EXIT_CODE},
    firewall::{self, FirewallPolicy},
    models::{InstallStatus, ManagedServer, ServerRole},
    security::AuditTrail,
    ssh::{self, ExecOutput, RemoteExecutor, SshError, SshTarget},
    store::{ServerStore, StoreError},
    utils::timestamp,
    vault::Vault,
};

/// Параметры, общие для всех операций с удалёнными хостами
#[derive(Debug, Clone)]
pub struct InstallSettings {
    pub agent_api_url: String,
    pub install_timeout: Duration,
    pub command_timeout: Duration,
}

impl InstallSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            agent_api_url: config.agent_api_url(),
            install_timeout: Duration::from_secs(config.install_timeout_secs),
            command_timeout: Duration::from_secs(config.command_timeout_secs),
        }
    }
}

#[derive(Clone)]
pub struct Installer {
    store: Arc<ServerStore>,
    vault: Arc<Vault>,
    executor: Arc<dyn RemoteExecutor>,
    audit: AuditTrail,
    settings: Arc<InstallSettings>,
}

/// Расшифровывает секреты записи и собирает скрипт установки
pub fn render_install_script(
    server: &ManagedServer,
    vault: &Vault,
    agent_api_url: &str,
) -> Result<String> {
    let token = vault
        .decrypt(&server.agent.token)
        .context("Не удалось расшифровать токен агента")?;
    let zabbix = match server.zabbix_policy() {
        Some(policy) => Some(ZabbixSecrets {
            db_password: vault
                .decrypt(&policy.db_password)
                .context("Не удалось расшифровать пароль базы Zabbix")?,
            db_root_password: vault
                .decrypt(&policy.db_root_password)
                .context("Не удалось расшифровать пароль root MariaDB")?,
        }),
        None => None,
    };

    let script = bash_script::generate_install_script(&ScriptInputs {
        server,
        agent_token: &token,
        agent_api_url,
        zabbix,
    })?;
    Ok(script)
}

/// Команда обновления nftables по сохранённой политике DNS-сервера
pub fn firewall_update_for(server: &ManagedServer) -> Result<String> {
    let policy = server.dns_policy().ok_or_else(|| {
        anyhow::anyhow!(
            "Правила nftables управляются только для DNS серверов, {} имеет роль {}",
            server.name,
            server.role()
        )
    })?;
    let rules = firewall::compile(&FirewallPolicy::from_dns(server.ssh.port, policy));
    Ok(bash_script::firewall_update_command(&rules)?)
}

/// Статус и фрагмент журнала по результату выполнения скрипта
fn classify(role: ServerRole, result: &Result<ExecOutput>) -> (InstallStatus, String) {
    match result {
        Ok(out) if out.success() => (
            InstallStatus::Installed,
            format!(
                "{}\n[{}] Установка успешно завершена (код 0)",
                out.output.trim_end(),
                timestamp()
            ),
        ),
        Ok(out) if role == ServerRole::Dns && out.exit_code == DNS_CHECK_EXIT_CODE => (
            InstallStatus::DnsError,
            format!(
                "{}\n[{}] ОШИБКА: пакеты установлены, но Unbound не прошёл проверку (код {})",
                out.output.trim_end(),
                timestamp(),
                out.exit_code
            ),
        ),
        Ok(out) => (
            InstallStatus::Error,
            format!(
                "{}\n[{}] ОШИБКА: скрипт установки завершился с кодом {}",
                out.output.trim_end(),
                timestamp(),
                out.exit_code
            ),
        ),
        Err(e) => {
            let kind = match e.downcast_ref::<SshError>() {
                Some(ssh) if ssh.is_transport() => "ОШИБКА SSH",
                _ => "ОШИБКА",
            };
            (
                InstallStatus::Error,
                format!("[{}] {}: {:#}", timestamp(), kind, e),
            )
        }
    }
}

impl Installer {
    pub fn new(
        store: Arc<ServerStore>,
        vault: Arc<Vault>,
        executor: Arc<dyn RemoteExecutor>,
        audit: AuditTrail,
        settings: InstallSettings,
    ) -> Self {
        Self {
            store,
            vault,
            executor,
            audit,
            settings: Arc::new(settings),
        }
    }

    pub fn store(&self) -> &Arc<ServerStore> {
        &self.store
    }

    pub fn vault(&self) -> &Arc<Vault> {
        &self.vault
    }

    /// Запускает установку в фоне.
    ///
    /// Статус installing сохраняется до начала удалённой работы; если запись не в
    /// pending/error, возвращается `InvalidTransition` и ничего не запускается.
    pub async fn start_install(&self, id: Uuid) -> Result<JoinHandle<InstallStatus>, StoreError> {
        let server = match self.store.begin_install(id).await {
            Ok(server) => server,
            Err(e) => {
                self.audit
                    .record_quietly("install", Some(id), "rejected", Some(&e.to_string()))
                    .await;
                return Err(e);
            }
        };

        let header = format!(
            "[{}] Начало установки роли {} на {}:{}",
            timestamp(),
            server.role(),
            server.ipv4,
            server.ssh.port
        );
        if let Err(e) = self.store.append_log(id, &header).await {
            error!("Не удалось записать журнал установки {}: {}", id, e);
        }
        self.audit
            .record_quietly("install", Some(id), "started", None)
            .await;
        info!("Установка {} ({}) запущена", server.name, id);

        let installer = self.clone();
        Ok(tokio::spawn(async move { installer.run_install(server).await }))
    }

    async fn execute(&self, server: &ManagedServer) -> Result<ExecOutput> {
        let script = render_install_script(server, &self.vault, &self.settings.agent_api_url)
            .context("Ошибка генерации скрипта установки")?;
        let target = SshTarget::for_server(server, &self.vault)
            .context("Не удалось расшифровать SSH пароль")?;

        let executor = Arc::clone(&self.executor);
        let timeout = self.settings.install_timeout;
        let output = ssh::run_blocking(timeout, move || {
            executor.run_script(&target, &script, timeout)
        })
        .await?;
        Ok(output)
    }

    async fn run_install(self, server: ManagedServer) -> InstallStatus {
        let result = self.execute(&server).await;
        let (status, chunk) = classify(server.role(), &result);

        match status {
            InstallStatus::Installed => info!("Сервер {} установлен", server.name),
            _ => warn!("Установка {} завершилась со статусом {}", server.name, status),
        }

        if let Err(e) = self.store.finish_install(server.id, status, &chunk).await {
            error!(
                "Не удалось сохранить результат установки {}: {}",
                server.id, e
            );
        }
        self.audit
            .record_quietly("install", Some(server.id), &status.to_string(), None)
            .await;
        status
    }

    /// Повторно устанавливает агента с тем же токеном.
    /// Вывод дописывается в журнал установки
    pub async fn reinstall_agent(&self, id: Uuid) -> Result<ExecOutput> {
        let server = self.store.get(id).await?;
        if server.status == InstallStatus::Installing {
            anyhow::bail!("Сервер {} сейчас устанавливается", server.name);
        }

        let token = self
            .vault
            .decrypt(&server.agent.token)
            .context("Не удалось расшифровать токен агента")?;
        let script = bash_script::generate_agent_bootstrap(&ScriptInputs {
            server: &server,
            agent_token: &token,
            agent_api_url: &self.settings.agent_api_url,
            zabbix: None,
        })?;
        let target = SshTarget::for_server(&server, &self.vault)
            .context("Не удалось расшифровать SSH пароль")?;

        let executor = Arc::clone(&self.executor);
        let timeout = self.settings.command_timeout;
        let result = ssh::run_blocking(timeout, move || {
            executor.run_script(&target, &script, timeout)
        })
        .await;

        let chunk = match &result {
            Ok(out) => format!(
                "[{}] Переустановка агента\n{}\n[{}] Переустановка агента завершилась с кодом {}",
                timestamp(),
                out.output.trim_end(),
                timestamp(),
                out.exit_code
            ),
            Err(e) => format!("[{}] ОШИБКА переустановки агента: {}", timestamp(), e),
        };
        self.store.append_log(id, &chunk).await?;

        let output = result?;
        let status = if output.success() { "done" } else { "error" };
        self.audit
            .record_quietly("reinstall_agent", Some(id), status, None)
            .await;
        if !output.success() {
            anyhow::bail!(
                "Скрипт агента завершился с кодом {}",
                output.exit_code
            );
        }
        Ok(output)
    }

    /// Обновляет nftables напрямую по SSH
    pub async fn push_firewall_ssh(&self, id: Uuid) -> Result<ExecOutput> {
        let server = self.store.get(id).await?;
        let command = firewall_update_for(&server)?;
        let result = self.run_adhoc(&server, command).await;

        let status = if result.is_ok() { "done" } else { "error" };
        self.audit
            .record_quietly("update_firewall", Some(id), status, Some("ssh"))
            .await;
        result
    }

    /// Произвольная команда по SSH на установленном хосте
    pub async fn exec_adhoc(&self, id: Uuid, command: &str) -> Result<ExecOutput> {
        let server = self.store.get(id).await?;
        let result = self.run_adhoc(&server, command.to_string()).await;

        let status = if result.is_ok() { "done" } else { "error" };
        let details = format!("{} байт", command.len());
        self.audit
            .record_quietly("exec", Some(id), status, Some(&details))
            .await;
        result
    }

    async fn run_adhoc(&self, server: &ManagedServer, command: String) -> Result<ExecOutput> {
        let target = SshTarget::for_server(server, &self.vault)
            .context("Не удалось расшифровать SSH пароль")?;
        let output = ssh::run_command_async(
            Arc::clone(&self.executor),
            target,
            command,
            self.settings.command_timeout,
        )
        .await
        .with_context(|| format!("Команда на {} не выполнена", server.name))?;
        Ok(output)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        models::tests::{dns_definition, test_vault, zabbix_definition},
        models::{RolePolicy, ServerDefinition},
    };
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    #[derive(Debug, Clone)]
    pub(crate) enum Behavior {
        Exit(i32, &'static str),
        AuthRejected,
    }

    /// Исполнитель без сети: запоминает вызовы и возвращает заданный результат
    pub(crate) struct FakeExecutor {
        behavior: Behavior,
        delay: Duration,
        pub(crate) calls: AtomicUsize,
        pub(crate) last_payload: Mutex<Option<String>>,
    }

    impl FakeExecutor {
        pub(crate) fn new(behavior: Behavior) -> Self {
            Self {
                behavior,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                last_payload: Mutex::new(None),
            }
        }

        pub(crate) fn slow(behavior: Behavior, delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new(behavior)
            }
        }

        fn respond(&self, payload: &str) -> Result<ExecOutput, SshError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_payload.lock().unwrap() = Some(payload.to_string());
            std::thread::sleep(self.delay);
            match &self.behavior {
                Behavior::Exit(code, output) => Ok(ExecOutput {
                    output: output.to_string(),
                    exit_code: *code,
                }),
                Behavior::AuthRejected => Err(SshError::Auth("root".to_string())),
            }
        }
    }

    impl RemoteExecutor for FakeExecutor {
        fn run_script(&self, _: &SshTarget, script: &str, _: Duration) -> Result<ExecOutput, SshError> {
            self.respond(script)
        }

        fn run_command(
            &self,
            _: &SshTarget,
            command: &str,
            _: Duration,
        ) -> Result<ExecOutput, SshError> {
            let out = self.respond(command)?;
            if !out.success() {
                return Err(SshError::CommandFailed {
                    code: out.exit_code,
                    output: out.output,
                });
            }
            Ok(out)
        }
    }

    pub(crate) fn settings() -> InstallSettings {
        InstallSettings {
            agent_api_url: "https://noc.example.net/api/agent".to_string(),
            install_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(5),
        }
    }

    pub(crate) async fn installer_with(
        def: ServerDefinition,
        executor: Arc<FakeExecutor>,
    ) -> (Installer, Uuid) {
        let vault = test_vault();
        let (server, _) = def.into_record(&vault).unwrap();
        let id = server.id;
        let store = Arc::new(ServerStore::in_memory());
        store.insert(server).await.unwrap();
        let installer = Installer::new(
            store,
            Arc::new(vault),
            executor,
            AuditTrail::disabled(),
            settings(),
        );
        (installer, id)
    }

    #[tokio::test]
    async fn installing_is_visible_before_remote_work_finishes() {
        let fake = Arc::new(FakeExecutor::slow(
            Behavior::Exit(0, "[noc] INSTALL COMPLETE"),
            Duration::from_millis(300),
        ));
        let (installer, id) = installer_with(dns_definition(), fake.clone()).await;

        let handle = installer.start_install(id).await.unwrap();
        let server = installer.store().get(id).await.unwrap();
        assert_eq!(server.status, InstallStatus::Installing);

        assert_eq!(handle.await.unwrap(), InstallStatus::Installed);
        let server = installer.store().get(id).await.unwrap();
        assert_eq!(server.status, InstallStatus::Installed);
        assert!(server.installation_log.contains("[noc] INSTALL COMPLETE"));
        assert!(server.installation_log.contains("Установка успешно завершена"));
    }

    #[tokio::test]
    async fn script_failure_ends_in_error_with_output() {
        let fake = Arc::new(FakeExecutor::new(Behavior::Exit(
            100,
            "E: Unable to locate package unbound",
        )));
        let (installer, id) = installer_with(dns_definition(), fake).await;

        let status = installer.start_install(id).await.unwrap().await.unwrap();
        assert_eq!(status, InstallStatus::Error);

        let log = installer.store().get(id).await.unwrap().installation_log;
        assert!(log.contains("E: Unable to locate package unbound"));
        assert!(log.contains("завершился с кодом 100"));
    }

    #[tokio::test]
    async fn transport_failure_is_logged() {
        let fake = Arc::new(FakeExecutor::new(Behavior::AuthRejected));
        let (installer, id) = installer_with(zabbix_definition(), fake).await;

        let status = installer.start_install(id).await.unwrap().await.unwrap();
        assert_eq!(status, InstallStatus::Error);
        let log = installer.store().get(id).await.unwrap().installation_log;
        assert!(log.contains("ОШИБКА"));
        assert!(log.contains("аутентификацию"));
    }

    #[tokio::test]
    async fn resolver_self_check_failure_is_dns_error() {
        let fake = Arc::new(FakeExecutor::new(Behavior::Exit(
            DNS_CHECK_EXIT_CODE,
            "[noc] ERROR: Unbound не отвечает",
        )));
        let (installer, id) = installer_with(dns_definition(), fake).await;

        let status = installer.start_install(id).await.unwrap().await.unwrap();
        assert_eq!(status, InstallStatus::DnsError);

        // Повторная установка разрешена
        assert!(installer.start_install(id).await.is_ok());
    }

    #[tokio::test]
    async fn same_exit_code_on_zabbix_is_plain_error() {
        let fake = Arc::new(FakeExecutor::new(Behavior::Exit(DNS_CHECK_EXIT_CODE, "x")));
        let (installer, id) = installer_with(zabbix_definition(), fake).await;
        let status = installer.start_install(id).await.unwrap().await.unwrap();
        assert_eq!(status, InstallStatus::Error);
    }

    #[tokio::test]
    async fn generation_failure_never_reaches_ssh() {
        let fake = Arc::new(FakeExecutor::new(Behavior::Exit(0, "")));
        let (installer, id) = installer_with(zabbix_definition(), fake.clone()).await;
        installer
            .store()
            .update(id, |server| {
                if let RolePolicy::Zabbix(policy) = &mut server.policy {
                    policy.db_password = "00:00".to_string();
                }
                Ok::<_, StoreError>(())
            })
            .await
            .unwrap();

        let status = installer.start_install(id).await.unwrap().await.unwrap();
        assert_eq!(status, InstallStatus::Error);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
        let log = installer.store().get(id).await.unwrap().installation_log;
        assert!(log.contains("Ошибка генерации скрипта установки"));
    }

    #[tokio::test]
    async fn concurrent_triggers_run_once() {
        let fake = Arc::new(FakeExecutor::slow(
            Behavior::Exit(0, "ok"),
            Duration::from_millis(100),
        ));
        let (installer, id) = installer_with(dns_definition(), fake.clone()).await;

        let (a, b) = tokio::join!(installer.start_install(id), installer.start_install(id));
        let handles: Vec<_> = [a, b].into_iter().filter_map(|r| r.ok()).collect();
        assert_eq!(handles.len(), 1);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
        let log = installer.store().get(id).await.unwrap().installation_log;
        assert_eq!(log.matches("Начало установки").count(), 1);
    }

    #[tokio::test]
    async fn retry_after_error_keeps_history() {
        let fake = Arc::new(FakeExecutor::new(Behavior::Exit(1, "first failure")));
        let (installer, id) = installer_with(dns_definition(), fake).await;
        installer.start_install(id).await.unwrap().await.unwrap();
        installer.start_install(id).await.unwrap().await.unwrap();

        let log = installer.store().get(id).await.unwrap().installation_log;
        assert_eq!(log.matches("first failure").count(), 2);
        assert_eq!(log.matches("Начало установки").count(), 2);
    }

    #[tokio::test]
    async fn firewall_push_sends_compiled_rules() {
        let fake = Arc::new(FakeExecutor::new(Behavior::Exit(0, "nftables: правила обновлены")));
        let (installer, id) = installer_with(dns_definition(), fake.clone()).await;

        installer.push_firewall_ssh(id).await.unwrap();
        let payload = fake.last_payload.lock().unwrap().clone().unwrap();
        assert!(payload.contains("ip saddr 203.0.113.5 tcp dport { 22, 2222 } accept"));
        assert!(payload.contains("nft -c -f"));
    }

    #[tokio::test]
    async fn firewall_push_refused_for_zabbix() {
        let fake = Arc::new(FakeExecutor::new(Behavior::Exit(0, "")));
        let (installer, id) = installer_with(zabbix_definition(), fake.clone()).await;
        assert!(installer.push_firewall_ssh(id).await.is_err());
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn adhoc_non_zero_exit_is_an_error() {
        let fake = Arc::new(FakeExecutor::new(Behavior::Exit(2, "no such file")));
        let (installer, id) = installer_with(dns_definition(), fake).await;
        let err = installer.exec_adhoc(id, "cat /nope").await.unwrap_err();
        assert!(format!("{err:#}").contains("кодом 2"));
    }

    #[tokio::test]
    async fn reinstall_agent_appends_to_log() {
        let fake = Arc::new(FakeExecutor::new(Behavior::Exit(0, "agent restarted")));
        let (installer, id) = installer_with(dns_definition(), fake.clone()).await;

        installer.reinstall_agent(id).await.unwrap();
        let log = installer.store().get(id).await.unwrap().installation_log;
        assert!(log.contains("agent restarted"));

        let token = installer
            .vault()
            .decrypt(&installer.store().get(id).await.unwrap().agent.token)
            .unwrap();
        let payload = fake.last_payload.lock().unwrap().clone().unwrap();
        assert!(payload.contains(&format!("export AGENT_TOKEN='{token}'")));
    }
}
