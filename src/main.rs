use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use uuid::Uuid;

mod agent;
mod bash_script;
mod config;
mod dns;
mod firewall;
mod http;
mod installer;
mod logger;
mod models;
mod security;
mod ssh;
mod store;
mod utils;
mod vault;
mod zabbix;

use crate::{
    agent::AgentService,
    config::{AppConfig, DEFAULT_CONFIG_PATH},
    firewall::FirewallPolicy,
    installer::{InstallSettings, Installer},
    models::{InstallStatus, Proxy, ProxyMode, ServerDefinition},
    security::AuditTrail,
    ssh::SshExecutor,
    store::{install_owned_here, install_owner_gone, ServerStore},
    vault::Vault,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Путь к файлу конфигурации
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProxyModeArg {
    Active,
    Passive,
}

impl From<ProxyModeArg> for ProxyMode {
    fn from(mode: ProxyModeArg) -> Self {
        match mode {
            ProxyModeArg::Active => ProxyMode::Active,
            ProxyModeArg::Passive => ProxyMode::Passive,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Добавление сервера из TOML описания
    Add { file: PathBuf },
    /// Список серверов
    List,
    /// Состояние сервера (без секретов)
    Show { id: Uuid },
    /// Удаление записи сервера (удалённый хост не затрагивается)
    Delete {
        id: Uuid,
        /// Не спрашивать подтверждение
        #[arg(long)]
        yes: bool,
    },
    /// Установка роли на сервер по SSH
    Install { id: Uuid },
    /// Журнал установки
    Log { id: Uuid },
    /// Вывод скрипта установки без выполнения
    RenderScript {
        id: Uuid,
        /// Файл для сохранения скрипта
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Вывод правил nftables для DNS сервера
    RenderFirewall { id: Uuid },
    /// Постановка команды в очередь агента
    QueueCommand {
        id: Uuid,
        command: String,
        /// Заменить невыполненную команду
        #[arg(long)]
        force: bool,
    },
    /// Повторная установка агента с тем же токеном
    ReinstallAgent { id: Uuid },
    /// Обновление правил nftables через агента или по SSH
    UpdateFirewall {
        id: Uuid,
        /// Выполнить сразу по SSH, а не через агента
        #[arg(long)]
        ssh: bool,
        /// Заменить невыполненную команду агента
        #[arg(long)]
        force: bool,
    },
    /// Выполнение команды по SSH
    Exec { id: Uuid, command: String },
    /// Добавление Zabbix-прокси
    ProxyAdd {
        server_id: Uuid,
        name: String,
        address: String,
        #[arg(long, value_enum, default_value = "active")]
        mode: ProxyModeArg,
    },
    /// Список прокси сервера Zabbix
    ProxyList { server_id: Uuid },
    /// Запуск HTTP API для агентов и оператора
    Serve,
}

/// Общие зависимости команд
struct App {
    config: AppConfig,
    store: Arc<ServerStore>,
    vault: Arc<Vault>,
    audit: AuditTrail,
}

impl App {
    async fn open(config: AppConfig) -> Result<Self> {
        let vault = Vault::from_config(&config).context("Не удалось инициализировать хранилище секретов")?;
        if vault.is_ephemeral() {
            logger::warning(
                "Ключ хранилища не задан: используется временный ключ, секреты станут нечитаемыми после перезапуска",
            );
        }

        let store = ServerStore::open(config.servers_path())
            .await
            .with_context(|| format!("Не удалось открыть хранилище {:?}", config.servers_path()))?;
        let audit = AuditTrail::new(config.audit_path());

        // Установки, чей процесс завершился, иначе навсегда остались бы в installing
        store
            .recover_installs("процесс установки завершился", install_owner_gone)
            .await
            .context("Не удалось восстановить прерванные установки")?;

        Ok(Self {
            config,
            store: Arc::new(store),
            vault: Arc::new(vault),
            audit,
        })
    }

    fn installer(&self) -> Installer {
        Installer::new(
            Arc::clone(&self.store),
            Arc::clone(&self.vault),
            Arc::new(SshExecutor::new(Duration::from_secs(
                self.config.connect_timeout_secs,
            ))),
            self.audit.clone(),
            InstallSettings::from_config(&self.config),
        )
    }

    fn agents(&self) -> AgentService {
        AgentService::new(
            Arc::clone(&self.store),
            Arc::clone(&self.vault),
            self.audit.clone(),
        )
    }
}

fn progress_spinner(msg: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.blue} {elapsed} {msg}")?);
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(120));
    Ok(pb)
}

async fn add_server(app: &App, file: &Path) -> Result<()> {
    let definition = ServerDefinition::from_file(file)?;
    let (server, generated) = definition.into_record(&app.vault)?;
    let id = server.id;
    let name = server.name.clone();

    app.store.insert(server).await?;
    app.audit
        .record_quietly("create", Some(id), "success", Some(&name))
        .await;

    logger::success(&format!("Сервер {} добавлен: {}", name, id));
    if let Some(password) = generated.db_password {
        logger::password_info("Пароль пользователя БД Zabbix", &password);
    }
    if let Some(password) = generated.db_root_password {
        logger::password_info("Пароль root MariaDB", &password);
    }
    Ok(())
}

async fn list_servers(app: &App) -> Result<()> {
    let servers = app.store.list().await?;
    if servers.is_empty() {
        println!("Серверов нет");
        return Ok(());
    }
    for server in servers {
        let last_check = server
            .agent
            .last_agent_check
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<6}  {:<10}  {:<15}  {:<20}  агент: {}",
            server.id,
            server.role(),
            server.status,
            server.ipv4,
            server.name,
            last_check
        );
    }
    Ok(())
}

async fn delete_server(app: &App, id: Uuid, yes: bool) -> Result<()> {
    let server = app.store.get(id).await?;
    if !yes {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Удалить запись сервера {} ({})? Хост и установленные службы не изменятся.",
                server.name, id
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            info!("Удаление отменено");
            return Ok(());
        }
    }

    let (server, proxies) = app.store.delete(id).await?;
    app.audit
        .record_quietly("delete", Some(id), "success", Some(&server.name))
        .await;
    logger::success(&format!(
        "Сервер {} удалён (прокси удалено: {})",
        server.name,
        proxies.len()
    ));
    Ok(())
}

async fn install_server(app: &App, id: Uuid) -> Result<()> {
    let installer = app.installer();
    let handle = installer.start_install(id).await?;

    let pb = progress_spinner("Установка выполняется, это может занять несколько минут...")?;
    let status = tokio::select! {
        status = handle => status.context("Задача установки прервана")?,
        Ok(()) = tokio::signal::ctrl_c() => {
            pb.finish_and_clear();
            app.store
                .recover_installs("прервано оператором", install_owned_here)
                .await?;
            logger::warning(&format!("Установка {} прервана, статус error", id));
            // SSH сессия работает в блокирующем потоке, ждать её завершения незачем
            std::process::exit(130);
        }
    };
    pb.finish_and_clear();

    match status {
        InstallStatus::Installed => {
            logger::success("Установка завершена");
            Ok(())
        }
        other => Err(anyhow::anyhow!(
            "Установка завершилась со статусом {}; подробности: noc_provisioner log {}",
            other,
            id
        )),
    }
}

async fn update_firewall(app: &App, id: Uuid, over_ssh: bool, force: bool) -> Result<()> {
    if over_ssh {
        let output = app.installer().push_firewall_ssh(id).await?;
        println!("{}", output.output.trim_end());
        logger::success("Правила nftables обновлены по SSH");
        return Ok(());
    }

    let server = app.store.get(id).await?;
    let command = installer::firewall_update_for(&server)?;
    let queued = app.agents().queue_command(id, &command, force).await;
    let status = if queued.is_ok() { "queued" } else { "rejected" };
    app.audit
        .record_quietly("update_firewall", Some(id), status, Some("agent"))
        .await;
    queued?;

    logger::success("Обновление правил поставлено в очередь агента");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(&cli.config)?;
    logger::init(&config.log_level)?;

    let app = App::open(config).await?;

    match cli.command {
        Commands::Add { file } => add_server(&app, &file).await?,
        Commands::List => list_servers(&app).await?,
        Commands::Show { id } => {
            let server = app.store.get(id).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&http::ServerView::from(&server))?
            );
        }
        Commands::Delete { id, yes } => delete_server(&app, id, yes).await?,
        Commands::Install { id } => install_server(&app, id).await?,
        Commands::Log { id } => {
            let server = app.store.get(id).await?;
            print!("{}", server.installation_log);
        }
        Commands::RenderScript { id, output } => {
            let server = app.store.get(id).await?;
            let script = installer::render_install_script(
                &server,
                &app.vault,
                &app.config.agent_api_url(),
            )?;
            match output {
                Some(path) => {
                    std::fs::write(&path, script)
                        .with_context(|| format!("Не удалось записать скрипт в {:?}", path))?;
                    logger::warning("Скрипт содержит пароли и токен агента в открытом виде");
                    logger::success(&format!("Скрипт сохранён в {:?}", path));
                }
                None => print!("{}", script),
            }
        }
        Commands::RenderFirewall { id } => {
            let server = app.store.get(id).await?;
            let policy = server
                .dns_policy()
                .ok_or_else(|| anyhow::anyhow!("Сервер {} не является DNS сервером", server.name))?;
            print!(
                "{}",
                firewall::compile(&FirewallPolicy::from_dns(server.ssh.port, policy))
            );
        }
        Commands::QueueCommand { id, command, force } => {
            if app.agents().queue_command(id, &command, force).await?.is_some() {
                logger::warning("Предыдущая невыполненная команда заменена");
            }
            logger::success("Команда поставлена в очередь агента");
        }
        Commands::ReinstallAgent { id } => {
            let output = app.installer().reinstall_agent(id).await?;
            println!("{}", output.output.trim_end());
            logger::success("Агент переустановлен");
        }
        Commands::UpdateFirewall { id, ssh, force } => update_firewall(&app, id, ssh, force).await?,
        Commands::Exec { id, command } => {
            let output = app.installer().exec_adhoc(id, &command).await?;
            print!("{}", output.output);
        }
        Commands::ProxyAdd {
            server_id,
            name,
            address,
            mode,
        } => {
            let proxy = Proxy::new(server_id, &name, &address, mode.into())?;
            let proxy_id = proxy.id;
            app.store.add_proxy(proxy).await?;
            app.audit
                .record_quietly("proxy_add", Some(server_id), "success", Some(&name))
                .await;
            logger::success(&format!("Прокси {} добавлен: {}", name, proxy_id));
        }
        Commands::ProxyList { server_id } => {
            for proxy in app.store.proxies_for(server_id).await? {
                println!(
                    "{}  {:<20}  {:<15}  {:?}",
                    proxy.id, proxy.name, proxy.address, proxy.mode
                );
            }
        }
        Commands::Serve => {
            let operator_token = app.config.operator_token.as_deref().map(Arc::from);
            let state = http::AppState {
                installer: app.installer(),
                agents: app.agents(),
                operator_token,
            };
            http::serve(&app.config.listen, state).await?;
        }
    }

    Ok(())
}
