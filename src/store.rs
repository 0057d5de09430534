//! Хранилище записей серверов
//!
//! Единственный путь записи для `ManagedServer`: любые изменения статуса,
//! журнала установки и состояния команд агента проходят через [`ServerStore::update`].
//! Файл общий для процессов (`serve` и команды CLI), поэтому каждая запись
//! выполняется под `flock` и начинается с чтения файла.

use std::{
    collections::BTreeMap,
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
};

use chrono::Utc;
use log::{debug, info, warn};
use nix::{
    errno::Errno,
    fcntl::{flock, FlockArg},
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{fs, sync::Mutex};
use uuid::Uuid;

use crate::{
    models::{InstallStatus, ManagedServer, Proxy, ServerRole},
    utils::timestamp,
    vault,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Сервер {0} не найден")]
    NotFound(Uuid),
    #[error("Недопустимый переход статуса {from} -> {to}")]
    InvalidTransition {
        from: InstallStatus,
        to: InstallStatus,
    },
    #[error("Сервер {0} не является сервером Zabbix")]
    NotZabbix(Uuid),
    #[error("Ошибка ввода-вывода хранилища: {0}")]
    Io(#[from] std::io::Error),
    #[error("Ошибка сериализации хранилища: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreData {
    servers: BTreeMap<Uuid, ManagedServer>,
    #[serde(default)]
    proxies: BTreeMap<Uuid, Proxy>,
}

/// Межпроцессная блокировка файла хранилища (`flock` на соседнем `.lock` файле).
/// Снимается при закрытии дескриптора
struct FileLock {
    _file: std::fs::File,
}

impl FileLock {
    async fn acquire(path: PathBuf) -> Result<Self, StoreError> {
        tokio::task::spawn_blocking(move || -> Result<Self, StoreError> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)?;
            flock(file.as_raw_fd(), FlockArg::LockExclusive).map_err(std::io::Error::from)?;
            Ok(Self { _file: file })
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }
}

/// Жив ли процесс, выполняющий установку
fn owner_alive(pid: u32) -> bool {
    match i32::try_from(pid) {
        Ok(raw) => !matches!(kill(Pid::from_raw(raw), None::<Signal>), Err(Errno::ESRCH)),
        Err(_) => false,
    }
}

/// Установка брошена: процесс-владелец завершился или это не процесс установки.
/// Используется при старте, когда собственных установок ещё нет
pub fn install_owner_gone(pid: Option<u32>) -> bool {
    match pid {
        Some(pid) => pid == std::process::id() || !owner_alive(pid),
        None => true,
    }
}

/// Установка выполняется текущим процессом
pub fn install_owned_here(pid: Option<u32>) -> bool {
    pid == Some(std::process::id())
}

async fn load(path: &Path) -> Result<StoreData, StoreError> {
    match fs::read_to_string(path).await {
        Ok(contents) => Ok(serde_json::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreData::default()),
        Err(e) => Err(e.into()),
    }
}

/// Хранилище записей серверов.
///
/// Файл общий для `serve` и команд CLI: каждое изменение перечитывает его под
/// блокировкой `flock`, а чтение всегда берёт данные с диска.
#[derive(Debug)]
pub struct ServerStore {
    path: Option<PathBuf>,
    data: Mutex<StoreData>,
}

impl ServerStore {
    /// Открывает хранилище из JSON файла (файл создается при первой записи)
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if !fs::try_exists(&path).await? {
            info!("Файл хранилища {:?} не найден, создается пустое хранилище", path);
        }
        let data = load(&path).await?;

        // Открытый текст вместо секрета не используется: расшифровка такого поля завершится ошибкой
        for server in data.servers.values() {
            for (field, value) in server.secret_fields() {
                if !vault::is_encoded(value) {
                    warn!(
                        "Поле {} сервера {} ({}) не зашифровано",
                        field, server.name, server.id
                    );
                }
            }
        }

        Ok(Self {
            path: Some(path),
            data: Mutex::new(data),
        })
    }

    /// Хранилище без сохранения на диск
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: Mutex::new(StoreData::default()),
        }
    }

    async fn persist(&self, data: &StoreData) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Запись через временный файл, чтобы не оставить обрезанный JSON
        let json = serde_json::to_vec_pretty(data)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, path).await?;
        debug!("Хранилище сохранено в {:?}", path);
        Ok(())
    }

    /// Чтение актуальных данных
    async fn read<T>(&self, f: impl FnOnce(&StoreData) -> T) -> Result<T, StoreError> {
        let mut data = self.data.lock().await;
        if let Some(path) = &self.path {
            *data = load(path).await?;
        }
        Ok(f(&data))
    }

    /// Изменение данных под блокировкой процесса и файла.
    ///
    /// Замыкание работает с копией, перечитанной с диска. Копия заменяет данные
    /// в памяти только после успешной записи; при любой ошибке ничего не меняется.
    async fn transact<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut StoreData) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut data = self.data.lock().await;
        let _lock = match &self.path {
            Some(path) => Some(FileLock::acquire(path.with_extension("json.lock")).await?),
            None => None,
        };

        let mut draft = match &self.path {
            Some(path) => load(path).await?,
            None => data.clone(),
        };
        let value = f(&mut draft)?;
        self.persist(&draft).await?;
        *data = draft;
        Ok(value)
    }

    pub async fn insert(&self, server: ManagedServer) -> Result<(), StoreError> {
        self.transact(|data| {
            data.servers.insert(server.id, server);
            Ok(())
        })
        .await
    }

    pub async fn get(&self, id: Uuid) -> Result<ManagedServer, StoreError> {
        self.read(|data| data.servers.get(&id).cloned())
            .await?
            .ok_or(StoreError::NotFound(id))
    }

    pub async fn list(&self) -> Result<Vec<ManagedServer>, StoreError> {
        self.read(|data| {
            let mut servers: Vec<_> = data.servers.values().cloned().collect();
            servers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            servers
        })
        .await
    }

    /// Удаляет запись вместе с её прокси. Удалённый хост не затрагивается
    pub async fn delete(&self, id: Uuid) -> Result<(ManagedServer, Vec<Proxy>), StoreError> {
        self.transact(|data| {
            let server = data.servers.remove(&id).ok_or(StoreError::NotFound(id))?;
            let proxy_ids: Vec<Uuid> = data
                .proxies
                .values()
                .filter(|p| p.server_id == id)
                .map(|p| p.id)
                .collect();
            let proxies = proxy_ids
                .iter()
                .filter_map(|pid| data.proxies.remove(pid))
                .collect();
            Ok((server, proxies))
        })
        .await
    }

    /// Единственный путь изменения записи.
    ///
    /// Замыкание работает с копией; если оно вернуло ошибку, запись не меняется.
    pub async fn update<T, E, F>(&self, id: Uuid, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut ManagedServer) -> Result<T, E>,
        E: From<StoreError>,
    {
        self.transact(|data| {
            let server = data.servers.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            let value = f(server)?;
            server.updated_at = Utc::now();
            Ok(value)
        })
        .await
    }

    /// Атомарно переводит сервер в installing и записывает pid владельца.
    /// Допустимо только из pending/error, поэтому две одновременные установки невозможны
    pub async fn begin_install(&self, id: Uuid) -> Result<ManagedServer, StoreError> {
        self.update(id, |server| {
            if !server.status.can_start_install() {
                return Err(StoreError::InvalidTransition {
                    from: server.status,
                    to: InstallStatus::Installing,
                });
            }
            server.status = InstallStatus::Installing;
            server.install_pid = Some(std::process::id());
            Ok(server.clone())
        })
        .await
    }

    /// Завершает установку: installing -> installed/error
    pub async fn finish_install(
        &self,
        id: Uuid,
        outcome: InstallStatus,
        log_chunk: &str,
    ) -> Result<(), StoreError> {
        self.update(id, |server| {
            let allowed = match outcome {
                InstallStatus::Installed | InstallStatus::Error => true,
                InstallStatus::DnsError => server.role() == ServerRole::Dns,
                InstallStatus::Pending | InstallStatus::Installing => false,
            };
            if server.status != InstallStatus::Installing || !allowed {
                return Err(StoreError::InvalidTransition {
                    from: server.status,
                    to: outcome,
                });
            }
            server.append_log(log_chunk);
            server.status = outcome;
            server.install_pid = None;
            Ok(())
        })
        .await
    }

    /// Переводит в error установки, которые больше никто не выполняет.
    ///
    /// `is_orphan` получает pid процесса, начавшего установку.
    pub async fn recover_installs<F>(
        &self,
        reason: &str,
        is_orphan: F,
    ) -> Result<Vec<Uuid>, StoreError>
    where
        F: Fn(Option<u32>) -> bool,
    {
        let stale = |server: &ManagedServer| {
            server.status == InstallStatus::Installing && is_orphan(server.install_pid)
        };
        if !self.read(|data| data.servers.values().any(stale)).await? {
            return Ok(Vec::new());
        }

        let recovered = self
            .transact(|data| {
                let mut ids = Vec::new();
                for server in data.servers.values_mut().filter(|s| stale(s)) {
                    let line = format!("[{}] Установка прервана: {}", timestamp(), reason);
                    server.append_log(&line);
                    server.status = InstallStatus::Error;
                    server.install_pid = None;
                    server.updated_at = Utc::now();
                    ids.push(server.id);
                }
                Ok::<_, StoreError>(ids)
            })
            .await?;

        for id in &recovered {
            warn!("Установка {} прервана ({}), статус error", id, reason);
        }
        Ok(recovered)
    }

    pub async fn append_log(&self, id: Uuid, chunk: &str) -> Result<(), StoreError> {
        self.update(id, |server| {
            server.append_log(chunk);
            Ok::<_, StoreError>(())
        })
        .await
    }

    pub async fn add_proxy(&self, proxy: Proxy) -> Result<(), StoreError> {
        self.transact(|data| {
            let server = data
                .servers
                .get(&proxy.server_id)
                .ok_or(StoreError::NotFound(proxy.server_id))?;
            if server.role() != ServerRole::Zabbix {
                return Err(StoreError::NotZabbix(proxy.server_id));
            }
            data.proxies.insert(proxy.id, proxy);
            Ok(())
        })
        .await
    }

    pub async fn proxies_for(&self, server_id: Uuid) -> Result<Vec<Proxy>, StoreError> {
        self.read(|data| {
            let mut proxies: Vec<_> = data
                .proxies
                .values()
                .filter(|p| p.server_id == server_id)
                .cloned()
                .collect();
            proxies.sort_by(|a, b| a.name.cmp(&b.name));
            proxies
        })
        .await
    }
}
