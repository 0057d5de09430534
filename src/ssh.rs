//! Выполнение скриптов и команд на удалённых хостах по SSH
//!
//! Каждая операция открывает собственную сессию и закрывает её на любом пути
//! выхода. `ssh2` блокирующий, поэтому асинхронный код вызывает исполнитель
//! через [`run_blocking`].

use std::{
    fmt,
    io::{self, Read, Write},
    net::{IpAddr, SocketAddr, TcpStream},
    path::Path,
    sync::Arc,
    time::Duration,
};

use log::{debug, info, warn};
use ssh2::{ExtendedData, Session};
use thiserror::Error;

use crate::{
    config::REMOTE_SCRIPT_PATH,
    models::ManagedServer,
    security::shell_quote,
    vault::{Vault, VaultError},
};

/// Код libssh2 для истёкшего таймаута сессии
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;

/// Запас для внешнего таймаута поверх таймаута сессии libssh2
const BLOCKING_GRACE: Duration = Duration::from_secs(15);

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Не удалось подключиться к {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("Ошибка SSH handshake: {0}")]
    Handshake(String),
    #[error("Сервер отклонил аутентификацию пользователя {0}")]
    Auth(String),
    #[error("Превышено время ожидания ({0:?})")]
    Timeout(Duration),
    #[error("Ошибка канала SSH: {0}")]
    Channel(String),
    #[error("Не удалось загрузить скрипт: {0}")]
    Upload(String),
    #[error("Команда завершилась с кодом {code}: {output}")]
    CommandFailed { code: i32, output: String },
    #[error("Фоновая задача SSH прервана: {0}")]
    Join(String),
}

impl SshError {
    /// Ошибка соединения, а не результата выполнения на хосте
    pub fn is_transport(&self) -> bool {
        !matches!(self, SshError::CommandFailed { .. })
    }
}

/// Адрес и расшифрованные учётные данные для одной операции
#[derive(Clone)]
pub struct SshTarget {
    pub host: IpAddr,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<скрыт>")
            .finish()
    }
}

impl SshTarget {
    pub fn for_server(server: &ManagedServer, vault: &Vault) -> Result<Self, VaultError> {
        Ok(Self {
            host: IpAddr::V4(server.ipv4),
            port: server.ssh.port,
            username: server.ssh.username.clone(),
            password: vault.decrypt(&server.ssh.password)?,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    fn is_root(&self) -> bool {
        self.username == "root"
    }

    /// Оборачивает команду в sudo для не-root пользователя.
    /// Возвращает команду и данные для stdin (пароль sudo)
    fn elevate(&self, command: &str) -> (String, Option<String>) {
        if self.is_root() {
            return (command.to_string(), None);
        }
        (
            format!("sudo -S -p '' bash -c {}", shell_quote(command)),
            Some(format!("{}\n", self.password)),
        )
    }
}

/// Объединённый stdout/stderr и код завершения
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub output: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Транспорт для удалённого выполнения.
///
/// `run_script` возвращает вывод при любом коде завершения: ненулевой код
/// означает ошибку скрипта, а не соединения. `run_command` считает ненулевой
/// код ошибкой [`SshError::CommandFailed`].
pub trait RemoteExecutor: Send + Sync {
    fn run_script(
        &self,
        target: &SshTarget,
        script: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, SshError>;

    fn run_command(
        &self,
        target: &SshTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, SshError>;
}

/// Сессия, которая отключается при выходе из области видимости
struct SessionGuard {
    session: Session,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Err(e) = self.session.disconnect(None, "noc_provisioner: done", None) {
            debug!("Ошибка при закрытии SSH сессии: {}", e);
        }
    }
}

fn timeout_ms(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

fn is_timeout(e: &ssh2::Error) -> bool {
    e.code() == ssh2::ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT)
}

fn channel_error(e: ssh2::Error, timeout: Duration) -> SshError {
    if is_timeout(&e) {
        SshError::Timeout(timeout)
    } else {
        SshError::Channel(e.to_string())
    }
}

fn io_error(e: io::Error, timeout: Duration) -> SshError {
    if e.kind() == io::ErrorKind::TimedOut {
        SshError::Timeout(timeout)
    } else {
        SshError::Channel(e.to_string())
    }
}

/// Реализация на libssh2
#[derive(Debug, Clone)]
pub struct SshExecutor {
    connect_timeout: Duration,
}

impl SshExecutor {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    fn connect(&self, target: &SshTarget) -> Result<SessionGuard, SshError> {
        let addr = target.addr();
        debug!("Подключение к {} как {}", addr, target.username);

        let tcp = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(|source| SshError::Connect { addr, source })?;

        let mut session = Session::new().map_err(|e| SshError::Handshake(e.to_string()))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(timeout_ms(self.connect_timeout));
        session.handshake().map_err(|e| {
            if is_timeout(&e) {
                SshError::Timeout(self.connect_timeout)
            } else {
                SshError::Handshake(e.to_string())
            }
        })?;

        let guard = SessionGuard { session };
        guard
            .session
            .userauth_password(&target.username, &target.password)
            .map_err(|_| SshError::Auth(target.username.clone()))?;
        if !guard.session.authenticated() {
            return Err(SshError::Auth(target.username.clone()));
        }

        info!("SSH сессия с {} установлена", addr);
        Ok(guard)
    }

    fn upload(guard: &SessionGuard, script: &str, timeout: Duration) -> Result<(), SshError> {
        let upload_err = |e: ssh2::Error| {
            if is_timeout(&e) {
                SshError::Timeout(timeout)
            } else {
                SshError::Upload(e.to_string())
            }
        };

        let bytes = script.as_bytes();
        let mut remote = guard
            .session
            .scp_send(Path::new(REMOTE_SCRIPT_PATH), 0o700, bytes.len() as u64, None)
            .map_err(upload_err)?;
        remote
            .write_all(bytes)
            .map_err(|e| SshError::Upload(e.to_string()))?;
        remote.send_eof().map_err(upload_err)?;
        remote.wait_eof().map_err(upload_err)?;
        remote.close().map_err(upload_err)?;
        remote.wait_close().map_err(upload_err)?;

        debug!("Скрипт загружен в {} ({} байт)", REMOTE_SCRIPT_PATH, bytes.len());
        Ok(())
    }

    fn exec(
        guard: &SessionGuard,
        target: &SshTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, SshError> {
        guard.session.set_timeout(timeout_ms(timeout));

        let (command, stdin) = target.elevate(command);
        let mut channel = guard
            .session
            .channel_session()
            .map_err(|e| channel_error(e, timeout))?;
        channel
            .handle_extended_data(ExtendedData::Merge)
            .map_err(|e| channel_error(e, timeout))?;
        channel.exec(&command).map_err(|e| channel_error(e, timeout))?;

        if let Some(input) = stdin {
            channel
                .write_all(input.as_bytes())
                .map_err(|e| io_error(e, timeout))?;
        }
        channel.send_eof().map_err(|e| channel_error(e, timeout))?;

        let mut raw = Vec::new();
        channel
            .read_to_end(&mut raw)
            .map_err(|e| io_error(e, timeout))?;
        channel.wait_close().map_err(|e| channel_error(e, timeout))?;
        let status = channel
            .exit_status()
            .map_err(|e| channel_error(e, timeout))?;
        let signal = channel
            .exit_signal()
            .map_err(|e| channel_error(e, timeout))?
            .exit_signal;

        let mut output = String::from_utf8_lossy(&raw).into_owned();
        let exit_code = match signal {
            Some(name) => {
                warn!("Удалённый процесс на {} завершён сигналом SIG{}", target.addr(), name);
                if !output.is_empty() && !output.ends_with('\n') {
                    output.push('\n');
                }
                output.push_str(&format!("[noc] процесс завершён сигналом SIG{name}\n"));
                signal_exit_code(&name)
            }
            None => status,
        };

        Ok(ExecOutput { output, exit_code })
    }
}

/// Код завершения процесса, убитого сигналом: 128 + номер, как в bash.
/// Без exit-status libssh2 возвращает 0, поэтому сигнал проверяется отдельно
fn signal_exit_code(name: &str) -> i32 {
    let number = match name {
        "HUP" => 1,
        "INT" => 2,
        "QUIT" => 3,
        "ILL" => 4,
        "ABRT" => 6,
        "FPE" => 8,
        "KILL" => 9,
        "SEGV" => 11,
        "PIPE" => 13,
        "ALRM" => 14,
        "TERM" => 15,
        _ => return 255,
    };
    128 + number
}

impl RemoteExecutor for SshExecutor {
    fn run_script(
        &self,
        target: &SshTarget,
        script: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, SshError> {
        let guard = self.connect(target)?;
        Self::upload(&guard, script, timeout)?;

        let remote = shell_quote(REMOTE_SCRIPT_PATH);
        let command = format!("bash {remote}; rc=$?; rm -f {remote}; exit $rc");
        let result = Self::exec(&guard, target, &command, timeout)?;
        info!(
            "Скрипт на {} завершился с кодом {}",
            target.addr(),
            result.exit_code
        );
        Ok(result)
    }

    fn run_command(
        &self,
        target: &SshTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, SshError> {
        let guard = self.connect(target)?;
        let result = Self::exec(&guard, target, command, timeout)?;
        if !result.success() {
            return Err(SshError::CommandFailed {
                code: result.exit_code,
                output: result.output,
            });
        }
        Ok(result)
    }
}

/// Запускает блокирующую SSH операцию в пуле tokio с внешним таймаутом
pub async fn run_blocking<F>(timeout: Duration, op: F) -> Result<ExecOutput, SshError>
where
    F: FnOnce() -> Result<ExecOutput, SshError> + Send + 'static,
{
    let handle = tokio::task::spawn_blocking(op);
    match tokio::time::timeout(timeout + BLOCKING_GRACE, handle).await {
        Err(_) => Err(SshError::Timeout(timeout)),
        Ok(Err(join)) => Err(SshError::Join(join.to_string())),
        Ok(Ok(result)) => result,
    }
}

/// Ad-hoc команда на уже установленном хосте
pub async fn run_command_async(
    executor: Arc<dyn RemoteExecutor>,
    target: SshTarget,
    command: String,
    timeout: Duration,
) -> Result<ExecOutput, SshError> {
    run_blocking(timeout, move || {
        executor.run_command(&target, &command, timeout)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpListener};

    #[test]
    fn killed_process_is_never_success() {
        assert_eq!(signal_exit_code("KILL"), 137);
        assert_eq!(signal_exit_code("TERM"), 143);
        assert_eq!(signal_exit_code("XCPU"), 255);
        let killed = ExecOutput {
            output: String::new(),
            exit_code: signal_exit_code("SEGV"),
        };
        assert!(!killed.success());
    }

    fn target(username: &str) -> SshTarget {
        SshTarget {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 22,
            username: username.to_string(),
            password: "pa'ss".to_string(),
        }
    }

    #[test]
    fn debug_hides_password() {
        let text = format!("{:?}", target("root"));
        assert!(!text.contains("pa'ss"));
        assert!(text.contains("127.0.0.1"));
    }

    #[test]
    fn root_runs_without_sudo() {
        let (command, stdin) = target("root").elevate("nft list ruleset");
        assert_eq!(command, "nft list ruleset");
        assert!(stdin.is_none());
    }

    #[test]
    fn other_users_go_through_sudo() {
        let (command, stdin) = target("admin").elevate("echo 'x'");
        assert_eq!(command, r"sudo -S -p '' bash -c 'echo '\''x'\'''");
        assert_eq!(stdin.as_deref(), Some("pa'ss\n"));
    }

    #[test]
    fn only_command_failure_is_not_transport() {
        assert!(!SshError::CommandFailed {
            code: 1,
            output: String::new()
        }
        .is_transport());
        assert!(SshError::Auth("root".into()).is_transport());
        assert!(SshError::Timeout(Duration::from_secs(1)).is_transport());
    }

    #[test]
    fn refused_connection_is_connect_error() {
        // Свободный порт: слушатель сразу закрывается
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut t = target("root");
        t.port = port;

        let executor = SshExecutor::new(Duration::from_secs(2));
        let err = executor
            .run_command(&t, "true", Duration::from_secs(2))
            .unwrap_err();
        assert!(matches!(err, SshError::Connect { .. }));
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn run_blocking_passes_result_through() {
        let result = run_blocking(Duration::from_secs(5), || {
            Ok(ExecOutput {
                output: "ok".into(),
                exit_code: 3,
            })
        })
        .await
        .unwrap();
        assert_eq!(result.exit_code, 3);
        assert!(!result.success());
    }
}
