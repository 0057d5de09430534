//! Протокол агента: check-in, отчёт о результате и очередь команд
//!
//! Агент сам опрашивает панель, сервер только отвечает. Любая ошибка
//! аутентификации выглядит одинаково, независимо от того, существует ли сервер.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    models::{CommandStatus, ManagedServer},
    security::{tokens_match, AuditTrail},
    store::{ServerStore, StoreError},
    utils::truncate_utf8,
    vault::Vault,
};

/// Максимальный размер сохраняемого вывода команды
pub const MAX_OUTPUT_BYTES: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Неверный идентификатор сервера или токен")]
    Unauthorized,
    #[error("Для сервера {0} уже есть невыполненная команда")]
    CommandOutstanding(Uuid),
    #[error("Команда не может быть пустой")]
    EmptyCommand,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckInRequest {
    pub server_id: String,
    pub token: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub server_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckInResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultReport {
    pub server_id: String,
    pub token: String,
    #[serde(default)]
    pub output: String,
    pub exit_code: i32,
    /// Идентификатор команды из ответа на check-in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<Uuid>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub server_type: Option<String>,
}

#[derive(Clone)]
pub struct AgentService {
    store: Arc<ServerStore>,
    vault: Arc<Vault>,
    audit: AuditTrail,
}

impl AgentService {
    pub fn new(store: Arc<ServerStore>, vault: Arc<Vault>, audit: AuditTrail) -> Self {
        Self {
            store,
            vault,
            audit,
        }
    }

    fn authorize(&self, server: &ManagedServer, token: &str) -> Result<(), AgentError> {
        let expected = match self.vault.decrypt(&server.agent.token) {
            Ok(expected) => expected,
            Err(e) => {
                error!(
                    "Не удалось расшифровать токен агента сервера {}: {}",
                    server.id, e
                );
                return Err(AgentError::Unauthorized);
            }
        };
        if !tokens_match(token, &expected) {
            return Err(AgentError::Unauthorized);
        }
        Ok(())
    }

    fn hide_missing(e: AgentError) -> AgentError {
        match e {
            AgentError::Store(StoreError::NotFound(_)) => AgentError::Unauthorized,
            other => other,
        }
    }

    /// Обновляет время последнего обращения и выдаёт ожидающую команду.
    /// Выданная команда переходит в running и больше не выдаётся
    pub async fn check_in(&self, request: &CheckInRequest) -> Result<CheckInResponse, AgentError> {
        let id = Uuid::parse_str(&request.server_id).map_err(|_| AgentError::Unauthorized)?;

        let response = self
            .store
            .update::<_, AgentError, _>(id, |server| {
                self.authorize(server, &request.token)?;
                server.agent.last_agent_check = Some(Utc::now());

                if server.agent.command_status != Some(CommandStatus::Pending) {
                    return Ok(CheckInResponse::default());
                }
                server.agent.command_status = Some(CommandStatus::Running);
                Ok(CheckInResponse {
                    command: server.agent.pending_command.clone(),
                    command_id: server.agent.command_id,
                })
            })
            .await
            .map_err(Self::hide_missing)?;

        if let Some(command) = &response.command {
            info!(
                "Команда ({} байт) передана агенту сервера {}",
                command.len(),
                id
            );
        } else {
            debug!("Check-in агента {}", id);
        }
        Ok(response)
    }

    /// Сохраняет результат команды и освобождает очередь.
    ///
    /// Результат принимается только для выданной команды: с `commandId` он должен
    /// совпасть с текущей, без него команда должна быть в running. Остальные
    /// результаты относятся к заменённым командам и отбрасываются.
    pub async fn report_result(&self, report: &ResultReport) -> Result<(), AgentError> {
        let id = Uuid::parse_str(&report.server_id).map_err(|_| AgentError::Unauthorized)?;
        let status = if report.exit_code == 0 {
            CommandStatus::Done
        } else {
            CommandStatus::Error
        };

        let accepted = self
            .store
            .update::<_, AgentError, _>(id, |server| {
                self.authorize(server, &report.token)?;
                server.agent.last_agent_check = Some(Utc::now());

                let current = match report.command_id {
                    Some(reported) => server.agent.command_id == Some(reported),
                    None => server.agent.command_status == Some(CommandStatus::Running),
                };
                if !current {
                    return Ok(false);
                }
                server.agent.pending_command = None;
                server.agent.command_status = Some(status);
                server.agent.command_output =
                    Some(truncate_utf8(&report.output, MAX_OUTPUT_BYTES).to_string());
                Ok(true)
            })
            .await
            .map_err(Self::hide_missing)?;

        if !accepted {
            warn!(
                "Агент {} прислал результат устаревшей команды, результат отброшен",
                id
            );
            self.audit
                .record_quietly("command_result", Some(id), "stale", None)
                .await;
            return Ok(());
        }

        info!(
            "Агент {} завершил команду с кодом {}",
            id, report.exit_code
        );
        Ok(())
    }

    /// Ставит команду в очередь.
    ///
    /// Пока предыдущая команда не завершена, новая отклоняется; с `force`
    /// предыдущая заменяется и возвращается вызывающему.
    pub async fn queue_command(
        &self,
        id: Uuid,
        command: &str,
        force: bool,
    ) -> Result<Option<String>, AgentError> {
        if command.trim().is_empty() {
            return Err(AgentError::EmptyCommand);
        }

        let result = self
            .store
            .update::<_, AgentError, _>(id, |server| {
                let replaced = if server.agent.has_outstanding_command() {
                    if !force {
                        return Err(AgentError::CommandOutstanding(id));
                    }
                    server.agent.pending_command.take()
                } else {
                    None
                };
                server.agent.pending_command = Some(command.to_string());
                server.agent.command_id = Some(Uuid::new_v4());
                server.agent.command_status = Some(CommandStatus::Pending);
                server.agent.command_output = None;
                Ok(replaced)
            })
            .await;

        let (status, details) = match &result {
            Ok(Some(_)) => ("replaced", "предыдущая команда заменена"),
            Ok(None) => ("queued", ""),
            Err(AgentError::CommandOutstanding(_)) => ("rejected", "команда уже ожидает"),
            Err(_) => ("error", ""),
        };
        self.audit
            .record_quietly(
                "queue_command",
                Some(id),
                status,
                Some(details).filter(|d| !d.is_empty()),
            )
            .await;

        let replaced = result?;
        if replaced.is_some() {
            warn!("Невыполненная команда сервера {} заменена новой", id);
        }
        info!("Команда ({} байт) поставлена в очередь для {}", command.len(), id);
        Ok(replaced)
    }
}
