use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use rand::{rngs::OsRng, thread_rng, Rng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::{fs, io::AsyncWriteExt};
use uuid::Uuid;

/// Длина токена агента в байтах (в hex получается вдвое длиннее)
pub const AGENT_TOKEN_BYTES: usize = 32;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuditLog {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub server_id: Option<Uuid>,
    pub status: String,
    pub details: Option<String>,
}

impl AuditLog {
    pub fn new(action: &str, server_id: Option<Uuid>, status: &str, details: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            action: action.to_string(),
            server_id,
            status: status.to_string(),
            details: details.map(|s| s.to_string()),
        }
    }
}

/// Журнал действий оператора (JSON по строке на событие)
#[derive(Debug, Clone)]
pub struct AuditTrail {
    path: Option<PathBuf>,
}

impl AuditTrail {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
        }
    }

    /// Журнал, который ничего не записывает
    #[cfg(test)]
    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub async fn record(&self, audit_log: AuditLog) -> Result<()> {
        let Some(audit_path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = audit_path.parent() {
            fs::create_dir_all(parent).await.with_context(|| {
                format!("Не удалось создать директорию для аудита: {:?}", parent)
            })?;
        }

        let log_json = serde_json::to_string(&audit_log)
            .with_context(|| "Не удалось сериализовать запись аудита")?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(audit_path)
            .await
            .with_context(|| format!("Не удалось открыть журнал аудита: {:?}", audit_path))?;

        file.write_all(format!("{}\n", log_json).as_bytes())
            .await
            .with_context(|| "Не удалось записать событие аудита")?;

        debug!("Записан аудит: {} - {}", audit_log.action, audit_log.status);
        Ok(())
    }

    /// Записывает событие; ошибка записи аудита не прерывает операцию
    pub async fn record_quietly(
        &self,
        action: &str,
        server_id: Option<Uuid>,
        status: &str,
        details: Option<&str>,
    ) {
        let entry = AuditLog::new(action, server_id, status, details);
        if let Err(e) = self.record(entry).await {
            warn!("Не удалось записать событие аудита {}: {:#}", action, e);
        }
    }
}

/// Генерирует случайный токен агента
pub fn generate_agent_token() -> String {
    hex::encode(OsRng.gen::<[u8; AGENT_TOKEN_BYTES]>())
}

/// Сравнивает токены за постоянное время.
/// Сравниваются хеши, поэтому длина токена тоже не утекает
pub fn tokens_match(provided: &str, expected: &str) -> bool {
    let provided = Sha256::digest(provided.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    provided.as_slice().ct_eq(expected.as_slice()).into()
}

/// Генерирует надежный пароль
pub fn generate_strong_password(length: usize) -> Result<String> {
    if length < 8 {
        return Err(anyhow::anyhow!(
            "Длина пароля должна быть не менее 8 символов"
        ));
    }

    let mut rng = thread_rng();
    loop {
        let password: String = (0..length)
            .map(|_| match rng.gen_range(0..3) {
                0 => rng.gen_range(b'A'..=b'Z') as char,
                1 => rng.gen_range(b'a'..=b'z') as char,
                _ => rng.gen_range(b'0'..=b'9') as char,
            })
            .collect();

        if check_password_strength(&password).is_ok() {
            return Ok(password);
        }
    }
}

/// Проверяет сложность пароля
/// Пароль должен содержать минимум 8 символов, прописные и строчные буквы и цифры
pub fn check_password_strength(password: &str) -> Result<()> {
    if password.chars().count() < 8 {
        return Err(anyhow::anyhow!(
            "Пароль должен содержать не менее 8 символов"
        ));
    }

    if !password.chars().any(|c| c.is_uppercase()) {
        return Err(anyhow::anyhow!("Пароль должен содержать прописные буквы"));
    }

    if !password.chars().any(|c| c.is_lowercase()) {
        return Err(anyhow::anyhow!("Пароль должен содержать строчные буквы"));
    }

    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(anyhow::anyhow!("Пароль должен содержать цифры"));
    }

    Ok(())
}

/// Экранирует значение для shell в одинарных кавычках
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Строковый литерал MySQL/MariaDB
pub fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', r"\\").replace('\'', "''"))
}

/// Строковый литерал PHP в одинарных кавычках
pub fn php_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', r"\\").replace('\'', r"\'"))
}

/// Приводит произвольный текст к виду, безопасному для однострочного комментария
pub fn comment_safe(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}
