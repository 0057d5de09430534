//! Хранилище секретов
//!
//! Все секреты (SSH пароли, пароли БД Zabbix, токены агентов) хранятся в виде
//! `iv_hex:ciphertext_hex`. Используется AES-256-GCM со 128-битным IV, поэтому
//! расшифровка чужим ключом или поврежденных данных всегда завершается ошибкой.

use std::fmt;

use aes_gcm::{
    aead::{consts::U16, Aead, KeyInit},
    aes::Aes256,
    AesGcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::warn;
use rand::{rngs::OsRng, Rng};
use thiserror::Error;

use crate::config::{AppConfig, Mode};

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;

type VaultCipher = AesGcm<Aes256, U16>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum VaultError {
    #[error("Секрет имеет неверный формат (ожидается iv:ciphertext в hex)")]
    Malformed,
    #[error("Не удалось расшифровать секрет: неверный ключ или поврежденные данные")]
    Decrypt,
    #[error("Ошибка шифрования секрета")]
    Encrypt,
    #[error("Расшифрованный секрет не является строкой UTF-8")]
    NotUtf8,
    #[error("Ключ хранилища должен содержать {KEY_LEN} байт, получено {0}")]
    KeyLength(usize),
    #[error("Ключ хранилища не в формате base64")]
    KeyEncoding,
    #[error("Ключ хранилища не задан, а режим production запрещает временный ключ")]
    MissingKey,
}

#[derive(Clone)]
pub struct Vault {
    key: [u8; KEY_LEN],
    ephemeral: bool,
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vault")
            .field("key", &"<redacted>")
            .field("ephemeral", &self.ephemeral)
            .finish()
    }
}

impl Vault {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self {
            key,
            ephemeral: false,
        }
    }

    /// Создает хранилище из ключа в base64
    pub fn from_base64(encoded: &str) -> Result<Self, VaultError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|_| VaultError::KeyEncoding)?;
        let key: [u8; KEY_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| VaultError::KeyLength(bytes.len()))?;
        Ok(Self::new(key))
    }

    /// Временный ключ на время жизни процесса.
    /// Секреты, зашифрованные им, не переживут перезапуск
    pub fn ephemeral() -> Self {
        Self {
            key: OsRng.gen::<[u8; KEY_LEN]>(),
            ephemeral: true,
        }
    }

    /// Выбирает ключ согласно конфигурации и режиму работы
    pub fn from_config(config: &AppConfig) -> Result<Self, VaultError> {
        match (&config.vault_key, config.mode) {
            (Some(key), _) => Self::from_base64(key),
            (None, Mode::Production) => Err(VaultError::MissingKey),
            (None, Mode::Development) => {
                warn!(
                    "Ключ хранилища не задан: используется временный ключ. \
                     Секреты станут нечитаемыми после перезапуска"
                );
                Ok(Self::ephemeral())
            }
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    fn cipher(&self) -> VaultCipher {
        VaultCipher::new(Key::<VaultCipher>::from_slice(&self.key))
    }

    /// Шифрует строку, возвращает `iv_hex:ciphertext_hex`
    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let iv = OsRng.gen::<[u8; IV_LEN]>();
        let ciphertext = self
            .cipher()
            .encrypt(Nonce::<U16>::from_slice(&iv), plaintext.as_bytes())
            .map_err(|_| VaultError::Encrypt)?;

        Ok(format!("{}:{}", hex::encode(iv), hex::encode(ciphertext)))
    }

    /// Расшифровывает значение `iv_hex:ciphertext_hex`.
    /// Значение в другом формате никогда не трактуется как открытый текст
    pub fn decrypt(&self, encoded: &str) -> Result<String, VaultError> {
        let (iv, ciphertext) = split_encoded(encoded)?;

        let plaintext = self
            .cipher()
            .decrypt(Nonce::<U16>::from_slice(&iv), ciphertext.as_slice())
            .map_err(|_| VaultError::Decrypt)?;

        String::from_utf8(plaintext).map_err(|_| VaultError::NotUtf8)
    }
}

fn split_encoded(encoded: &str) -> Result<(Vec<u8>, Vec<u8>), VaultError> {
    let (iv_hex, ct_hex) = encoded.split_once(':').ok_or(VaultError::Malformed)?;
    if iv_hex.len() != IV_LEN * 2 {
        return Err(VaultError::Malformed);
    }

    let iv = hex::decode(iv_hex).map_err(|_| VaultError::Malformed)?;
    let ciphertext = hex::decode(ct_hex).map_err(|_| VaultError::Malformed)?;
    if ciphertext.len() < TAG_LEN {
        return Err(VaultError::Malformed);
    }
    Ok((iv, ciphertext))
}

/// Проверяет, что значение имеет форму зашифрованного секрета
pub fn is_encoded(value: &str) -> bool {
    split_encoded(value).is_ok()
}
