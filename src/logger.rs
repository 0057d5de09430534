use anyhow::Result;
use colored::*;
use env_logger::{Builder, Env};

/// Инициализирует логирование
///
/// Уровень из конфигурации используется, если не задан `RUST_LOG`.
///
/// # Arguments
/// * `level` - Уровень логирования по умолчанию (`info`, `debug`, ...)
///
/// # Examples
/// ```rust
/// logger::init("info")?;
/// ```
pub fn init(level: &str) -> Result<()> {
    let env = Env::default()
        .filter_or("RUST_LOG", level)
        .write_style_or("RUST_LOG_STYLE", "auto");

    Builder::from_env(env)
        .format_timestamp_secs()
        .format_module_path(true)
        .try_init()?;

    Ok(())
}

/// Показывает оператору сгенерированный пароль.
/// Только для паролей, которые оператор должен сохранить; в журнал не пишется
pub fn password_info(label: &str, password: &str) {
    println!(
        "{} {}: {}",
        "[GENERATED PASSWORD]".magenta().bold(),
        label,
        password.cyan().bold()
    );
}

pub fn success(message: &str) {
    println!("{} {}", "[SUCCESS]".green().bold(), message);
}

pub fn warning(message: &str) {
    println!("{} {}", "[WARNING]".yellow().bold(), message);
}
