// ! Генерация bash скриптов установки
// !
// ! Скрипт собирается целиком на стороне панели и загружается на хост по SSH.
// ! Все конфигурационные файлы пишутся из heredoc в одинарных кавычках, поэтому
// ! shell ничего в них не подставляет; значения, которые нужны командам, задаются
// ! один раз в начале скрипта как переменные в одинарных кавычках.
// ! Генерация не выполняет ввода-вывода: одинаковый вход дает одинаковый текст.

use thiserror::Error;

use crate::{
    agent::MAX_OUTPUT_BYTES,
    config::{
        AGENT_POLL_INTERVAL_SECS, AGENT_SCRIPT_PATH, AGENT_UNIT_NAME, NFTABLES_CONF_PATH,
        SUPPORTED_OS_ID, SUPPORTED_OS_VERSION,
    },
    dns,
    models::{ManagedServer, RolePolicy, ServerRole},
    security::{comment_safe, shell_quote},
    zabbix,
};

pub const HEREDOC_DELIMITER: &str = "NOC_EOF";

/// Строка, которую скрипт печатает после успешного завершения
pub const INSTALL_OK_MARKER: &str = "[noc] INSTALL COMPLETE";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ScriptError {
    #[error("Для роли {role} не заполнено поле {field}")]
    MissingField {
        role: ServerRole,
        field: &'static str,
    },
    #[error("Содержимое {0} содержит строку-разделитель heredoc")]
    UnsafeHeredoc(String),
}

/// Расшифрованные пароли Zabbix, нужные только на время генерации
#[derive(Debug, Clone)]
pub struct ZabbixSecrets {
    pub db_password: String,
    pub db_root_password: String,
}

/// Всё, что нужно для генерации скрипта для одного сервера
#[derive(Debug, Clone)]
pub struct ScriptInputs<'a> {
    pub server: &'a ManagedServer,
    pub agent_token: &'a str,
    pub agent_api_url: &'a str,
    pub zabbix: Option<ZabbixSecrets>,
}

/// Построчный сборщик скрипта
#[derive(Debug, Default)]
pub struct ScriptBuilder {
    buf: String,
}

impl ScriptBuilder {
    pub fn new(title: &str) -> Self {
        let mut builder = Self::default();
        builder.line("#!/bin/bash");
        builder.line(&format!("# {}", comment_safe(title)));
        builder.line("# Сгенерировано noc_provisioner, не редактируйте вручную");
        builder.line("set -euo pipefail");
        builder.line("export DEBIAN_FRONTEND=noninteractive");
        builder.blank();
        builder.raw(
            r#"log() { echo "[noc] $(date -u '+%Y-%m-%dT%H:%M:%SZ') $*"; }
warn() { echo "[noc] WARNING: $*" >&2; }
fail() { echo "[noc] ERROR: $*" >&2; exit 1; }
trap 'echo "[noc] ERROR: команда завершилась с ошибкой (строка $LINENO)" >&2' ERR
"#,
        );
        builder
    }

    pub fn line(&mut self, line: &str) {
        self.buf.push_str(line);
        self.buf.push('\n');
    }

    pub fn blank(&mut self) {
        self.buf.push('\n');
    }

    /// Добавляет готовый фрагмент как есть
    pub fn raw(&mut self, text: &str) {
        self.buf.push_str(text);
        if !text.ends_with('\n') {
            self.buf.push('\n');
        }
    }

    /// Заголовок этапа: комментарий и строка в выводе
    pub fn section(&mut self, title: &str) {
        self.blank();
        self.line(&format!("# --- {} ---", comment_safe(title)));
        self.line(&format!("log {}", shell_quote(title)));
    }

    /// Переменная shell со значением в одинарных кавычках
    pub fn var(&mut self, name: &str, value: &str) {
        self.line(&format!("{}={}", name, shell_quote(value)));
    }

    /// Записывает файл целиком из heredoc без подстановок
    pub fn write_file(&mut self, path: &str, mode: &str, body: &str) -> Result<(), ScriptError> {
        if body.lines().any(|l| l.trim_end() == HEREDOC_DELIMITER) {
            return Err(ScriptError::UnsafeHeredoc(path.to_string()));
        }

        let quoted = shell_quote(path);
        self.line(&format!("install -d \"$(dirname {quoted})\""));
        self.line(&format!("cat > {quoted} <<'{HEREDOC_DELIMITER}'"));
        self.raw(body);
        self.line(HEREDOC_DELIMITER);
        self.line(&format!("chmod {mode} {quoted}"));
        Ok(())
    }

    pub fn finish(self) -> String {
        self.buf
    }
}

fn require(value: &str, role: ServerRole, field: &'static str) -> Result<(), ScriptError> {
    if value.trim().is_empty() {
        return Err(ScriptError::MissingField { role, field });
    }
    Ok(())
}

fn validate(inputs: &ScriptInputs<'_>) -> Result<(), ScriptError> {
    let server = inputs.server;
    let role = server.role();

    require(&server.name, role, "name")?;
    require(&server.ssh.username, role, "ssh_user")?;
    require(inputs.agent_token, role, "agent_token")?;
    require(inputs.agent_api_url, role, "control_url")?;

    if let RolePolicy::Zabbix(policy) = &server.policy {
        require(&policy.db_user, role, "db_user")?;
        let secrets = inputs.zabbix.as_ref().ok_or(ScriptError::MissingField {
            role,
            field: "db_password",
        })?;
        require(&secrets.db_password, role, "db_password")?;
        require(&secrets.db_root_password, role, "db_root_password")?;
    }
    Ok(())
}

fn os_check(script: &mut ScriptBuilder) {
    script.section("Проверка операционной системы");
    script.var("NOC_OS_ID", SUPPORTED_OS_ID);
    script.var("NOC_OS_VERSION", SUPPORTED_OS_VERSION);
    script.raw(
        r#"[ -r /etc/os-release ] || fail "Не найден /etc/os-release"
. /etc/os-release
if [ "${ID:-}" != "$NOC_OS_ID" ] || [ "${VERSION_ID:-}" != "$NOC_OS_VERSION" ]; then
    fail "Поддерживается только $NOC_OS_ID $NOC_OS_VERSION, обнаружено: ${PRETTY_NAME:-неизвестно}"
fi
[ "$(id -u)" -eq 0 ] || fail "Скрипт должен выполняться от имени root"
"#,
    );
}

fn base_packages(script: &mut ScriptBuilder) {
    script.section("Обновление списка пакетов");
    script.line("apt-get update -q");
    script.line("apt-get install -y -q ca-certificates curl jq");
}

/// Текст скрипта агента, опрашивающего панель управления
pub fn agent_script(server: &ManagedServer, agent_token: &str, agent_api_url: &str) -> String {
    const TEMPLATE: &str = r#"#!/bin/bash
# Агент noc_provisioner: получает команды панели управления и отправляет результат
SERVER_ID=@SERVER_ID@
SERVER_TYPE=@SERVER_TYPE@
API_URL=@API_URL@
POLL_INTERVAL=@POLL_INTERVAL@
export AGENT_TOKEN=@AGENT_TOKEN@

checkin() {
    jq -cn --arg id "$SERVER_ID" --arg type "$SERVER_TYPE" \
        '{serverId: $id, token: $ENV.AGENT_TOKEN, type: $type}' \
        | curl -fsS --max-time 20 -H 'Content-Type: application/json' \
            --data-binary @- "$API_URL/checkin"
}

report() {
    jq -cn --arg id "$SERVER_ID" --arg type "$SERVER_TYPE" --arg output "$1" --argjson code "$2" \
        --arg cid "$3" \
        '{serverId: $id, token: $ENV.AGENT_TOKEN, type: $type, output: $output, exitCode: $code,
          commandId: (if $cid == "" then null else $cid end)}' \
        | curl -fsS --max-time 20 -H 'Content-Type: application/json' \
            --data-binary @- "$API_URL/result" >/dev/null
}

while true; do
    RESPONSE=$(checkin 2>/dev/null) || RESPONSE=''
    COMMAND=$(printf '%s' "$RESPONSE" | jq -r '.command // empty' 2>/dev/null) || COMMAND=''
    COMMAND_ID=$(printf '%s' "$RESPONSE" | jq -r '.commandId // empty' 2>/dev/null) || COMMAND_ID=''
    if [ -n "$COMMAND" ]; then
        OUTPUT=$(bash -c "$COMMAND" 2>&1) && EXIT_CODE=0 || EXIT_CODE=$?
        OUTPUT=$(printf '%s' "$OUTPUT" | tail -c @MAX_OUTPUT@)
        report "$OUTPUT" "$EXIT_CODE" "$COMMAND_ID" || echo "noc-agent: не удалось отправить результат" >&2
    fi
    sleep "$POLL_INTERVAL"
done
"#;

    TEMPLATE
        .replace("@SERVER_ID@", &shell_quote(&server.id.to_string()))
        .replace("@SERVER_TYPE@", &shell_quote(server.role().as_str()))
        .replace("@API_URL@", &shell_quote(agent_api_url.trim_end_matches('/')))
        .replace("@POLL_INTERVAL@", &AGENT_POLL_INTERVAL_SECS.to_string())
        .replace("@AGENT_TOKEN@", &shell_quote(agent_token))
        .replace("@MAX_OUTPUT@", &MAX_OUTPUT_BYTES.to_string())
}

fn agent_unit() -> String {
    format!(
        r#"[Unit]
Description=noc_provisioner command agent
After=network-online.target
Wants=network-online.target

[Service]
Type=simple
ExecStart={AGENT_SCRIPT_PATH}
Restart=always
RestartSec=10
User=root

[Install]
WantedBy=multi-user.target
"#
    )
}

fn agent_files(script: &mut ScriptBuilder, inputs: &ScriptInputs<'_>) -> Result<(), ScriptError> {
    script.section("Установка агента");
    script.write_file(
        AGENT_SCRIPT_PATH,
        "0700",
        &agent_script(inputs.server, inputs.agent_token, inputs.agent_api_url),
    )?;
    script.write_file(
        &format!("/etc/systemd/system/{AGENT_UNIT_NAME}"),
        "0644",
        &agent_unit(),
    )?;
    Ok(())
}

fn agent_start(script: &mut ScriptBuilder) {
    script.section("Запуск агента");
    script.line("systemctl daemon-reload");
    script.line(&format!("systemctl enable {AGENT_UNIT_NAME}"));
    script.line(&format!(
        "systemctl restart {AGENT_UNIT_NAME} || fail \"Не удалось запустить агент\""
    ));
}

/// Генерирует полный скрипт установки для роли сервера
pub fn generate_install_script(inputs: &ScriptInputs<'_>) -> Result<String, ScriptError> {
    validate(inputs)?;
    let server = inputs.server;

    let mut script = ScriptBuilder::new(&format!(
        "Установка роли {} для {} ({})",
        server.role(),
        server.name,
        server.id
    ));
    os_check(&mut script);
    base_packages(&mut script);

    match &server.policy {
        RolePolicy::Dns(policy) => dns::configure(&mut script, server, policy)?,
        RolePolicy::Zabbix(policy) => {
            let secrets = inputs.zabbix.as_ref().ok_or(ScriptError::MissingField {
                role: ServerRole::Zabbix,
                field: "db_password",
            })?;
            zabbix::configure(&mut script, server, policy, secrets)?
        }
    }

    agent_files(&mut script, inputs)?;
    agent_start(&mut script);

    match &server.policy {
        RolePolicy::Dns(policy) => dns::restart_services(&mut script, policy),
        RolePolicy::Zabbix(policy) => zabbix::restart_services(&mut script, policy),
    }

    script.blank();
    script.line(&format!("echo {}", shell_quote(INSTALL_OK_MARKER)));
    Ok(script.finish())
}

/// Скрипт повторной установки только агента (тот же токен и адрес панели)
pub fn generate_agent_bootstrap(inputs: &ScriptInputs<'_>) -> Result<String, ScriptError> {
    let role = inputs.server.role();
    require(inputs.agent_token, role, "agent_token")?;
    require(inputs.agent_api_url, role, "control_url")?;

    let mut script = ScriptBuilder::new(&format!(
        "Переустановка агента для {} ({})",
        inputs.server.name, inputs.server.id
    ));
    script.section("Установка зависимостей агента");
    script.line("apt-get install -y -q curl jq");
    agent_files(&mut script, inputs)?;
    agent_start(&mut script);
    script.blank();
    script.line(&format!("echo {}", shell_quote(INSTALL_OK_MARKER)));
    Ok(script.finish())
}

/// Команда замены правил nftables, которую выполняет агент или SSH.
/// Новые правила проверяются `nft -c` до замены рабочего файла
pub fn firewall_update_command(ruleset: &str) -> Result<String, ScriptError> {
    let staged = format!("{NFTABLES_CONF_PATH}.new");
    let mut script = ScriptBuilder::default();
    script.line("set -e");
    script.write_file(&staged, "0755", ruleset)?;
    script.line(&format!(
        "nft -c -f {staged} && mv {staged} {NFTABLES_CONF_PATH} && systemctl restart nftables"
    ));
    script.line("echo \"nftables: правила обновлены\"");
    Ok(script.finish())
}
