//! Роль сервера мониторинга: MariaDB, Zabbix 7.0, веб-интерфейс и Grafana

use crate::{
    bash_script::{ScriptBuilder, ScriptError, ZabbixSecrets},
    models::{ManagedServer, ZabbixPolicy},
    security::{comment_safe, php_literal, sql_literal},
};

pub const ZABBIX_DB_NAME: &str = "zabbix";
pub const ZABBIX_RELEASE_DEB: &str = "zabbix-release_latest_7.0+debian12_all.deb";
pub const ZABBIX_REPO_URL: &str =
    "https://repo.zabbix.com/zabbix/7.0/debian/pool/main/z/zabbix-release";
pub const BOOTSTRAP_SQL_PATH: &str = "/root/noc-zabbix-bootstrap.sql";
pub const SERVER_DB_CONF_PATH: &str = "/etc/zabbix/noc-database.conf";
pub const SERVER_CONF_PATH: &str = "/etc/zabbix/zabbix_server.conf";
pub const FRONTEND_CONF_PATH: &str = "/etc/zabbix/web/zabbix.conf.php";
pub const GRAFANA_ZABBIX_PLUGIN: &str = "alexanderzobnin-zabbix-app";

/// SQL первичной настройки MariaDB.
///
/// Повторный запуск безопасен: база и пользователь создаются только если их нет,
/// root сохраняет вход через unix_socket, поэтому повторная установка не требует
/// старого пароля.
pub fn bootstrap_sql(policy: &ZabbixPolicy, secrets: &ZabbixSecrets) -> String {
    let user = sql_literal(&policy.db_user);
    let password = sql_literal(&secrets.db_password);
    let root_password = sql_literal(&secrets.db_root_password);
    format!(
        r#"CREATE DATABASE IF NOT EXISTS {ZABBIX_DB_NAME} CHARACTER SET utf8mb4 COLLATE utf8mb4_bin;
CREATE USER IF NOT EXISTS {user}@'localhost' IDENTIFIED BY {password};
ALTER USER {user}@'localhost' IDENTIFIED BY {password};
GRANT ALL PRIVILEGES ON {ZABBIX_DB_NAME}.* TO {user}@'localhost';
SET GLOBAL log_bin_trust_function_creators = 1;
ALTER USER 'root'@'localhost' IDENTIFIED VIA unix_socket OR mysql_native_password USING PASSWORD({root_password});
FLUSH PRIVILEGES;
"#
    )
}

/// Параметры подключения zabbix_server к базе (подключается через Include)
pub fn server_db_config(policy: &ZabbixPolicy, secrets: &ZabbixSecrets) -> String {
    format!(
        "DBHost=localhost\nDBName={ZABBIX_DB_NAME}\nDBUser={}\nDBPassword={}\n",
        policy.db_user, secrets.db_password
    )
}

pub fn frontend_config(
    server: &ManagedServer,
    policy: &ZabbixPolicy,
    secrets: &ZabbixSecrets,
) -> String {
    format!(
        r#"<?php
// Сгенерировано noc_provisioner
$DB['TYPE']     = 'MYSQL';
$DB['SERVER']   = 'localhost';
$DB['PORT']     = '0';
$DB['DATABASE'] = '{ZABBIX_DB_NAME}';
$DB['USER']     = {user};
$DB['PASSWORD'] = {password};
$DB['SCHEMA']   = '';

$DB['ENCRYPTION']              = false;
$DB['KEY_FILE']                = '';
$DB['CERT_FILE']               = '';
$DB['CA_FILE']                 = '';
$DB['VERIFY_HOST']             = false;
$DB['CIPHER_LIST']             = '';
$DB['VAULT_URL']               = '';
$DB['VAULT_DB_PATH']           = '';
$DB['VAULT_TOKEN']             = '';
$DB['DOUBLE_IEEE754']          = true;

$ZBX_SERVER_NAME      = {name};
$IMAGE_FORMAT_DEFAULT = IMAGE_FORMAT_PNG;
"#,
        user = php_literal(&policy.db_user),
        password = php_literal(&secrets.db_password),
        name = php_literal(&comment_safe(&server.name)),
    )
}

fn check_config_value(value: &str, path: &str) -> Result<(), ScriptError> {
    // Файлы конфигурации Zabbix построчные
    if value.contains('\n') || value.contains('\r') {
        return Err(ScriptError::UnsafeHeredoc(path.to_string()));
    }
    Ok(())
}

/// Репозиторий, пакеты, база данных и конфигурация Zabbix
pub fn configure(
    script: &mut ScriptBuilder,
    server: &ManagedServer,
    policy: &ZabbixPolicy,
    secrets: &ZabbixSecrets,
) -> Result<(), ScriptError> {
    check_config_value(&secrets.db_password, SERVER_DB_CONF_PATH)?;

    script.section("Подключение репозитория Zabbix");
    script.var("ZBX_RELEASE_DEB", ZABBIX_RELEASE_DEB);
    script.var("ZBX_REPO_URL", ZABBIX_REPO_URL);
    script.raw(
        r#"curl -fsSL -o "/tmp/$ZBX_RELEASE_DEB" "$ZBX_REPO_URL/$ZBX_RELEASE_DEB"
dpkg -i "/tmp/$ZBX_RELEASE_DEB"
rm -f "/tmp/$ZBX_RELEASE_DEB""#,
    );

    if policy.install_grafana {
        script.section("Подключение репозитория Grafana");
        script.raw(
            r#"apt-get install -y -q gnupg apt-transport-https
curl -fsSL https://apt.grafana.com/gpg.key | gpg --dearmor --yes -o /usr/share/keyrings/grafana.gpg
echo "deb [signed-by=/usr/share/keyrings/grafana.gpg] https://apt.grafana.com stable main" > /etc/apt/sources.list.d/grafana.list"#,
        );
    }

    script.section("Установка пакетов Zabbix");
    script.line("apt-get update -q");
    script.line(
        "apt-get install -y -q mariadb-server zabbix-server-mysql zabbix-frontend-php \
         php8.2-mysql zabbix-apache-conf zabbix-sql-scripts zabbix-agent locales",
    );
    if policy.install_grafana {
        script.line("apt-get install -y -q grafana");
    }
    script.line("sed -i 's/^# *en_US.UTF-8 UTF-8/en_US.UTF-8 UTF-8/' /etc/locale.gen");
    script.line("locale-gen");

    script.section("Настройка MariaDB");
    script.line("systemctl enable --now mariadb");
    script.write_file(BOOTSTRAP_SQL_PATH, "0600", &bootstrap_sql(policy, secrets))?;
    script.line(&format!(
        "mysql --protocol=socket -uroot < {BOOTSTRAP_SQL_PATH} || fail \"Не удалось настроить MariaDB\""
    ));
    script.line(&format!("rm -f {BOOTSTRAP_SQL_PATH}"));

    script.section("Импорт схемы Zabbix");
    script.var("ZBX_DB", ZABBIX_DB_NAME);
    script.raw(
        r#"TABLES=$(mysql --protocol=socket -uroot -N -e "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema='$ZBX_DB'")
if [ "$TABLES" = "0" ]; then
    zcat /usr/share/zabbix-sql-scripts/mysql/server.sql.gz \
        | mysql --protocol=socket --default-character-set=utf8mb4 -uroot "$ZBX_DB"
else
    log "Схема Zabbix уже импортирована"
fi
mysql --protocol=socket -uroot -e "SET GLOBAL log_bin_trust_function_creators = 0;""#,
    );

    script.section("Настройка Zabbix server");
    script.write_file(SERVER_DB_CONF_PATH, "0640", &server_db_config(policy, secrets))?;
    script.raw(&format!(
        r#"chown root:zabbix {SERVER_DB_CONF_PATH}
sed -i -E '/^(DBHost|DBName|DBUser|DBPassword)=/d' {SERVER_CONF_PATH}
grep -qx 'Include={SERVER_DB_CONF_PATH}' {SERVER_CONF_PATH} || echo 'Include={SERVER_DB_CONF_PATH}' >> {SERVER_CONF_PATH}"#
    ));

    script.section("Настройка веб-интерфейса Zabbix");
    script.write_file(FRONTEND_CONF_PATH, "0640", &frontend_config(server, policy, secrets))?;
    script.line(&format!("chown www-data:www-data {FRONTEND_CONF_PATH}"));

    if policy.install_grafana {
        script.section("Установка плагина Zabbix для Grafana");
        script.line(&format!(
            "grafana-cli plugins install {GRAFANA_ZABBIX_PLUGIN} || warn \"Не удалось установить плагин {GRAFANA_ZABBIX_PLUGIN}\""
        ));
    }
    Ok(())
}

pub fn restart_services(script: &mut ScriptBuilder, policy: &ZabbixPolicy) {
    script.section("Перезапуск служб Zabbix");
    script.line("systemctl enable mariadb zabbix-server zabbix-agent apache2");
    script.line("systemctl restart mariadb || fail \"Не удалось перезапустить MariaDB\"");
    script.line("systemctl restart zabbix-server || fail \"Не удалось перезапустить zabbix-server\"");
    script.line("systemctl restart zabbix-agent || warn \"Не удалось перезапустить zabbix-agent\"");
    script.line("systemctl restart apache2 || fail \"Не удалось перезапустить apache2\"");
    if policy.install_grafana {
        script.line("systemctl enable grafana-server");
        script.line("systemctl restart grafana-server || warn \"Не удалось перезапустить Grafana\"");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tests::{test_vault, zabbix_definition};

    fn server() -> ManagedServer {
        zabbix_definition().into_record(&test_vault()).unwrap().0
    }

    fn secrets() -> ZabbixSecrets {
        ZabbixSecrets {
            db_password: "Db'Passw0rd".to_string(),
            db_root_password: r"R00t\pass".to_string(),
        }
    }

    #[test]
    fn bootstrap_escapes_passwords() {
        let server = server();
        let sql = bootstrap_sql(server.zabbix_policy().unwrap(), &secrets());
        assert!(sql.contains("CHARACTER SET utf8mb4 COLLATE utf8mb4_bin"));
        assert!(sql.contains("IDENTIFIED BY 'Db''Passw0rd'"));
        assert!(sql.contains(r"USING PASSWORD('R00t\\pass')"));
        assert!(sql.contains("GRANT ALL PRIVILEGES ON zabbix.* TO 'zabbix'@'localhost'"));
    }

    #[test]
    fn frontend_uses_php_literals() {
        let mut server = server();
        server.name = "Mon'itor".to_string();
        let php = frontend_config(&server, server.zabbix_policy().unwrap(), &secrets());
        assert!(php.contains(r"$DB['PASSWORD'] = 'Db\'Passw0rd';"));
        assert!(php.contains(r"$ZBX_SERVER_NAME      = 'Mon\'itor';"));
    }

    #[test]
    fn multiline_password_is_rejected() {
        let server = server();
        let mut bad = secrets();
        bad.db_password = "a\nDBHost=evil".to_string();
        let mut script = ScriptBuilder::default();
        assert!(configure(&mut script, &server, server.zabbix_policy().unwrap(), &bad).is_err());
    }

    #[test]
    fn grafana_is_optional() {
        let server = server();
        let mut policy = server.zabbix_policy().unwrap().clone();

        let mut with = ScriptBuilder::default();
        configure(&mut with, &server, &policy, &secrets()).unwrap();
        let with = with.finish();
        assert!(with.contains("apt-get install -y -q grafana"));
        assert!(with.contains(GRAFANA_ZABBIX_PLUGIN));

        policy.install_grafana = false;
        let mut without = ScriptBuilder::default();
        configure(&mut without, &server, &policy, &secrets()).unwrap();
        restart_services(&mut without, &policy);
        let without = without.finish();
        assert!(!without.contains("grafana"));
    }

    #[test]
    fn monitoring_server_restart_is_fatal() {
        let server = server();
        let mut script = ScriptBuilder::default();
        restart_services(&mut script, server.zabbix_policy().unwrap());
        let text = script.finish();
        assert!(text.contains("restart zabbix-server || fail"));
        assert!(text.contains("restart grafana-server || warn"));
    }
}
