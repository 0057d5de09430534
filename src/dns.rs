//! Роль DNS-резолвера: Unbound, nftables, fail2ban и анонс anycast через FRR

use std::net::IpAddr;

use crate::{
    bash_script::{ScriptBuilder, ScriptError},
    config::{DNS_CHECK_EXIT_CODE, NFTABLES_CONF_PATH},
    firewall::{self, FirewallPolicy},
    models::{DnsPolicy, ManagedServer},
    security::comment_safe,
};

pub const UNBOUND_CONF_PATH: &str = "/etc/unbound/unbound.conf.d/noc-resolver.conf";
pub const UNBOUND_LOG_CONF_PATH: &str = "/etc/unbound/unbound.conf.d/noc-logging.conf";
pub const FAIL2BAN_JAIL_PATH: &str = "/etc/fail2ban/jail.d/noc-sshd.local";
pub const ANYCAST_INTERFACES_PATH: &str = "/etc/network/interfaces.d/noc-anycast";
pub const FRR_CONF_PATH: &str = "/etc/frr/frr.conf";

/// Подставляется в frr.conf и заменяется на интерфейс маршрута по умолчанию
const UPLINK_PLACEHOLDER: &str = "__UPLINK__";

/// Dummy-интерфейс для одного anycast адреса
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnycastInterface {
    pub name: String,
    pub address: IpAddr,
}

impl AnycastInterface {
    fn prefix(&self) -> u8 {
        if self.address.is_ipv4() {
            32
        } else {
            128
        }
    }
}

/// Назначает интерфейсы anycast0..N: сначала IPv4, затем IPv6
pub fn anycast_interfaces(policy: &DnsPolicy) -> Vec<AnycastInterface> {
    policy
        .loopback_v4
        .iter()
        .map(|a| IpAddr::V4(*a))
        .chain(policy.loopback_v6.iter().map(|a| IpAddr::V6(*a)))
        .enumerate()
        .map(|(i, address)| AnycastInterface {
            name: format!("anycast{i}"),
            address,
        })
        .collect()
}

fn ipv6_enabled(server: &ManagedServer, policy: &DnsPolicy) -> bool {
    server.ipv6.is_some() || !policy.loopback_v6.is_empty()
}

/// Основной конфиг Unbound: интерфейсы, ACL и параметры кеша
pub fn unbound_config(server: &ManagedServer, policy: &DnsPolicy) -> String {
    let with_v6 = ipv6_enabled(server, policy);
    let mut lines = vec![
        format!("# Резолвер {}", comment_safe(&server.name)),
        "server:".to_string(),
        "    interface: 0.0.0.0".to_string(),
    ];
    if with_v6 {
        lines.push("    interface: ::0".to_string());
    }
    lines.extend(
        [
            "ip-freebind: yes",
            "port: 53",
            "do-ip4: yes",
            if with_v6 { "do-ip6: yes" } else { "do-ip6: no" },
            "do-udp: yes",
            "do-tcp: yes",
            "num-threads: 2",
            "so-reuseport: yes",
            "hide-identity: yes",
            "hide-version: yes",
            "harden-glue: yes",
            "harden-dnssec-stripped: yes",
            "qname-minimisation: yes",
            "prefetch: yes",
            "cache-min-ttl: 60",
            "cache-max-ttl: 86400",
            "msg-cache-size: 64m",
            "rrset-cache-size: 128m",
            "access-control: 0.0.0.0/0 refuse",
            "access-control: ::0/0 refuse",
        ]
        .iter()
        .map(|l| format!("    {l}")),
    );

    // ACL резолвера совпадает с DNS правилами межсетевого экрана
    let sources = firewall::merge_sources(firewall::DEFAULT_DNS_SOURCES_V4, &policy.dns_allow_v4)
        .into_iter()
        .chain(firewall::merge_sources(
            firewall::DEFAULT_DNS_SOURCES_V6,
            &policy.dns_allow_v6,
        ));
    for source in sources {
        lines.push(format!("    access-control: {source} allow"));
    }

    let mut config = lines.join("\n");
    config.push('\n');
    config
}

pub fn unbound_logging_config() -> String {
    r#"server:
    use-syslog: yes
    verbosity: 1
    log-queries: no
    log-replies: no
    log-servfail: yes
    val-log-level: 1
"#
    .to_string()
}

/// Jail fail2ban для SSH на настроенном порту
pub fn fail2ban_jail(ssh_port: u16, ssh_allow: &[String]) -> String {
    let ignore = firewall::fail2ban_ignore_list(ssh_allow).join(" ");
    format!(
        r#"[DEFAULT]
ignoreip = {ignore}
banaction = nftables-multiport
banaction_allports = nftables-allports
backend = systemd

[sshd]
enabled = true
port = {ssh_port}
maxretry = 5
findtime = 10m
bantime = 1h
"#
    )
}

/// Описание dummy-интерфейсов для ifupdown
pub fn anycast_interfaces_config(interfaces: &[AnycastInterface]) -> String {
    let mut blocks = Vec::with_capacity(interfaces.len());
    for iface in interfaces {
        let family = if iface.address.is_ipv4() { "" } else { "-6 " };
        blocks.push(format!(
            r#"auto {name}
iface {name} inet manual
    pre-up ip link add {name} type dummy 2>/dev/null || true
    up ip link set {name} up
    up ip {family}addr add {addr}/{prefix} dev {name}
    down ip link del {name}
"#,
            name = iface.name,
            addr = iface.address,
            prefix = iface.prefix(),
        ));
    }
    blocks.join("\n")
}

/// Конфигурация FRR: ospfd для IPv4 адресов, ospf6d для IPv6
pub fn frr_config(server: &ManagedServer, interfaces: &[AnycastInterface]) -> String {
    let has_v4 = interfaces.iter().any(|i| i.address.is_ipv4());
    let has_v6 = interfaces.iter().any(|i| i.address.is_ipv6());

    let mut out = vec![
        format!("! Anycast для {}", comment_safe(&server.name)),
        "frr defaults traditional".to_string(),
        "log syslog informational".to_string(),
        "service integrated-vtysh-config".to_string(),
        "!".to_string(),
    ];

    for iface in interfaces {
        out.push(format!("interface {}", iface.name));
        if iface.address.is_ipv4() {
            out.push(" ip ospf area 0.0.0.0".to_string());
            out.push(" ip ospf passive".to_string());
        } else {
            out.push(" ipv6 ospf6 area 0.0.0.0".to_string());
            out.push(" ipv6 ospf6 passive".to_string());
        }
        out.push("!".to_string());
    }

    out.push(format!("interface {UPLINK_PLACEHOLDER}"));
    if has_v4 {
        out.push(" ip ospf area 0.0.0.0".to_string());
    }
    if has_v6 {
        out.push(" ipv6 ospf6 area 0.0.0.0".to_string());
    }
    out.push("!".to_string());

    if has_v4 {
        out.push("router ospf".to_string());
        out.push(format!(" ospf router-id {}", server.ipv4));
        out.push("!".to_string());
    }
    if has_v6 {
        out.push("router ospf6".to_string());
        out.push(format!(" ospf6 router-id {}", server.ipv4));
        out.push("!".to_string());
    }
    out.push("line vty".to_string());
    out.push("!".to_string());

    let mut config = out.join("\n");
    config.push('\n');
    config
}

/// Пакеты, установка конфигурации и anycast для роли DNS
pub fn configure(
    script: &mut ScriptBuilder,
    server: &ManagedServer,
    policy: &DnsPolicy,
) -> Result<(), ScriptError> {
    let anycast = anycast_interfaces(policy);

    script.section("Установка пакетов DNS");
    let mut packages = "unbound nftables fail2ban python3-systemd bind9-dnsutils".to_string();
    if !anycast.is_empty() {
        packages.push_str(" frr");
    }
    script.line(&format!("apt-get install -y -q {packages}"));

    script.section("Настройка Unbound");
    script.raw(
        r#"if systemctl is-active --quiet systemd-resolved; then
    systemctl disable --now systemd-resolved
fi"#,
    );
    script.write_file(UNBOUND_CONF_PATH, "0644", &unbound_config(server, policy))?;
    script.write_file(UNBOUND_LOG_CONF_PATH, "0644", &unbound_logging_config())?;
    script.line("unbound-checkconf || fail \"Конфигурация Unbound содержит ошибки\"");

    script.section("Настройка nftables");
    let rules = firewall::compile(&FirewallPolicy::from_dns(server.ssh.port, policy));
    script.write_file(NFTABLES_CONF_PATH, "0755", &rules)?;
    script.line(&format!(
        "nft -c -f {NFTABLES_CONF_PATH} || fail \"Правила nftables содержат ошибки\""
    ));

    script.section("Настройка fail2ban");
    script.write_file(
        FAIL2BAN_JAIL_PATH,
        "0644",
        &fail2ban_jail(server.ssh.port, &policy.ssh_allow),
    )?;

    if anycast.is_empty() {
        return Ok(());
    }

    script.section("Настройка anycast интерфейсов");
    script.write_file(
        ANYCAST_INTERFACES_PATH,
        "0644",
        &anycast_interfaces_config(&anycast),
    )?;
    for iface in &anycast {
        script.line(&format!(
            "ifquery --state {name} >/dev/null 2>&1 || ifup {name}",
            name = iface.name
        ));
    }

    script.section("Настройка FRR");
    let has_v4 = anycast.iter().any(|i| i.address.is_ipv4());
    let has_v6 = anycast.iter().any(|i| i.address.is_ipv6());
    if has_v4 {
        script.line("sed -i 's/^ospfd=no/ospfd=yes/' /etc/frr/daemons");
    }
    if has_v6 {
        script.line("sed -i 's/^ospf6d=no/ospf6d=yes/' /etc/frr/daemons");
    }
    script.write_file(FRR_CONF_PATH, "0640", &frr_config(server, &anycast))?;
    script.raw(&format!(
        r#"UPLINK=$(ip -o route show default | awk '{{print $5; exit}}')
[ -n "$UPLINK" ] || fail "Не найден интерфейс маршрута по умолчанию"
sed -i "s/{UPLINK_PLACEHOLDER}/$UPLINK/" {FRR_CONF_PATH}
chown frr:frr {FRR_CONF_PATH}"#
    ));
    Ok(())
}

/// Перезапуск служб и самопроверка резолвера.
/// Если резолвер не отвечает, скрипт завершается с кодом `DNS_CHECK_EXIT_CODE`
pub fn restart_services(script: &mut ScriptBuilder, policy: &DnsPolicy) {
    script.section("Перезапуск служб DNS");
    script.line("systemctl enable nftables fail2ban unbound");
    script.line("systemctl restart nftables || warn \"Не удалось перезапустить nftables\"");
    script.line("systemctl restart fail2ban || warn \"Не удалось перезапустить fail2ban\"");
    if policy.has_loopbacks() {
        script.line("systemctl enable frr");
        script.line("systemctl restart frr || warn \"Не удалось перезапустить FRR\"");
    }
    script.line("systemctl restart unbound || fail \"Не удалось перезапустить Unbound\"");

    script.section("Проверка резолвера");
    script.raw(&format!(
        r#"sleep 2
if ! dig +time=3 +tries=2 @127.0.0.1 . NS >/dev/null; then
    echo "[noc] ERROR: Unbound не отвечает на запросы" >&2
    exit {DNS_CHECK_EXIT_CODE}
fi
log "Unbound отвечает на запросы""#
    ));
}
