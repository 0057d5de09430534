//! Сборка правил nftables для DNS-резолвера
//!
//! Порядок блоков фиксирован: скрипт установки и обновления правил через агента
//! пишут результат в `/etc/nftables.conf` как есть.

use std::collections::BTreeSet;

use crate::{
    config::ZABBIX_AGENT_PORT,
    models::DnsPolicy,
    utils::{self, AddrFamily},
};

/// Адреса, которые fail2ban никогда не блокирует
pub const DEFAULT_SSH_SOURCES: &[&str] = &["127.0.0.0/8", "::1/128"];

/// Сети, которым всегда разрешены DNS-запросы (IPv4)
pub const DEFAULT_DNS_SOURCES_V4: &[&str] = &[
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
];

/// Сети, которым всегда разрешены DNS-запросы (IPv6)
pub const DEFAULT_DNS_SOURCES_V6: &[&str] = &["::1/128", "fc00::/7", "fe80::/10"];

pub const INSECURE_SSH_MARKER: &str = "INSECURE: SSH open to any source";

const INDENT: &str = "        ";

/// Входные данные компилятора
#[derive(Debug, Clone, Copy)]
pub struct FirewallPolicy<'a> {
    pub ssh_port: u16,
    pub ssh_allow: &'a [String],
    pub dns_allow_v4: &'a [String],
    pub dns_allow_v6: &'a [String],
}

impl<'a> FirewallPolicy<'a> {
    pub fn from_dns(ssh_port: u16, policy: &'a DnsPolicy) -> Self {
        Self {
            ssh_port,
            ssh_allow: &policy.ssh_allow,
            dns_allow_v4: &policy.dns_allow_v4,
            dns_allow_v6: &policy.dns_allow_v6,
        }
    }
}

/// Объединяет значения по умолчанию и список оператора.
/// Дедупликация по точному совпадению строки после trim, результат отсортирован
pub fn merge_sources(defaults: &[&str], extra: &[String]) -> Vec<String> {
    defaults
        .iter()
        .map(|s| s.trim())
        .chain(extra.iter().map(|s| s.trim()))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Список ignoreip для fail2ban
pub fn fail2ban_ignore_list(ssh_allow: &[String]) -> Vec<String> {
    merge_sources(DEFAULT_SSH_SOURCES, ssh_allow)
}

fn ssh_ports(ssh_port: u16) -> String {
    let ports: BTreeSet<u16> = [22, ssh_port].into_iter().collect();
    if ports.len() == 1 {
        return ports.iter().map(u16::to_string).collect();
    }
    let list: Vec<String> = ports.iter().map(u16::to_string).collect();
    format!("{{ {} }}", list.join(", "))
}

fn saddr_keyword(entry: &str) -> &'static str {
    match utils::addr_family(entry) {
        AddrFamily::V4 => "ip saddr",
        AddrFamily::V6 => "ip6 saddr",
    }
}

/// Компилирует полный набор правил nftables
pub fn compile(policy: &FirewallPolicy<'_>) -> String {
    let mut rules: Vec<String> = Vec::new();
    fn push(rules: &mut Vec<String>, line: &str) {
        rules.push(format!("{INDENT}{line}"));
    }

    push(&mut rules, "# Установленные соединения и loopback");
    push(&mut rules, "ct state established,related accept");
    push(&mut rules, "iif \"lo\" accept");
    rules.push(String::new());

    push(&mut rules, "# ICMP");
    push(&mut rules, "ip protocol icmp accept");
    push(&mut rules, "ip6 nexthdr ipv6-icmp accept");
    rules.push(String::new());

    push(&mut rules, "# SSH");
    let ports = ssh_ports(policy.ssh_port);
    let ssh_sources = merge_sources(&[], policy.ssh_allow);
    if ssh_sources.is_empty() {
        push(&mut rules, &format!("tcp dport {ports} accept comment \"{INSECURE_SSH_MARKER}\""));
    } else {
        for source in &ssh_sources {
            let keyword = saddr_keyword(source);
            push(&mut rules, &format!("{keyword} {source} tcp dport {ports} accept"));
        }
    }
    rules.push(String::new());

    push(&mut rules, "# DNS IPv4");
    for source in merge_sources(DEFAULT_DNS_SOURCES_V4, policy.dns_allow_v4) {
        push(&mut rules, &format!("ip saddr {source} udp dport 53 accept"));
        push(&mut rules, &format!("ip saddr {source} tcp dport 53 accept"));
    }
    rules.push(String::new());

    push(&mut rules, "# DNS IPv6");
    for source in merge_sources(DEFAULT_DNS_SOURCES_V6, policy.dns_allow_v6) {
        push(&mut rules, &format!("ip6 saddr {source} udp dport 53 accept"));
        push(&mut rules, &format!("ip6 saddr {source} tcp dport 53 accept"));
    }
    rules.push(String::new());

    push(&mut rules, "# Zabbix agent");
    push(&mut rules, &format!("tcp dport {ZABBIX_AGENT_PORT} accept"));
    rules.push(String::new());

    push(&mut rules, "# Всё остальное отбрасывается с записью в журнал");
    push(&mut rules, "log prefix \"nft-input-drop: \" level info drop");

    format!(
        r#"#!/usr/sbin/nft -f
# Сгенерировано noc_provisioner, ручные изменения будут перезаписаны

flush ruleset

table inet filter {{
    chain input {{
        type filter hook input priority 0; policy drop;

{rules}
    }}

    chain forward {{
        type filter hook forward priority 0; policy drop;
    }}

    chain output {{
        type filter hook output priority 0; policy accept;
    }}
}}
"#,
        rules = rules.join("\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_ssh_list_opens_ssh_with_marker() {
        let empty: Vec<String> = Vec::new();
        let rules = compile(&FirewallPolicy {
            ssh_port: 22,
            ssh_allow: &empty,
            dns_allow_v4: &empty,
            dns_allow_v6: &empty,
        });
        assert!(rules.contains(INSECURE_SSH_MARKER));
        assert!(rules.contains("tcp dport 22 accept comment"));
    }

    #[test]
    fn restricted_ssh_has_no_open_rule() {
        let ssh = strings(&["203.0.113.5"]);
        let dns_v4 = strings(&["198.51.100.0/24"]);
        let empty: Vec<String> = Vec::new();
        let rules = compile(&FirewallPolicy {
            ssh_port: 2222,
            ssh_allow: &ssh,
            dns_allow_v4: &dns_v4,
            dns_allow_v6: &empty,
        });

        assert!(!rules.contains(INSECURE_SSH_MARKER));
        assert!(rules.contains("ip saddr 203.0.113.5 tcp dport { 22, 2222 } accept"));
        for source in DEFAULT_DNS_SOURCES_V4.iter().copied().chain(["198.51.100.0/24"]) {
            assert!(rules.contains(&format!("ip saddr {source} udp dport 53 accept")));
            assert!(rules.contains(&format!("ip saddr {source} tcp dport 53 accept")));
        }
        // Ни одного правила SSH без источника
        assert!(!rules
            .lines()
            .any(|l| l.trim_start().starts_with("tcp dport { 22, 2222 }")));
    }

    #[test]
    fn ipv6_ssh_source_uses_ip6_keyword() {
        let ssh = strings(&["2001:db8::5"]);
        let empty: Vec<String> = Vec::new();
        let rules = compile(&FirewallPolicy {
            ssh_port: 22,
            ssh_allow: &ssh,
            dns_allow_v4: &empty,
            dns_allow_v6: &empty,
        });
        assert!(rules.contains("ip6 saddr 2001:db8::5 tcp dport 22 accept"));
    }

    #[test]
    fn order_of_input_does_not_matter() {
        let a = strings(&["198.51.100.0/24", " 10.0.0.0/8", "203.0.113.0/24"]);
        let b = strings(&["203.0.113.0/24", "198.51.100.0/24", "198.51.100.0/24"]);
        let ssh = strings(&["192.0.2.1", "192.0.2.2"]);
        let ssh_rev = strings(&["192.0.2.2", "192.0.2.1"]);
        let empty: Vec<String> = Vec::new();

        let first = compile(&FirewallPolicy {
            ssh_port: 22,
            ssh_allow: &ssh,
            dns_allow_v4: &a,
            dns_allow_v6: &empty,
        });
        let second = compile(&FirewallPolicy {
            ssh_port: 22,
            ssh_allow: &ssh_rev,
            dns_allow_v4: &b,
            dns_allow_v6: &empty,
        });
        assert_eq!(first, second);
        assert_eq!(first.matches("ip saddr 10.0.0.0/8 udp dport 53").count(), 1);
    }

    #[test]
    fn no_subsumption_is_performed() {
        let merged = merge_sources(&["10.0.0.0/8"], &strings(&["10.1.2.3/32"]));
        assert_eq!(merged, strings(&["10.0.0.0/8", "10.1.2.3/32"]));
    }

    #[test]
    fn structure_order_is_fixed() {
        let empty: Vec<String> = Vec::new();
        let rules = compile(&FirewallPolicy {
            ssh_port: 22,
            ssh_allow: &empty,
            dns_allow_v4: &empty,
            dns_allow_v6: &empty,
        });
        let pos = |needle: &str| rules.find(needle).unwrap();
        assert!(pos("ct state established,related accept") < pos("ip protocol icmp accept"));
        assert!(pos("ip6 nexthdr ipv6-icmp accept") < pos("# SSH"));
        assert!(pos("# SSH") < pos("# DNS IPv4"));
        assert!(pos("# DNS IPv4") < pos("# DNS IPv6"));
        assert!(pos("# DNS IPv6") < pos("tcp dport 10050 accept"));
        assert!(pos("tcp dport 10050 accept") < pos("log prefix"));
        assert!(pos("log prefix") < pos("chain forward"));
        assert!(rules.contains("hook output priority 0; policy accept;"));
    }

    #[test]
    fn fail2ban_ignores_loopback_and_allowed_ssh() {
        let ignore = fail2ban_ignore_list(&strings(&["203.0.113.5"]));
        assert_eq!(ignore, strings(&["127.0.0.0/8", "203.0.113.5", "::1/128"]));
    }
}
