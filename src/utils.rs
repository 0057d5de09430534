use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;

static SOURCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<addr>[0-9A-Fa-f:.]+)(?:/(?P<len>\d{1,3}))?$").expect("valid source regex")
});

/// Семейство адресов для записи списка доступа
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrFamily {
    V4,
    V6,
}

/// Возвращает метку времени для строк журнала установки
pub fn timestamp() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// Определяет семейство адресов записи по её написанию
pub fn addr_family(entry: &str) -> AddrFamily {
    if entry.contains(':') {
        AddrFamily::V6
    } else {
        AddrFamily::V4
    }
}

/// Разбирает запись вида "адрес" или "адрес/префикс"
///
/// Возвращает семейство адресов, если запись корректна
pub fn parse_source(entry: &str) -> Option<AddrFamily> {
    let entry = entry.trim();
    let caps = SOURCE_RE.captures(entry)?;

    let addr: IpAddr = caps.name("addr")?.as_str().parse().ok()?;
    let max_len = match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };

    if let Some(len) = caps.name("len") {
        let len: u32 = len.as_str().parse().ok()?;
        if len > max_len {
            return None;
        }
    }

    Some(match addr {
        IpAddr::V4(_) => AddrFamily::V4,
        IpAddr::V6(_) => AddrFamily::V6,
    })
}

pub fn parse_ipv4(value: &str) -> Option<Ipv4Addr> {
    value.trim().parse().ok()
}

pub fn parse_ipv6(value: &str) -> Option<Ipv6Addr> {
    value.trim().parse().ok()
}

/// Обрезает строку до `max` байт, не разрывая UTF-8 символ
pub fn truncate_utf8(value: &str, max: usize) -> &str {
    if value.len() <= max {
        return value;
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_addresses_and_networks() {
        assert_eq!(parse_source("203.0.113.5"), Some(AddrFamily::V4));
        assert_eq!(parse_source(" 198.51.100.0/24 "), Some(AddrFamily::V4));
        assert_eq!(parse_source("2001:db8::/32"), Some(AddrFamily::V6));
        assert_eq!(parse_source("::1"), Some(AddrFamily::V6));
    }

    #[test]
    fn rejects_garbage_and_oversized_prefixes() {
        assert_eq!(parse_source("10.0.0.0/33"), None);
        assert_eq!(parse_source("2001:db8::/129"), None);
        assert_eq!(parse_source("example.com"), None);
        assert_eq!(parse_source("10.0.0.1; rm -rf /"), None);
        assert_eq!(parse_source(""), None);
    }

    #[test]
    fn truncates_on_char_boundary() {
        let text = "ошибка";
        let cut = truncate_utf8(text, 3);
        assert_eq!(cut, "о");
        assert_eq!(truncate_utf8("abc", 10), "abc");
    }
}
