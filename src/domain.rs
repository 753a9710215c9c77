use std::{collections::HashSet, net::IpAddr};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    EmptyAddress,
    InvalidAddress { value: String },
    DuplicateAddress { ip: String },
    MissingAddress { ip: String },
}

impl DomainError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyAddress | Self::InvalidAddress { .. } => "invalid_request",
            Self::DuplicateAddress { .. } => "conflict",
            Self::MissingAddress { .. } => "not_found",
        }
    }
}

impl std::fmt::Display for DomainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyAddress => write!(f, "no ip address provided"),
            Self::InvalidAddress { value } => write!(f, "{value} is not a valid ip address"),
            Self::DuplicateAddress { ip } => write!(f, "{ip} is already in the list"),
            Self::MissingAddress { ip } => write!(f, "ip {ip} not found"),
        }
    }
}

impl std::error::Error for DomainError {}

/// Validates an IPv4/IPv6 address and returns its canonical text form.
pub fn normalize_ip(input: &str) -> Result<String, DomainError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DomainError::EmptyAddress);
    }
    trimmed
        .parse::<IpAddr>()
        .map(|addr| addr.to_string())
        .map_err(|_| DomainError::InvalidAddress {
            value: trimmed.to_string(),
        })
}

/// Appends `input` to the end of `list`. Returns the stored form.
pub fn add_ip(list: &mut Vec<String>, input: &str) -> Result<String, DomainError> {
    let ip = normalize_ip(input)?;
    if list.iter().any(|existing| same_address(existing, &ip)) {
        return Err(DomainError::DuplicateAddress { ip });
    }
    list.push(ip.clone());
    Ok(ip)
}

/// Removes `input` from `list`, matching either its literal or canonical form.
pub fn remove_ip(list: &mut Vec<String>, input: &str) -> Result<String, DomainError> {
    let trimmed = input.trim();
    let canonical = normalize_ip(trimmed).ok();
    let position = list.iter().position(|existing| {
        existing == trimmed
            || canonical
                .as_deref()
                .is_some_and(|ip| same_address(existing, ip))
    });
    match position {
        Some(index) => Ok(list.remove(index)),
        None => Err(DomainError::MissingAddress {
            ip: trimmed.to_string(),
        }),
    }
}

/// Validates a whole replacement list, keeping caller order.
pub fn validate_list(items: &[String]) -> Result<Vec<String>, DomainError> {
    let mut seen = HashSet::with_capacity(items.len());
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let ip = normalize_ip(item)?;
        if !seen.insert(ip.clone()) {
            return Err(DomainError::DuplicateAddress { ip });
        }
        out.push(ip);
    }
    Ok(out)
}

// Entries written by hand may not be canonical.
fn same_address(existing: &str, canonical: &str) -> bool {
    existing == canonical
        || existing
            .parse::<IpAddr>()
            .is_ok_and(|addr| addr.to_string() == canonical)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn ips(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn normalize_accepts_v4_and_v6() {
        assert_eq!(normalize_ip(" 8.8.8.8 ").unwrap(), "8.8.8.8");
        assert_eq!(normalize_ip("2001:DB8:0::1").unwrap(), "2001:db8::1");
    }

    #[test]
    fn normalize_rejects_garbage() {
        assert_eq!(normalize_ip("   "), Err(DomainError::EmptyAddress));
        assert_eq!(
            normalize_ip("999.1.1.1"),
            Err(DomainError::InvalidAddress {
                value: "999.1.1.1".to_string()
            })
        );
        assert_eq!(normalize_ip("10.0.0.0/8").unwrap_err().code(), "invalid_request");
    }

    #[test]
    fn add_appends_and_rejects_duplicates() {
        let mut list = ips(&["8.8.8.8"]);
        assert_eq!(add_ip(&mut list, "1.1.1.1").unwrap(), "1.1.1.1");
        assert_eq!(list, ips(&["8.8.8.8", "1.1.1.1"]));

        let err = add_ip(&mut list, "8.8.8.8").unwrap_err();
        assert_eq!(err.code(), "conflict");
        assert_eq!(err.to_string(), "8.8.8.8 is already in the list");
    }

    #[test]
    fn add_detects_non_canonical_duplicates() {
        let mut list = ips(&["2001:db8:0:0::1"]);
        assert!(add_ip(&mut list, "2001:db8::1").is_err());
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn remove_matches_literal_or_canonical() {
        let mut list = ips(&["8.8.8.8", "2001:db8::1", "1.1.1.1"]);
        assert_eq!(remove_ip(&mut list, "2001:DB8::1").unwrap(), "2001:db8::1");
        assert_eq!(list, ips(&["8.8.8.8", "1.1.1.1"]));

        let err = remove_ip(&mut list, "9.9.9.9").unwrap_err();
        assert_eq!(err.code(), "not_found");
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn validate_list_keeps_order_and_rejects_duplicates() {
        let items = ips(&["9.9.9.9", " 1.1.1.1", "::1"]);
        assert_eq!(
            validate_list(&items).unwrap(),
            ips(&["9.9.9.9", "1.1.1.1", "::1"])
        );

        let dup = ips(&["1.1.1.1", "1.1.1.1"]);
        assert_eq!(
            validate_list(&dup),
            Err(DomainError::DuplicateAddress {
                ip: "1.1.1.1".to_string()
            })
        );
    }
}
