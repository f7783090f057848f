//! Input validation shared by the environment and sandbox services.

use std::sync::OnceLock;

use islet_db::PortMapping;
use regex::Regex;

use crate::KernelError;

pub const CPU_MIN: f64 = 0.25;
pub const CPU_MAX: f64 = 4.0;
pub const CPU_DEFAULT: f64 = 2.0;
pub const MEMORY_MB_MIN: i64 = 128;
pub const MEMORY_MB_MAX: i64 = 2048;
pub const MEMORY_MB_DEFAULT: i64 = 512;
pub const MAX_PORTS: usize = 10;
pub const TTL_SECONDS_MIN: i64 = 60;
pub const TTL_SECONDS_MAX: i64 = 604_800;
pub const PASSWORD_MIN: usize = 8;
pub const PASSWORD_MAX: usize = 128;

fn image_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^[a-z0-9][a-z0-9._\-/]*(:[\w][\w.\-]*)?$").expect("image regex")
    })
}

fn secret_key_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z_][A-Z0-9_]*$").expect("secret key regex"))
}

pub fn resource_name(name: &str) -> Result<(), KernelError> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.len() > 100 {
        return Err(KernelError::Validation(
            "name must be 1..100 characters".to_string(),
        ));
    }
    Ok(())
}

pub fn image_name(image: &str) -> Result<(), KernelError> {
    if image.is_empty() || image.len() > 500 || !image_regex().is_match(image) {
        return Err(KernelError::Validation(format!(
            "invalid image reference: {image}"
        )));
    }
    Ok(())
}

pub fn cpu(value: f64) -> Result<(), KernelError> {
    if !(CPU_MIN..=CPU_MAX).contains(&value) {
        return Err(KernelError::Validation(format!(
            "cpu must be within {CPU_MIN}..{CPU_MAX}"
        )));
    }
    Ok(())
}

pub fn memory_mb(value: i64) -> Result<(), KernelError> {
    if !(MEMORY_MB_MIN..=MEMORY_MB_MAX).contains(&value) {
        return Err(KernelError::Validation(format!(
            "memory must be within {MEMORY_MB_MIN}..{MEMORY_MB_MAX} MB"
        )));
    }
    Ok(())
}

pub fn ports(mappings: &[PortMapping]) -> Result<(), KernelError> {
    if mappings.len() > MAX_PORTS {
        return Err(KernelError::Validation(format!(
            "at most {MAX_PORTS} port mappings are allowed"
        )));
    }
    for mapping in mappings {
        if !mapping.is_valid() {
            return Err(KernelError::Validation(format!(
                "invalid port mapping {}:{} (container 1..65535, host 1024..65535)",
                mapping.container, mapping.host
            )));
        }
    }
    Ok(())
}

pub fn secret_key(key: &str) -> Result<(), KernelError> {
    if key.is_empty() || key.len() > 100 || !secret_key_regex().is_match(key) {
        return Err(KernelError::Validation(format!(
            "secret key must match [A-Z_][A-Z0-9_]* (got {key:?})"
        )));
    }
    Ok(())
}

pub fn ttl_seconds(value: i64) -> Result<(), KernelError> {
    if !(TTL_SECONDS_MIN..=TTL_SECONDS_MAX).contains(&value) {
        return Err(KernelError::Validation(format!(
            "ttl must be within {TTL_SECONDS_MIN}..{TTL_SECONDS_MAX} seconds"
        )));
    }
    Ok(())
}

pub fn password(value: &str) -> Result<(), KernelError> {
    if value.len() < PASSWORD_MIN || value.len() > PASSWORD_MAX {
        return Err(KernelError::Validation(format!(
            "password must be {PASSWORD_MIN}..{PASSWORD_MAX} characters"
        )));
    }
    Ok(())
}

pub fn email(value: &str) -> Result<(), KernelError> {
    let trimmed = value.trim();
    let well_formed = trimmed.len() <= 254
        && trimmed
            .split_once('@')
            .map(|(local, domain)| !local.is_empty() && domain.contains('.'))
            .unwrap_or(false);
    if !well_formed {
        return Err(KernelError::Validation(format!(
            "invalid email address: {trimmed}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_names() {
        assert!(image_name("nginx:alpine").is_ok());
        assert!(image_name("ghcr.io/acme/app:1.2.3").is_ok());
        assert!(image_name("library/redis").is_ok());
        assert!(image_name("UPPER:ok").is_ok()); // case-insensitive match
        assert!(image_name("").is_err());
        assert!(image_name(":tag-only").is_err());
        assert!(image_name("bad image").is_err());
        assert!(image_name(&"x".repeat(501)).is_err());
    }

    #[test]
    fn cpu_and_memory_bounds() {
        assert!(cpu(0.25).is_ok());
        assert!(cpu(4.0).is_ok());
        assert!(cpu(0.1).is_err());
        assert!(cpu(8.0).is_err());
        assert!(memory_mb(128).is_ok());
        assert!(memory_mb(2048).is_ok());
        assert!(memory_mb(64).is_err());
        assert!(memory_mb(4096).is_err());
    }

    #[test]
    fn secret_keys() {
        assert!(secret_key("API_KEY").is_ok());
        assert!(secret_key("_PRIVATE").is_ok());
        assert!(secret_key("A1_B2").is_ok());
        assert!(secret_key("lower").is_err());
        assert!(secret_key("1LEADING").is_err());
        assert!(secret_key("WITH-DASH").is_err());
        assert!(secret_key("").is_err());
    }

    #[test]
    fn ttl_bounds() {
        assert!(ttl_seconds(60).is_ok());
        assert!(ttl_seconds(604_800).is_ok());
        assert!(ttl_seconds(59).is_err());
        assert!(ttl_seconds(604_801).is_err());
    }

    #[test]
    fn port_rules() {
        assert!(ports(&[PortMapping {
            container: 80,
            host: 48080
        }])
        .is_ok());
        assert!(ports(&[PortMapping {
            container: 80,
            host: 80
        }])
        .is_err());
        let too_many: Vec<_> = (0..11)
            .map(|i| PortMapping {
                container: 80 + i,
                host: 48080 + i,
            })
            .collect();
        assert!(ports(&too_many).is_err());
    }

    #[test]
    fn emails_and_passwords() {
        assert!(email("u@x.test").is_ok());
        assert!(email("no-at-sign").is_err());
        assert!(email("@x.test").is_err());
        assert!(password("longenough").is_ok());
        assert!(password("short").is_err());
        assert!(password(&"p".repeat(129)).is_err());
    }
}
