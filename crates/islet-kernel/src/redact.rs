//! Secret redaction for log lines.
//!
//! Every log line is passed through here before it is persisted or streamed
//! to a client. Patterns cover the common `KEY=value` secret shapes plus the
//! platform's own API-key format.

use std::borrow::Cow;

use regex::Regex;

const REDACTED: &str = "[REDACTED]";

struct CompiledPattern {
    regex: Regex,
    replacement: &'static str,
}

/// Compiled redaction engine. Construct once and share.
pub struct LogRedactor {
    patterns: Vec<CompiledPattern>,
}

impl LogRedactor {
    pub fn new() -> Self {
        // `$1` keeps the `KEY=` prefix so the redacted line still says which
        // variable was scrubbed.
        let specs: &[(&str, &'static str)] = &[
            (
                r"((?:SECRET_\w+|API_KEY|PASSWORD|TOKEN|PRIVATE_KEY)=)\S+",
                "${1}[REDACTED]",
            ),
            // Platform API keys, wherever they appear.
            (r"sk_[A-Za-z0-9_]{8,}", REDACTED),
        ];

        let patterns = specs
            .iter()
            .map(|(pattern, replacement)| CompiledPattern {
                regex: Regex::new(pattern).expect("redaction pattern must compile"),
                replacement,
            })
            .collect();

        Self { patterns }
    }

    /// Returns `Cow::Borrowed` when nothing matched.
    pub fn redact<'a>(&self, input: &'a str) -> Cow<'a, str> {
        if !self.patterns.iter().any(|p| p.regex.is_match(input)) {
            return Cow::Borrowed(input);
        }

        let mut result = input.to_string();
        for pattern in &self.patterns {
            if let Cow::Owned(replaced) = pattern.regex.replace_all(&result, pattern.replacement) {
                result = replaced;
            }
        }
        Cow::Owned(result)
    }

    pub fn redact_owned(&self, input: &str) -> String {
        self.redact(input).into_owned()
    }
}

impl Default for LogRedactor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrubs_key_value_secrets() {
        let redactor = LogRedactor::new();
        assert_eq!(
            redactor.redact("API_KEY=super-secret rest"),
            "API_KEY=[REDACTED] rest"
        );
        assert_eq!(
            redactor.redact("SECRET_DB_PASS=hunter2"),
            "SECRET_DB_PASS=[REDACTED]"
        );
        assert_eq!(redactor.redact("PASSWORD=abc123!"), "PASSWORD=[REDACTED]");
        assert_eq!(redactor.redact("TOKEN=eyJhbGci"), "TOKEN=[REDACTED]");
        assert_eq!(
            redactor.redact("PRIVATE_KEY=-----BEGIN"),
            "PRIVATE_KEY=[REDACTED]"
        );
    }

    #[test]
    fn scrubs_platform_keys_anywhere() {
        let redactor = LogRedactor::new();
        let out = redactor.redact("auth with sk_live_ABCDEF0123456789 done");
        assert_eq!(out, "auth with [REDACTED] done");
    }

    #[test]
    fn scrubbed_value_never_survives() {
        let redactor = LogRedactor::new();
        let out = redactor.redact("API_KEY=sk_live_ABCDEF0123 tail");
        assert!(!out.contains("sk_live_ABCDEF0123"));
        assert!(out.contains(REDACTED));
    }

    #[test]
    fn clean_lines_are_zero_copy() {
        let redactor = LogRedactor::new();
        assert!(matches!(
            redactor.redact("GET /health 200 in 2ms"),
            Cow::Borrowed(_)
        ));
    }
}
