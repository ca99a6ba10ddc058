//! Outbound redaction and allowlist validation for cloud sync (C8 helper).
//!
//! A pure text→text transform with audit metadata: matched rule *names*
//! are recorded, matched *text* never is.

use std::sync::LazyLock;

use regex::Regex;

static OPENAI_KEY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bsk-[A-Za-z0-9]{20,}\b").unwrap());
static BEARER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9_\-.=]{12,}\b").unwrap());
static AWS_ACCESS_KEY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bAKIA[0-9A-Z]{16}\b").unwrap());
static AWS_SECRET_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)aws(.{0,20})?secret(.{0,20})?=\s*['"]?[A-Za-z0-9/+=]{20,}['"]?"#).unwrap()
});
static GENERIC_API_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(api[_-]?key|secret|password|token)\b\s*[:=]\s*['"]?\S{6,}['"]?"#).unwrap()
});
static PRIVATE_KEY_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-----BEGIN (RSA |EC |OPENSSH )?PRIVATE KEY-----").unwrap());
static JWT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\beyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\b").unwrap());
static URL_QUERY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(https?://[^\s?]+)\?([^\s]+)").unwrap());

static HIGH_ENTROPY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-Za-z0-9+/=]{40,}").unwrap());
static SECRET_ASSIGNMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(secret|password|token|api[_-]?key)\b\s*=").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedactionResult {
    pub text: String,
    pub redaction_count: usize,
    pub matched_rules: Vec<String>,
}

/// Apply every redaction rule, in order, to `text`. Matched substrings are
/// replaced with `[REDACTED]` (URL query strings with `[REDACTED_QUERY]`);
/// the rule names that fired are recorded but the original matched text
/// never is.
pub fn redact(text: &str) -> RedactionResult {
    let mut out = text.to_string();
    let mut matched: Vec<String> = Vec::new();
    let mut count = 0usize;

    let rules: [(&str, &Regex); 7] = [
        ("openai_api_key", &OPENAI_KEY),
        ("bearer", &BEARER),
        ("aws_access_key", &AWS_ACCESS_KEY),
        ("aws_secret_key", &AWS_SECRET_KEY),
        ("generic_api_key", &GENERIC_API_KEY),
        ("private_key_block", &PRIVATE_KEY_BLOCK),
        ("jwt", &JWT),
    ];

    for (name, re) in rules {
        if re.is_match(&out) {
            matched.push(name.to_string());
            let n = re.find_iter(&out).count();
            out = re.replace_all(&out, "[REDACTED]").into_owned();
            count += n;
        }
    }

    if URL_QUERY.is_match(&out) {
        matched.push("url_query".to_string());
        let n = URL_QUERY.find_iter(&out).count();
        out = URL_QUERY.replace_all(&out, "$1?[REDACTED_QUERY]").into_owned();
        count += n;
    }

    matched.sort();
    matched.dedup();

    RedactionResult { text: out, redaction_count: count, matched_rules: matched }
}

/// Reject text that looks too risky to sync even after redaction.
/// Returns `(allowed, reasons)`.
pub fn validate_allowlist(text: &str) -> (bool, Vec<String>) {
    let mut reasons = Vec::new();

    if text.len() > 500 {
        reasons.push("too_long".to_string());
    }
    if HIGH_ENTROPY.is_match(text) {
        reasons.push("high_entropy_token".to_string());
    }
    if text.contains("PRIVATE KEY") {
        reasons.push("private_key_block".to_string());
    }
    if SECRET_ASSIGNMENT.is_match(text) {
        reasons.push("secret_assignment".to_string());
    }

    (reasons.is_empty(), reasons)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_openai_key_without_leaking_it() {
        let input = "cluster-a api-key=sk-abcdefghijklmnopqrst12";
        let r = redact(input);
        assert!(!r.text.contains("sk-abcdefghijklmnopqrst12"));
        assert!(r.matched_rules.contains(&"openai_api_key".to_string()));
        assert!(r.matched_rules.contains(&"generic_api_key".to_string()));
    }

    #[test]
    fn redacts_bearer_token() {
        let r = redact("Authorization: Bearer abcdefghijklmnop");
        assert!(r.text.contains("[REDACTED]"));
        assert!(r.matched_rules.contains(&"bearer".to_string()));
    }

    #[test]
    fn redacts_url_query_preserving_base() {
        let r = redact("see https://example.com/path?token=abc123 for details");
        assert!(r.text.contains("https://example.com/path?[REDACTED_QUERY]"));
        assert!(r.matched_rules.contains(&"url_query".to_string()));
    }

    #[test]
    fn second_redaction_pass_is_idempotent() {
        let first = redact("api_key=abcdef123456");
        let second = redact(&first.text);
        assert_eq!(second.redaction_count, 0);
    }

    #[test]
    fn allowlist_rejects_long_text() {
        let long = "x".repeat(501);
        let (ok, reasons) = validate_allowlist(&long);
        assert!(!ok);
        assert!(reasons.contains(&"too_long".to_string()));
    }

    #[test]
    fn allowlist_rejects_secret_assignment() {
        let (ok, reasons) = validate_allowlist("password=hunter2hunter2");
        assert!(!ok);
        assert!(reasons.contains(&"secret_assignment".to_string()));
    }

    #[test]
    fn allowlist_accepts_plain_text() {
        let (ok, reasons) = validate_allowlist("restart the nginx service on node-a1");
        assert!(ok);
        assert!(reasons.is_empty());
    }
}
