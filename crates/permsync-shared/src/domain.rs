//! Domain name normalization.
//!
//! Every domain that enters the store goes through [`normalize_domain`], so
//! `Example.COM.`, `example.com` and `EXAMPLE.com` all key the same record.
//! Internationalized names are converted to their punycode form.

use url::Host;

/// Normalize a domain: trim, strip trailing dots, lower-case and convert to
/// ASCII (punycode) via IDNA.
///
/// Returns `None` for empty input, IP literals and anything the IDNA host
/// parser rejects (spaces, slashes, ports, ...).
pub fn normalize_domain(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return None;
    }

    match Host::parse(trimmed) {
        Ok(Host::Domain(domain)) if !domain.is_empty() => Some(domain),
        _ => None,
    }
}
