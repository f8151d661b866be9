// Structural validation for resource names, tenant ids, and key prefixes.
//
// Names end up inside redis key patterns (`<prefix>{<resource>}:permits`,
// `<prefix>{<resource>}:t:<tenant>`), so the characters that shape those
// patterns — `{`, `}`, `:` — and whitespace are rejected outright.

use crate::error::Error;

/// Maximum length for resource and tenant names, in bytes.
pub const MAX_NAME_BYTES: usize = 256;

/// Validate a caller-chosen resource name.
///
/// Rules: non-empty, at most 256 bytes, no `{` `}` `:` and no whitespace.
pub(crate) fn validate_resource(resource: &str) -> Result<(), Error> {
    if resource.is_empty() {
        return Err(Error::InvalidResource("name is empty".to_string()));
    }
    if resource.len() > MAX_NAME_BYTES {
        return Err(Error::InvalidResource(format!(
            "name exceeds {MAX_NAME_BYTES} bytes"
        )));
    }
    if let Some(bad) = first_forbidden_char(resource) {
        return Err(Error::InvalidResource(format!("name contains {bad:?}")));
    }
    Ok(())
}

/// Validate a tenant id. Empty is allowed and means "no tenant accounting".
pub(crate) fn validate_tenant_id(tenant_id: &str) -> Result<(), Error> {
    if tenant_id.len() > MAX_NAME_BYTES {
        return Err(Error::InvalidTenantId(format!(
            "id exceeds {MAX_NAME_BYTES} bytes"
        )));
    }
    if let Some(bad) = first_forbidden_char(tenant_id) {
        return Err(Error::InvalidTenantId(format!("id contains {bad:?}")));
    }
    Ok(())
}

/// Validate a key prefix. A prefix may contain `:` (the default is
/// `xsemaphore:`) but never braces, which would break hash-tag colocation.
pub(crate) fn validate_key_prefix(prefix: &str) -> Result<(), Error> {
    if prefix.contains(['{', '}']) {
        return Err(Error::InvalidKeyPrefix("prefix contains a brace".to_string()));
    }
    if prefix.chars().any(char::is_whitespace) {
        return Err(Error::InvalidKeyPrefix("prefix contains whitespace".to_string()));
    }
    Ok(())
}

fn first_forbidden_char(name: &str) -> Option<char> {
    name.chars().find(|c| matches!(c, '{' | '}' | ':') || c.is_whitespace())
}

#[cfg(test)]
mod tests {
    use super::{validate_key_prefix, validate_resource, validate_tenant_id, MAX_NAME_BYTES};
    use crate::error::Error;

    #[test]
    fn accepts_plain_names() {
        for name in ["jobs", "encode-video", "shard_7", "a"] {
            validate_resource(name).expect("plain resource name should be accepted");
            validate_tenant_id(name).expect("plain tenant id should be accepted");
        }
    }

    #[test]
    fn rejects_empty_resource_but_not_empty_tenant() {
        assert!(matches!(validate_resource(""), Err(Error::InvalidResource(_))));
        validate_tenant_id("").expect("empty tenant id means no tenant accounting");
    }

    #[test]
    fn rejects_structural_characters_and_whitespace() {
        for bad in ["a{b", "a}b", "a:b", "a b", "a\tb", "a\nb", " a"] {
            assert!(
                matches!(validate_resource(bad), Err(Error::InvalidResource(_))),
                "resource {bad:?} should be rejected"
            );
            assert!(
                matches!(validate_tenant_id(bad), Err(Error::InvalidTenantId(_))),
                "tenant {bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_names_over_the_byte_limit() {
        let long = "x".repeat(MAX_NAME_BYTES + 1);
        assert!(matches!(validate_resource(&long), Err(Error::InvalidResource(_))));
        assert!(matches!(validate_tenant_id(&long), Err(Error::InvalidTenantId(_))));

        let at_limit = "x".repeat(MAX_NAME_BYTES);
        validate_resource(&at_limit).expect("resource at the byte limit should be accepted");
    }

    #[test]
    fn byte_limit_counts_bytes_not_chars() {
        // 86 three-byte chars: 86 chars but 258 bytes.
        let wide = "永".repeat(86);
        assert!(wide.len() > MAX_NAME_BYTES);
        assert!(matches!(validate_resource(&wide), Err(Error::InvalidResource(_))));
    }

    #[test]
    fn key_prefix_allows_colon_but_not_braces() {
        validate_key_prefix("xsemaphore:").expect("default prefix should be accepted");
        validate_key_prefix("").expect("empty prefix should be accepted");
        assert!(matches!(validate_key_prefix("x{y"), Err(Error::InvalidKeyPrefix(_))));
        assert!(matches!(validate_key_prefix("x}y"), Err(Error::InvalidKeyPrefix(_))));
        assert!(matches!(validate_key_prefix("x y"), Err(Error::InvalidKeyPrefix(_))));
    }
}
