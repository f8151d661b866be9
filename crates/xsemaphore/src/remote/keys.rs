// Redis key construction.
//
// Both keys for one resource carry the `{resource}` hash tag, so cluster
// deployments place them in the same slot and the multi-key scripts never
// hit CROSSSLOT.

/// Global ledger key: `<prefix>{<resource>}:permits`.
pub(crate) fn global_key(prefix: &str, resource: &str) -> String {
    format!("{prefix}{{{resource}}}:permits")
}

/// Tenant ledger key: `<prefix>{<resource>}:t:<tenant_id>`.
pub(crate) fn tenant_key(prefix: &str, resource: &str, tenant_id: &str) -> String {
    format!("{prefix}{{{resource}}}:t:{tenant_id}")
}

/// The KEYS array for one script call: one element without a tenant ledger,
/// two with. Never contains an empty string.
pub(crate) fn script_keys(prefix: &str, resource: &str, tenant_id: Option<&str>) -> Vec<String> {
    let mut keys = vec![global_key(prefix, resource)];
    if let Some(tenant_id) = tenant_id {
        keys.push(tenant_key(prefix, resource, tenant_id));
    }
    keys
}
