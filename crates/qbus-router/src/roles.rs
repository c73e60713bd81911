//! Role lookup helpers over the envelope's `rinfo` context.
//!
//! These are pure read conveniences: the core propagates `rinfo` but
//! never verifies it, and nothing here grants or denies anything.
//! Enforcement belongs to the calling module.

use serde_json::Value;

const KEY_ROLES: &str = "roles";

/// Whether `rinfo["roles"]` contains `role`.
///
/// Accepts the roles entry as an array of strings or a single string;
/// any other shape (or a missing entry) reads as "no roles".
pub fn role_has(rinfo: Option<&Value>, role: &str) -> bool {
    let Some(roles) = rinfo.and_then(|info| info.get(KEY_ROLES)) else {
        return false;
    };
    match roles {
        Value::Array(entries) => entries.iter().any(|entry| entry.as_str() == Some(role)),
        Value::String(entry) => entry == role,
        _ => false,
    }
}

/// Whether `rinfo["roles"]` contains any of `roles`.
pub fn role_any(rinfo: Option<&Value>, roles: &[&str]) -> bool {
    roles.iter().any(|role| role_has(rinfo, role))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn finds_role_in_array() {
        let rinfo = json!({"roles": ["admin", "ops"], "workspace": "wp-1"});
        assert!(role_has(Some(&rinfo), "admin"));
        assert!(role_has(Some(&rinfo), "ops"));
        assert!(!role_has(Some(&rinfo), "viewer"));
    }

    #[test]
    fn accepts_single_string_role() {
        let rinfo = json!({"roles": "admin"});
        assert!(role_has(Some(&rinfo), "admin"));
        assert!(!role_has(Some(&rinfo), "ops"));
    }

    #[test]
    fn missing_rinfo_or_roles_reads_as_none() {
        assert!(!role_has(None, "admin"));
        assert!(!role_has(Some(&json!({})), "admin"));
        assert!(!role_has(Some(&json!({"roles": 7})), "admin"));
    }

    #[test]
    fn any_matches_first_hit() {
        let rinfo = json!({"roles": ["ops"]});
        assert!(role_any(Some(&rinfo), &["admin", "ops"]));
        assert!(!role_any(Some(&rinfo), &["admin", "viewer"]));
        assert!(!role_any(Some(&rinfo), &[]));
    }
}
