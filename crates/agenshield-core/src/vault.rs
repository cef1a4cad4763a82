//! Config integrity HMAC, the contract with the collaborating vault.
//!
//! Key = scrypt(machineId || label, "agenshield-vault-v1", 32) with the
//! config-integrity label; mac = HMAC-SHA256 over the canonical JSON of
//! the policy list sorted by id. The mac is trusted on first use and
//! verified with constant-time equality on every boot afterwards.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{Result, ShieldError};

type HmacSha256 = Hmac<Sha256>;

const VAULT_SALT: &[u8] = b"agenshield-vault-v1";
const CONFIG_INTEGRITY_LABEL: &str = "agenshield-config-integrity-v1";

/// Meta key under which the trusted mac is stored.
pub const CONFIG_HMAC_META_KEY: &str = "CONFIG_HMAC";

pub struct ConfigIntegrity {
    key: [u8; 32],
}

impl ConfigIntegrity {
    /// Derive the machine-bound key once; hold it for the process
    /// lifetime.
    pub fn new(machine_id: &str) -> Result<Self> {
        let mut password = Vec::with_capacity(machine_id.len() + CONFIG_INTEGRITY_LABEL.len());
        password.extend_from_slice(machine_id.as_bytes());
        password.extend_from_slice(CONFIG_INTEGRITY_LABEL.as_bytes());

        let params = scrypt::Params::new(14, 8, 1, 32)
            .map_err(|e| ShieldError::Other(anyhow::anyhow!("invalid scrypt params: {e}")))?;
        let mut key = [0u8; 32];
        scrypt::scrypt(&password, VAULT_SALT, &params, &mut key)
            .map_err(|e| ShieldError::Other(anyhow::anyhow!("key derivation failed: {e}")))?;
        Ok(Self { key })
    }

    /// HMAC-SHA256 over the canonical JSON of the policy list, as
    /// lowercase hex.
    pub fn compute_mac(&self, policies: &[Value]) -> String {
        let canonical = canonical_policy_json(policies);
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(canonical.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time verification against a previously stored mac.
    pub fn verify(&self, policies: &[Value], expected_hex: &str) -> Result<()> {
        let computed = self.compute_mac(policies);
        if computed.as_bytes().ct_eq(expected_hex.as_bytes()).unwrap_u8() != 1 {
            return Err(ShieldError::ConfigTamper);
        }
        Ok(())
    }

    /// Trust-on-first-use: when no mac is stored yet, compute and return
    /// one for the caller to persist; otherwise verify and echo it back.
    pub fn verify_or_trust(&self, policies: &[Value], stored: Option<&str>) -> Result<String> {
        match stored {
            Some(expected) => {
                self.verify(policies, expected)?;
                Ok(expected.to_string())
            }
            None => Ok(self.compute_mac(policies)),
        }
    }
}

/// Canonical JSON of the policy list: entries sorted by their `id`, object
/// keys sorted recursively, no insignificant whitespace.
fn canonical_policy_json(policies: &[Value]) -> String {
    let mut sorted: Vec<&Value> = policies.iter().collect();
    sorted.sort_by(|a, b| {
        let ka = a.get("id").and_then(Value::as_str).unwrap_or_default();
        let kb = b.get("id").and_then(Value::as_str).unwrap_or_default();
        ka.cmp(kb)
    });

    let canonical: Vec<Value> = sorted.iter().map(|v| canonicalize(v)).collect();
    serde_json::to_string(&canonical).unwrap_or_default()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for key in keys {
                out.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn integrity() -> ConfigIntegrity {
        ConfigIntegrity::new("machine-test-0001").expect("derivation should succeed")
    }

    #[test]
    fn mac_is_stable_under_policy_reordering() {
        let ci = integrity();
        let a = vec![json!({"id": "a", "allow": true}), json!({"id": "b"})];
        let b = vec![json!({"id": "b"}), json!({"id": "a", "allow": true})];
        assert_eq!(ci.compute_mac(&a), ci.compute_mac(&b));
    }

    #[test]
    fn mac_is_stable_under_key_reordering() {
        let ci = integrity();
        let a = vec![json!({"id": "a", "x": 1, "y": 2})];
        let b: Vec<Value> = vec![serde_json::from_str(r#"{"y": 2, "x": 1, "id": "a"}"#).unwrap()];
        assert_eq!(ci.compute_mac(&a), ci.compute_mac(&b));
    }

    #[test]
    fn tampered_policies_fail_verification() {
        let ci = integrity();
        let policies = vec![json!({"id": "a", "allow": true})];
        let mac = ci.compute_mac(&policies);

        let tampered = vec![json!({"id": "a", "allow": false})];
        assert!(matches!(
            ci.verify(&tampered, &mac),
            Err(ShieldError::ConfigTamper)
        ));
        ci.verify(&policies, &mac).expect("original should verify");
    }

    #[test]
    fn first_use_trusts_and_returns_mac() {
        let ci = integrity();
        let policies = vec![json!({"id": "a"})];
        let mac = ci.verify_or_trust(&policies, None).unwrap();
        assert_eq!(ci.verify_or_trust(&policies, Some(&mac)).unwrap(), mac);
    }
}
