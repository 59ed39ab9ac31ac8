use super::{child_meta, instance_labels, merge_meta};
use crate::crd::AutoMQ;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Key of the entrypoint inside the script ConfigMap
pub const SCRIPT_KEY: &str = "up.sh";

const UP_SCRIPT: &str = include_str!("../../scripts/up.sh");

/// Hex SHA-256 of the entrypoint script. Stamped on pod templates so a new
/// script rolls every workload.
pub fn script_hash() -> String {
    hex::encode(Sha256::digest(UP_SCRIPT.as_bytes()))
}

/// ConfigMap named after the AutoMQ, holding the entrypoint script
pub fn build_script_configmap(automq: &AutoMQ) -> ConfigMap {
    let name = automq.name_any();
    ConfigMap {
        metadata: child_meta(automq, name.clone(), instance_labels(&name)),
        data: Some(BTreeMap::from([(
            SCRIPT_KEY.to_string(),
            UP_SCRIPT.to_string(),
        )])),
        ..Default::default()
    }
}

pub fn merge_configmap(live: &mut ConfigMap, desired: &ConfigMap) {
    merge_meta(&mut live.metadata, &desired.metadata);
    live.data = desired.data.clone();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::testing::automq;

    #[test]
    fn test_configmap_carries_script() {
        let cm = build_script_configmap(&automq("demo", "ns"));
        assert_eq!(cm.metadata.name.as_deref(), Some("demo"));
        assert!(cm.data.unwrap()[SCRIPT_KEY].starts_with("#!/bin/bash"));
    }

    #[test]
    fn test_hash_is_stable_hex() {
        let hash = script_hash();
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, script_hash());
    }
}
