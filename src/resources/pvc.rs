use super::{child_meta, index_labels, merge_meta, resource_name, Role};
use crate::crd::AutoMQ;
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use std::collections::BTreeMap;

/// Requested size of every data volume. Only the storage class is configurable.
pub const DATA_VOLUME_SIZE: &str = "100Gi";

/// Data volume of the process at `role`/`index`
pub fn build_pvc(automq: &AutoMQ, role: Role, index: i32) -> PersistentVolumeClaim {
    let role_spec = role.spec(&automq.spec);

    PersistentVolumeClaim {
        metadata: child_meta(
            automq,
            resource_name(role, index),
            index_labels(&automq.name_any(), role, index),
        ),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: role_spec
                .storage_class
                .clone()
                .filter(|class| !class.is_empty()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(DATA_VOLUME_SIZE.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Labels, access modes and size follow the desired claim. The storage
/// class is only overwritten when one is requested, so a class the cluster
/// defaulted in stays put.
pub fn merge_pvc(live: &mut PersistentVolumeClaim, desired: &PersistentVolumeClaim) {
    merge_meta(&mut live.metadata, &desired.metadata);
    let Some(desired_spec) = desired.spec.as_ref() else {
        return;
    };
    let spec = live.spec.get_or_insert_with(Default::default);
    spec.access_modes = desired_spec.access_modes.clone();
    spec.resources = desired_spec.resources.clone();
    if desired_spec.storage_class_name.is_some() {
        spec.storage_class_name = desired_spec.storage_class_name.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::testing::automq;

    #[test]
    fn test_fixed_size_and_access_mode() {
        let pvc = build_pvc(&automq("demo", "ns"), Role::Controller, 0);
        assert_eq!(pvc.metadata.name.as_deref(), Some("automq-controller-0"));
        let spec = pvc.spec.unwrap();
        assert_eq!(spec.access_modes.unwrap(), vec!["ReadWriteOnce"]);
        assert_eq!(
            spec.resources.unwrap().requests.unwrap()["storage"],
            Quantity("100Gi".to_string())
        );
        assert!(spec.storage_class_name.is_none());
    }

    #[test]
    fn test_storage_class_override() {
        let mut mq = automq("demo", "ns");
        mq.spec.broker.storage_class = Some("openebs-hostpath".to_string());
        let pvc = build_pvc(&mq, Role::Broker, 2);
        assert_eq!(
            pvc.spec.unwrap().storage_class_name.as_deref(),
            Some("openebs-hostpath")
        );
    }

    #[test]
    fn test_merge_keeps_defaulted_storage_class() {
        let desired = build_pvc(&automq("demo", "ns"), Role::Broker, 0);
        let mut live = desired.clone();
        live.spec.as_mut().unwrap().storage_class_name = Some("standard".to_string());
        live.spec.as_mut().unwrap().volume_name = Some("pv-123".to_string());

        let before = live.clone();
        merge_pvc(&mut live, &desired);
        assert_eq!(live, before);
    }
}
