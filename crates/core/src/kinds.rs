//! Well-known object types and labels of the database-operator graph.

use crate::ObjectType;

pub const APPS_API_VERSION: &str = "apps.kubeblocks.io/v1";
pub const WORKLOADS_API_VERSION: &str = "workloads.kubeblocks.io/v1";
pub const DATAPROTECTION_API_VERSION: &str = "dataprotection.kubeblocks.io/v1alpha1";
pub const CONFIGURATION_API_VERSION: &str = "apps.kubeblocks.io/v1alpha1";

pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_COMPONENT_NAME: &str = "apps.kubeblocks.io/component-name";
pub const LABEL_WORKLOAD_MANAGED_BY: &str = "workloads.kubeblocks.io/managed-by";
pub const LABEL_WORKLOAD_INSTANCE: &str = "workloads.kubeblocks.io/instance";
pub const MANAGED_BY_APP: &str = "kubeblocks";
pub const MANAGED_BY_DATAPROTECTION: &str = "kubeblocks-dataprotection";

/// Finalizer placed on Cluster and Component objects by their reconcilers.
pub const FINALIZER: &str = "cluster.kubeblocks.io/finalizer";

fn t(api_version: &str, kind: &str) -> ObjectType {
    ObjectType::new(api_version, kind)
}

pub fn cluster() -> ObjectType { t(APPS_API_VERSION, "Cluster") }
pub fn component() -> ObjectType { t(APPS_API_VERSION, "Component") }
pub fn instance_set() -> ObjectType { t(WORKLOADS_API_VERSION, "InstanceSet") }
pub fn configuration() -> ObjectType { t(CONFIGURATION_API_VERSION, "Configuration") }
pub fn backup() -> ObjectType { t(DATAPROTECTION_API_VERSION, "Backup") }
pub fn restore() -> ObjectType { t(DATAPROTECTION_API_VERSION, "Restore") }

pub fn pod() -> ObjectType { t("v1", "Pod") }
pub fn service() -> ObjectType { t("v1", "Service") }
pub fn secret() -> ObjectType { t("v1", "Secret") }
pub fn config_map() -> ObjectType { t("v1", "ConfigMap") }
pub fn pvc() -> ObjectType { t("v1", "PersistentVolumeClaim") }
pub fn pv() -> ObjectType { t("v1", "PersistentVolume") }
pub fn service_account() -> ObjectType { t("v1", "ServiceAccount") }
pub fn event() -> ObjectType { t("v1", "Event") }
pub fn job() -> ObjectType { t("batch/v1", "Job") }
pub fn stateful_set() -> ObjectType { t("apps/v1", "StatefulSet") }
pub fn role_binding() -> ObjectType { t("rbac.authorization.k8s.io/v1", "RoleBinding") }
pub fn cluster_role_binding() -> ObjectType { t("rbac.authorization.k8s.io/v1", "ClusterRoleBinding") }
pub fn volume_snapshot() -> ObjectType { t("snapshot.storage.k8s.io/v1", "VolumeSnapshot") }
pub fn volume_snapshot_v1beta1() -> ObjectType { t("snapshot.storage.k8s.io/v1beta1", "VolumeSnapshot") }

/// Types with no namespace.
pub fn is_cluster_scoped(ty: &ObjectType) -> bool {
    matches!(ty.kind.as_str(), "PersistentVolume" | "ClusterRoleBinding" | "ClusterRole" | "Namespace" | "StorageClass")
        && (ty.group().is_empty() || ty.group() == "rbac.authorization.k8s.io" || ty.group() == "storage.k8s.io")
}
