use std::collections::BTreeMap;

use rekon_core::{kinds, ObjectType};

use crate::{FieldPath, Matcher, OwnedResource, OwnershipCriteria, OwnershipRule, Validation};

fn labels(pairs: &[(&str, &str)], validation: Validation) -> OwnershipCriteria {
    let map: BTreeMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    OwnershipCriteria { matcher: Matcher::Labels(map), validation }
}

fn rule(primary: ObjectType, criteria: OwnershipCriteria, secondaries: Vec<ObjectType>) -> OwnershipRule {
    OwnershipRule {
        primary,
        owned_resources: secondaries
            .into_iter()
            .map(|secondary| OwnedResource { secondary, criteria: criteria.clone() })
            .collect(),
    }
}

pub(crate) fn kubeblocks_rules() -> Vec<OwnershipRule> {
    let cluster = labels(
        &[(kinds::LABEL_INSTANCE, "$(primary.name)"), (kinds::LABEL_MANAGED_BY, kinds::MANAGED_BY_APP)],
        Validation::Owner,
    );
    let component = labels(
        &[(kinds::LABEL_INSTANCE, "$(primary)"), (kinds::LABEL_MANAGED_BY, kinds::MANAGED_BY_APP)],
        Validation::Owner,
    );
    let instance_set = labels(
        &[(kinds::LABEL_WORKLOAD_MANAGED_BY, "InstanceSet"), (kinds::LABEL_WORKLOAD_INSTANCE, "$(primary.name)")],
        Validation::None,
    );
    let backup = labels(
        &[(kinds::LABEL_INSTANCE, "$(primary)"), (kinds::LABEL_MANAGED_BY, kinds::MANAGED_BY_DATAPROTECTION)],
        Validation::None,
    );
    let pvc = OwnershipCriteria {
        matcher: Matcher::SpecifiedName(FieldPath("spec.volumeName".to_string())),
        validation: Validation::None,
    };

    vec![
        rule(kinds::cluster(), cluster, vec![kinds::component(), kinds::service(), kinds::secret()]),
        rule(
            kinds::component(),
            component.clone(),
            vec![
                kinds::instance_set(),
                kinds::service(),
                kinds::secret(),
                kinds::config_map(),
                kinds::pvc(),
                kinds::cluster_role_binding(),
                kinds::role_binding(),
                kinds::service_account(),
                kinds::job(),
                kinds::backup(),
                kinds::restore(),
                kinds::configuration(),
            ],
        ),
        rule(
            kinds::instance_set(),
            instance_set,
            vec![kinds::pod(), kinds::service(), kinds::pvc(), kinds::config_map()],
        ),
        rule(kinds::configuration(), component, vec![kinds::config_map()]),
        rule(
            kinds::backup(),
            backup.clone(),
            vec![kinds::job(), kinds::stateful_set(), kinds::volume_snapshot(), kinds::volume_snapshot_v1beta1()],
        ),
        rule(kinds::restore(), backup, vec![kinds::job()]),
        rule(kinds::pvc(), pvc, vec![kinds::pv()]),
    ]
}
