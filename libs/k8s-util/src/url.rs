/// Replaces namespace and object names in a Kubernetes API path so it can be used as a low
/// cardinality metric label.
///
/// `/apis/rbac.authorization.k8s.io/v1/namespaces/ns1/rolebindings/jane-membership-dev`
/// becomes `/apis/rbac.authorization.k8s.io/v1/namespaces/{namespace}/rolebindings/{name}`.
pub fn template_path(path: &str) -> String {
    let segments = path.trim_matches('/').split('/').collect::<Vec<_>>();
    let prefix_len = match segments.first() {
        Some(&"api") => 2,
        Some(&"apis") => 3,
        _ => return path.to_string(),
    };
    if segments.len() <= prefix_len {
        return path.to_string();
    }

    let (prefix, rest) = segments.split_at(prefix_len);
    let mut templated = prefix.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    let rest = match rest {
        ["namespaces", _, tail @ ..] if !tail.is_empty() => {
            templated.extend(["namespaces".to_string(), "{namespace}".to_string()]);
            tail
        }
        ["namespaces", _] => {
            templated.extend(["namespaces".to_string(), "{name}".to_string()]);
            &[]
        }
        other => other,
    };
    match rest {
        [] => {}
        [resource] => templated.push(resource.to_string()),
        [resource, _, subresource @ ..] => {
            templated.push(resource.to_string());
            templated.push("{name}".to_string());
            templated.extend(subresource.iter().map(|s| s.to_string()));
        }
    }
    format!("/{}", templated.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_path_namespaced_object() {
        assert_eq!(
            template_path("/apis/rbac.authorization.k8s.io/v1/namespaces/ns1/rolebindings/jane"),
            "/apis/rbac.authorization.k8s.io/v1/namespaces/{namespace}/rolebindings/{name}"
        );
    }

    #[test]
    fn test_template_path_core_list_and_cluster_object() {
        assert_eq!(
            template_path("/api/v1/namespaces/default/secrets"),
            "/api/v1/namespaces/{namespace}/secrets"
        );
        assert_eq!(
            template_path("/apis/rbac.authorization.k8s.io/v1/clusterroles/developers"),
            "/apis/rbac.authorization.k8s.io/v1/clusterroles/{name}"
        );
        assert_eq!(
            template_path("/apis/perm8s.io/v1alpha1/users"),
            "/apis/perm8s.io/v1alpha1/users"
        );
    }

    #[test]
    fn test_template_path_subresource_and_namespace() {
        assert_eq!(
            template_path("/apis/perm8s.io/v1alpha1/namespaces/ns/groups/dev/status"),
            "/apis/perm8s.io/v1alpha1/namespaces/{namespace}/groups/{name}/status"
        );
        assert_eq!(template_path("/api/v1/namespaces/ns1"), "/api/v1/namespaces/{name}");
        assert_eq!(template_path("/version"), "/version");
    }
}
