use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SpyctlError;
use crate::policy::net::NetworkPolicy;
use crate::policy::process::{ProcessNode, validate_forest};
use crate::policy::selector::{ContainerSelector, LabelSelector};

pub const API_VERSION: &str = "spyderbat/v1";
pub const POLICY_KIND: &str = "SpyderbatPolicy";

/// A complete policy document in the `SpyderbatPolicy` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    /// Opaque passthrough; the merge only touches `latestTimestamp`.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub spec: PolicySpec,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PolicySpec {
    #[serde(
        rename = "containerSelector",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub container_selector: Option<ContainerSelector>,
    #[serde(
        rename = "podSelector",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub pod_selector: Option<LabelSelector>,
    #[serde(
        rename = "namespaceSelector",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub namespace_selector: Option<LabelSelector>,
    #[serde(rename = "processPolicy", default)]
    pub process_policy: Vec<ProcessNode>,
    #[serde(rename = "networkPolicy", default)]
    pub network_policy: NetworkPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    /// Fields the engine does not interpret (`enabled`, `mode`, other
    /// selectors). Carried through from the base document on merge.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Policy {
    /// Envelope and structural validation for a loaded document.
    pub fn validate(&self) -> Result<(), SpyctlError> {
        if self.api_version != API_VERSION {
            return Err(SpyctlError::validation(
                "apiVersion",
                &self.api_version,
                format!("expected '{API_VERSION}'"),
            ));
        }
        if self.kind != POLICY_KIND {
            return Err(SpyctlError::validation(
                "kind",
                &self.kind,
                format!("expected '{POLICY_KIND}'"),
            ));
        }
        validate_forest(&self.spec.process_policy)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "\
apiVersion: spyderbat/v1
kind: SpyderbatPolicy
metadata:
  name: rsvp-svc-dev
  type: container
spec:
  containerSelector:
    image: rsvp-svc:latest
  processPolicy:
  - name: python
    exe:
    - /usr/local/bin/python3.6
    id: python_0
    euser:
    - root
  networkPolicy:
    ingress: []
    egress: []
  mode: audit
";

    #[test]
    fn minimal_document_parses_and_validates() {
        let policy: Policy = serde_yaml::from_str(MINIMAL).unwrap();
        policy.validate().unwrap();
        assert_eq!(policy.metadata.get("name").unwrap(), "rsvp-svc-dev");
        assert_eq!(policy.spec.process_policy[0].id, "python_0");
        // unknown spec keys survive through the flatten map
        assert_eq!(policy.spec.extra.get("mode").unwrap(), "audit");
    }

    #[test]
    fn wrong_kind_is_rejected() {
        let mut policy: Policy = serde_yaml::from_str(MINIMAL).unwrap();
        policy.kind = "SpyderbatBaseline".to_string();
        assert!(matches!(
            policy.validate(),
            Err(SpyctlError::Validation { field, .. }) if field == "kind"
        ));
    }

    #[test]
    fn round_trip_preserves_envelope_order() {
        let policy: Policy = serde_yaml::from_str(MINIMAL).unwrap();
        let yaml = serde_yaml::to_string(&policy).unwrap();
        let api_pos = yaml.find("apiVersion").unwrap();
        let kind_pos = yaml.find("kind").unwrap();
        let meta_pos = yaml.find("metadata").unwrap();
        let spec_pos = yaml.find("\nspec").unwrap();
        assert!(api_pos < kind_pos && kind_pos < meta_pos && meta_pos < spec_pos);
    }
}
