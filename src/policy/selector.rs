//! Namespace selectors
//!
//! Kubernetes-style label selectors extended with an explicit name list.
//! Within one selector every present clause must match; an empty selector
//! matches every namespace.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Well-known label the API server sets to the namespace's own name
///
/// Matching treats it as present even when an older API server did not set it,
/// so `matchLabels: {kubernetes.io/metadata.name: foo}` always selects `foo`.
pub const NAMESPACE_NAME_LABEL: &str = "kubernetes.io/metadata.name";

/// Operator for label selector requirements
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum LabelSelectorOperator {
    /// Label value must be in the specified set
    In,
    /// Label value must not be in the specified set
    NotIn,
    /// Label must exist (value ignored)
    Exists,
    /// Label must not exist (value ignored)
    DoesNotExist,
}

impl LabelSelectorOperator {
    /// Check if a label value matches this operator
    ///
    /// - `label_value`: The actual label value (None if label doesn't exist)
    /// - `values`: The values specified in the requirement
    pub fn matches(&self, label_value: Option<&str>, values: &[String]) -> bool {
        match self {
            Self::In => label_value.is_some_and(|v| values.iter().any(|req| req == v)),
            Self::NotIn => {
                label_value.is_none() || !values.iter().any(|req| Some(req.as_str()) == label_value)
            }
            Self::Exists => label_value.is_some(),
            Self::DoesNotExist => label_value.is_none(),
        }
    }

    fn takes_values(&self) -> bool {
        matches!(self, Self::In | Self::NotIn)
    }
}

/// A single label selector requirement
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    /// The label key that the selector applies to
    pub key: String,

    /// Operator representing the relationship between label and values
    pub operator: LabelSelectorOperator,

    /// Values for `In` / `NotIn`; must be empty for `Exists` / `DoesNotExist`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl LabelSelectorRequirement {
    fn validate(&self, index: usize) -> Result<(), Error> {
        if self.key.is_empty() {
            return Err(Error::validation(format!(
                "matchExpressions[{}]: key must not be empty",
                index
            )));
        }
        match (self.operator.takes_values(), self.values.is_empty()) {
            (true, true) => Err(Error::validation(format!(
                "matchExpressions[{}]: operator {:?} requires values",
                index, self.operator
            ))),
            (false, false) => Err(Error::validation(format!(
                "matchExpressions[{}]: operator {:?} takes no values",
                index, self.operator
            ))),
            _ => Ok(()),
        }
    }
}

/// Selects namespaces by labels and/or explicit names
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSelector {
    /// Exact label matches, all must hold
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_labels: Option<BTreeMap<String, String>>,

    /// Label requirements, all must hold
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,

    /// Explicit namespace names; when non-empty the namespace must be listed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_names: Vec<String>,
}

impl NamespaceSelector {
    /// Selector matching namespaces carrying all the given labels
    pub fn labels<I, K, V>(labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            match_labels: Some(
                labels
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    /// Selector matching the listed namespace names
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            match_names: names.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Check if a namespace matches this selector
    pub fn matches(&self, name: &str, labels: &BTreeMap<String, String>) -> bool {
        if !self.match_names.is_empty() && !self.match_names.iter().any(|n| n == name) {
            return false;
        }

        if let Some(match_labels) = &self.match_labels {
            for (key, value) in match_labels {
                if label_value(name, labels, key) != Some(value.as_str()) {
                    return false;
                }
            }
        }

        self.match_expressions
            .iter()
            .all(|req| req.operator.matches(label_value(name, labels, &req.key), &req.values))
    }

    /// Reject selectors the API server would reject
    pub fn validate(&self) -> Result<(), Error> {
        if let Some(match_labels) = &self.match_labels {
            if match_labels.keys().any(|k| k.is_empty()) {
                return Err(Error::validation("matchLabels: key must not be empty"));
            }
        }
        for (i, req) in self.match_expressions.iter().enumerate() {
            req.validate(i)?;
        }
        if self.match_names.iter().any(|n| n.is_empty()) {
            return Err(Error::validation("matchNames: name must not be empty"));
        }
        Ok(())
    }
}

fn label_value<'a>(
    name: &'a str,
    labels: &'a BTreeMap<String, String>,
    key: &str,
) -> Option<&'a str> {
    match labels.get(key) {
        Some(v) => Some(v.as_str()),
        None if key == NAMESPACE_NAME_LABEL => Some(name),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn expr(key: &str, operator: LabelSelectorOperator, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_string(),
            operator,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    #[test]
    fn operator_semantics() {
        let vals = vec!["a".to_string(), "b".to_string()];
        assert!(LabelSelectorOperator::In.matches(Some("a"), &vals));
        assert!(!LabelSelectorOperator::In.matches(Some("c"), &vals));
        assert!(!LabelSelectorOperator::In.matches(None, &vals));
        assert!(LabelSelectorOperator::NotIn.matches(Some("c"), &vals));
        assert!(LabelSelectorOperator::NotIn.matches(None, &vals));
        assert!(!LabelSelectorOperator::NotIn.matches(Some("a"), &vals));
        assert!(LabelSelectorOperator::Exists.matches(Some(""), &[]));
        assert!(!LabelSelectorOperator::Exists.matches(None, &[]));
        assert!(LabelSelectorOperator::DoesNotExist.matches(None, &[]));
    }

    #[test]
    fn empty_selector_matches_everything() {
        let sel = NamespaceSelector::default();
        assert!(sel.matches("anything", &BTreeMap::new()));
    }

    #[test]
    fn match_labels_require_all_pairs() {
        let sel = NamespaceSelector::labels([("team", "payments"), ("env", "prod")]);
        assert!(sel.matches("pay", &labels(&[("team", "payments"), ("env", "prod")])));
        assert!(!sel.matches("pay", &labels(&[("team", "payments")])));
    }

    #[test]
    fn match_names_restrict_to_listed_namespaces() {
        let sel = NamespaceSelector::names(["ns1", "ns2"]);
        assert!(sel.matches("ns1", &BTreeMap::new()));
        assert!(!sel.matches("ns3", &BTreeMap::new()));
    }

    #[test]
    fn name_label_is_implicit() {
        let sel = NamespaceSelector::labels([(NAMESPACE_NAME_LABEL, "billing")]);
        assert!(sel.matches("billing", &BTreeMap::new()));
        assert!(!sel.matches("other", &BTreeMap::new()));
    }

    #[test]
    fn expressions_and_labels_combine() {
        let sel = NamespaceSelector {
            match_labels: Some(labels(&[("mesh", "enabled")])),
            match_expressions: vec![expr("env", LabelSelectorOperator::NotIn, &["dev"])],
            match_names: vec![],
        };
        assert!(sel.matches("a", &labels(&[("mesh", "enabled"), ("env", "prod")])));
        assert!(!sel.matches("a", &labels(&[("mesh", "enabled"), ("env", "dev")])));
        assert!(!sel.matches("a", &labels(&[("env", "prod")])));
    }

    #[test]
    fn validate_rejects_malformed_expressions() {
        let missing_values = NamespaceSelector {
            match_expressions: vec![expr("team", LabelSelectorOperator::In, &[])],
            ..Default::default()
        };
        assert!(missing_values.validate().is_err());

        let extra_values = NamespaceSelector {
            match_expressions: vec![expr("team", LabelSelectorOperator::Exists, &["x"])],
            ..Default::default()
        };
        assert!(extra_values.validate().is_err());

        let empty_key = NamespaceSelector {
            match_expressions: vec![expr("", LabelSelectorOperator::Exists, &[])],
            ..Default::default()
        };
        assert!(empty_key.validate().is_err());

        assert!(NamespaceSelector::names([""]).validate().is_err());
        assert!(NamespaceSelector::labels([("team", "a")]).validate().is_ok());
    }

    #[test]
    fn deserializes_camel_case_yaml() {
        let yaml = r#"
matchLabels:
  team: payments
matchExpressions:
  - key: env
    operator: In
    values: [prod, staging]
matchNames: [pay-a]
"#;
        let sel: NamespaceSelector = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(sel.match_names, vec!["pay-a".to_string()]);
        assert_eq!(sel.match_expressions[0].operator, LabelSelectorOperator::In);
        assert!(sel.matches("pay-a", &labels(&[("team", "payments"), ("env", "prod")])));
    }
}
