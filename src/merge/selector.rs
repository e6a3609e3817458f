use std::collections::{BTreeMap, BTreeSet};

use crate::policy::selector::{ContainerSelector, LabelSelector, MatchExpression, Operator};

/// Merge two label selectors into one matching at least everything
/// either input matched.
///
/// `matchLabels` keys are unioned; a key present on both sides with
/// differing values moves into `matchExpressions` as an `In` listing all
/// observed values. Expressions with the same (key, operator) union
/// their value sets. A selector present on only one side passes through.
pub fn merge_label_selectors(
    base: Option<&LabelSelector>,
    other: Option<&LabelSelector>,
) -> Option<LabelSelector> {
    let (base, other) = match (base, other) {
        (Some(b), Some(o)) => (b, o),
        (Some(b), None) => return Some(b.clone()),
        (None, Some(o)) => return Some(o.clone()),
        (None, None) => return None,
    };
    let mut labels = BTreeMap::new();
    let mut expressions = base.match_expressions.clone();
    expressions.extend(other.match_expressions.iter().cloned());
    merge_label_maps(
        &base.match_labels,
        &other.match_labels,
        &mut labels,
        &mut expressions,
    );
    Some(LabelSelector {
        match_labels: labels,
        match_expressions: fold_expressions(expressions),
    })
}

/// Merge container selectors. `image` and `containerName` widen into an
/// `In` field expression on conflict; `imageID`/`containerID` are
/// exact-identity fields and are dropped unless equal.
pub fn merge_container_selectors(
    base: Option<&ContainerSelector>,
    other: Option<&ContainerSelector>,
) -> Option<ContainerSelector> {
    let (base, other) = match (base, other) {
        (Some(b), Some(o)) => (b, o),
        (Some(b), None) => return Some(b.clone()),
        (None, Some(o)) => return Some(o.clone()),
        (None, None) => return None,
    };
    let mut fields = BTreeMap::new();
    let mut expressions = base.match_fields_expressions.clone();
    expressions.extend(other.match_fields_expressions.iter().cloned());
    merge_label_maps(
        &base.match_fields,
        &other.match_fields,
        &mut fields,
        &mut expressions,
    );
    let image = merge_widening("image", &base.image, &other.image, &mut expressions);
    let container_name = merge_widening(
        "containerName",
        &base.container_name,
        &other.container_name,
        &mut expressions,
    );
    Some(ContainerSelector {
        image,
        image_id: merge_exact(&base.image_id, &other.image_id),
        container_name,
        container_id: merge_exact(&base.container_id, &other.container_id),
        match_fields: fields,
        match_fields_expressions: fold_expressions(expressions),
    })
}

/// Key union; conflicting values become an `In` expression listing all
/// observed values. `expressions` must already hold both sides'
/// expressions so surviving labels can be checked against them.
fn merge_label_maps(
    base: &BTreeMap<String, String>,
    other: &BTreeMap<String, String>,
    out: &mut BTreeMap<String, String>,
    expressions: &mut Vec<MatchExpression>,
) {
    for (key, value) in base {
        match other.get(key) {
            Some(other_value) if other_value != value => {
                push_in_values(expressions, key, &[value, other_value]);
            }
            _ => keep_label(key, value, out, expressions),
        }
    }
    for (key, value) in other {
        if !base.contains_key(key) {
            keep_label(key, value, out, expressions);
        }
    }
}

/// A label whose key already widened into an `In` expression joins that
/// expression's value set; keeping the label as well would conjoin to a
/// selector matching nothing.
fn keep_label(
    key: &str,
    value: &str,
    out: &mut BTreeMap<String, String>,
    expressions: &mut Vec<MatchExpression>,
) {
    let widened = expressions
        .iter()
        .any(|e| e.key == key && e.operator == Operator::In);
    if widened {
        push_in_values(expressions, key, &[value]);
    } else {
        out.insert(key.to_string(), value.to_string());
    }
}

fn push_in_values(expressions: &mut Vec<MatchExpression>, key: &str, values: &[&str]) {
    expressions.push(MatchExpression {
        key: key.to_string(),
        operator: Operator::In,
        values: Some(values.iter().map(|v| v.to_string()).collect()),
    });
}

fn merge_widening(
    key: &str,
    base: &Option<String>,
    other: &Option<String>,
    expressions: &mut Vec<MatchExpression>,
) -> Option<String> {
    let widened = expressions
        .iter()
        .any(|e| e.key == key && e.operator == Operator::In);
    match (base, other) {
        (Some(b), Some(o)) if b != o => {
            push_in_values(expressions, key, &[b, o]);
            None
        }
        // a value observed after the key widened joins the expression
        (Some(v), Some(_)) | (Some(v), None) | (None, Some(v)) if widened => {
            push_in_values(expressions, key, &[v]);
            None
        }
        (Some(v), Some(_)) => Some(v.clone()),
        _ => None,
    }
}

fn merge_exact(base: &Option<String>, other: &Option<String>) -> Option<String> {
    match (base, other) {
        (Some(b), Some(o)) if b == o => Some(b.clone()),
        _ => None,
    }
}

/// Fold expressions by (key, operator), unioning value sets, and sort
/// for stable output.
fn fold_expressions(expressions: Vec<MatchExpression>) -> Vec<MatchExpression> {
    let mut folded: BTreeMap<(String, Operator), Option<BTreeSet<String>>> = BTreeMap::new();
    for expr in expressions {
        let entry = folded
            .entry((expr.key, expr.operator))
            .or_insert_with(|| expr.values.is_some().then(BTreeSet::new));
        if let (Some(set), Some(values)) = (entry.as_mut(), expr.values) {
            set.extend(values);
        }
    }
    folded
        .into_iter()
        .map(|((key, operator), values)| MatchExpression {
            key,
            operator,
            values: values.map(|set| set.into_iter().collect()),
        })
        .collect()
}
