use std::{collections::BTreeMap, sync::Arc};

/// An immutable label map, shared cheaply between the store and handlers.
#[derive(Clone, Debug, Default)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

/// The label-matching half of a policy selector.
///
/// Selection is realized in the kernel through set membership rather than
/// in-process matching, so only the `match_labels` pairs feed translation;
/// expression-only selectors produce no named sets.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Selector {
    match_labels: Option<Map>,
    has_expressions: bool,
}

// === impl Selector ===

impl Selector {
    /// Indicates whether this selector matches every pod.
    pub fn selects_all(&self) -> bool {
        !self.has_expressions && self.match_labels.as_ref().map_or(true, |l| l.is_empty())
    }

    /// Whether the selector carries any `match_labels` pairs.
    pub fn has_match_labels(&self) -> bool {
        self.match_labels.as_ref().map_or(false, |l| !l.is_empty())
    }

    /// The `match_labels` pairs, in key order.
    pub fn match_label_pairs(&self) -> impl Iterator<Item = (&String, &String)> {
        self.match_labels.iter().flatten()
    }
}

impl From<k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector> for Selector {
    fn from(sel: k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector) -> Self {
        Self {
            has_expressions: sel
                .match_expressions
                .as_ref()
                .map_or(false, |e| !e.is_empty()),
            match_labels: sel.match_labels,
        }
    }
}

impl<
        K: Into<String>,
        V: Into<String>,
    > std::iter::FromIterator<(K, V)> for Selector
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            match_labels: Some(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect()),
            has_expressions: false,
        }
    }
}

// === impl Labels ===

impl From<Option<Map>> for Labels {
    #[inline]
    fn from(labels: Option<Map>) -> Self {
        labels.unwrap_or_default().into()
    }
}

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        self.0.as_ref()
    }
}

impl Labels {
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::cmp::PartialEq<Self> for Labels {
    #[inline]
    fn eq(&self, t: &Self) -> bool {
        self.0.as_ref().eq(t.as_ref())
    }
}

impl std::iter::FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
        LabelSelector, LabelSelectorRequirement,
    };

    #[test]
    fn empty_selector_selects_all() {
        assert!(Selector::default().selects_all());
        assert!(Selector::from(LabelSelector::default()).selects_all());
        assert!(!Selector::from_iter([("app", "web")]).selects_all());
    }

    #[test]
    fn expression_only_selector_is_not_select_all() {
        let sel = Selector::from(LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "app".to_string(),
                operator: "Exists".to_string(),
                values: None,
            }]),
            match_labels: None,
        });
        assert!(!sel.selects_all());
        assert!(!sel.has_match_labels());
    }

    #[test]
    fn match_label_pairs_are_key_ordered() {
        let sel = Selector::from_iter([("b", "2"), ("a", "1")]);
        let pairs: Vec<_> = sel
            .match_label_pairs()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        assert_eq!(pairs, [("a", "1"), ("b", "2")]);
    }
}
