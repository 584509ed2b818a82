//! Routing Verdict
//!
//! Parsed result of the classification call: a set of named boolean
//! predicates. Parsing never fails. Anything that is not a JSON object of
//! booleans degrades to "predicate is false".

use std::collections::BTreeMap;

use serde_json::Value;

/// Extract the first `{ ... }` span from free-form text
///
/// The span runs from the first `{` to the first `}` after it, which is
/// enough for the flat object the classifier is asked to produce.
#[must_use]
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let len = text[start..].find('}')?;
    Some(&text[start..=start + len])
}

/// Named boolean predicates from the classifier
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoutingVerdict {
    predicates: BTreeMap<String, bool>,
}

impl RoutingVerdict {
    /// An empty verdict: every predicate reads false
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a verdict from explicit predicate values
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, bool)>,
        K: Into<String>,
    {
        Self {
            predicates: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Parse the classifier's reply
    ///
    /// Returns `Err` with the offending payload when no JSON object can be
    /// parsed, so the caller can log it before falling back to
    /// [`RoutingVerdict::empty`]. Non-boolean values are ignored.
    pub fn parse(reply: &str) -> Result<Self, String> {
        let payload = extract_json_object(reply).ok_or_else(|| reply.to_string())?;
        let value: Value = serde_json::from_str(payload).map_err(|_| payload.to_string())?;

        let Value::Object(map) = value else {
            return Err(payload.to_string());
        };

        Ok(Self {
            predicates: map
                .into_iter()
                .filter_map(|(k, v)| v.as_bool().map(|b| (k, b)))
                .collect(),
        })
    }

    /// Value of a predicate (missing means false)
    #[must_use]
    pub fn get(&self, predicate: &str) -> bool {
        self.predicates.get(predicate).copied().unwrap_or(false)
    }

    /// Whether no predicate was parsed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Names of predicates that are true
    pub fn true_predicates(&self) -> impl Iterator<Item = &str> {
        self.predicates
            .iter()
            .filter(|(_, v)| **v)
            .map(|(k, _)| k.as_str())
    }
}
