//! Rules and rule sets
//!
//! A [`RuleSet`] is one generation of rules for a single source. Sets are
//! replaced wholesale and compared key-by-key, value-by-value.

use std::collections::BTreeMap;
use std::time::Duration;

/// A named query that is counted periodically
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// Rule identity, also used as the metric path
    pub name: String,

    /// Query string expression handed to the backend
    pub query: String,

    /// Index (or index pattern) to search
    pub index: String,

    /// How often the rule is counted, also the width of the time window
    pub check_interval: Duration,
}

/// Settings shared by every rule a dynamic source discovers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleTemplate {
    pub index: String,
    pub check_interval: Duration,
}

impl RuleTemplate {
    pub fn rule(&self, name: impl Into<String>, query: impl Into<String>) -> Rule {
        Rule {
            name: name.into(),
            query: query.into(),
            index: self.index.clone(),
            check_interval: self.check_interval,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    rules: BTreeMap<String, Rule>,
}

impl RuleSet {
    pub fn new(rules: impl IntoIterator<Item = Rule>) -> Self {
        Self {
            rules: rules
                .into_iter()
                .map(|rule| (rule.name.clone(), rule))
                .collect(),
        }
    }

    /// Build a set from a title → query mapping as returned by a rule store
    pub fn from_queries(template: &RuleTemplate, queries: BTreeMap<String, String>) -> Self {
        Self::new(
            queries
                .into_iter()
                .map(|(name, query)| template.rule(name, query)),
        )
    }

    pub fn get(&self, name: &str) -> Option<&Rule> {
        self.rules.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
