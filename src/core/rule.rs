//! Provider-agnostic rule model
//!
//! A [`Rule`] is one filtering directive: identity (`name` within a family),
//! placement (`table`, `chain`), a generic terminal [`Action`] and a map from
//! [`Property`] to [`PropertyValue`]. Rules come from two places:
//!
//! - the parser, one per line of a live dump (carrying the source `line`)
//! - the manifest layer, one per declared rule (no `line`)
//!
//! Both sides hold canonical values, so [`Rule::divergences`] can compare them
//! with plain equality.

use crate::core::property::{Family, Property};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Prefix of names assigned to rules that carry no comment
pub const SYNTHETIC_NAME_PREFIX: &str = "9999 ";

/// Terminal actions modeled uniformly across providers
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Action {
    Accept,
    Drop,
    Reject,
}

impl Action {
    /// The jump target token the rule engine uses for this action
    pub const fn target(self) -> &'static str {
        match self {
            Action::Accept => "ACCEPT",
            Action::Drop => "DROP",
            Action::Reject => "REJECT",
        }
    }

    /// Recognizes a generic action in a jump target (`ACCEPT` → `Accept`)
    pub fn from_target(target: &str) -> Option<Self> {
        match target {
            "ACCEPT" => Some(Action::Accept),
            "DROP" => Some(Action::Drop),
            "REJECT" => Some(Action::Reject),
            _ => None,
        }
    }
}

/// A canonicalized property value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Switch(bool),
    List(Vec<String>),
    Text(String),
}

impl PropertyValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            PropertyValue::List(l) => Some(l),
            _ => None,
        }
    }

    /// Whether a live value (or its absence) satisfies this desired value
    fn satisfied_by(&self, live: Option<&PropertyValue>) -> bool {
        match (self, live) {
            (PropertyValue::Switch(false), None) => true,
            (PropertyValue::Switch(false), Some(PropertyValue::Switch(v))) => !v,
            (_, None) => false,
            (desired, Some(live)) => desired == live,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Switch(b) => write!(f, "{b}"),
            PropertyValue::List(l) => write!(f, "{}", l.join(",")),
            PropertyValue::Text(s) => write!(f, "{s}"),
        }
    }
}

/// One filtering rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub family: Family,
    pub table: String,
    pub chain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(default)]
    pub properties: BTreeMap<Property, PropertyValue>,
    /// Dump line this rule was parsed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<String>,
}

impl Rule {
    pub fn new(
        name: impl Into<String>,
        family: Family,
        table: impl Into<String>,
        chain: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            family,
            table: table.into(),
            chain: chain.into(),
            action: None,
            properties: BTreeMap::new(),
            line: None,
        }
    }

    #[must_use]
    pub fn with(mut self, property: Property, value: PropertyValue) -> Self {
        self.properties.insert(property, value);
        self
    }

    #[must_use]
    pub fn with_action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    pub fn get(&self, property: Property) -> Option<&PropertyValue> {
        self.properties.get(&property)
    }

    pub fn text(&self, property: Property) -> Option<&str> {
        self.get(property).and_then(PropertyValue::as_text)
    }

    pub fn list(&self, property: Property) -> Option<&[String]> {
        self.get(property).and_then(PropertyValue::as_list)
    }

    pub fn switch(&self, property: Property) -> bool {
        matches!(self.get(property), Some(PropertyValue::Switch(true)))
    }

    /// Provider-specific jump target, if any
    pub fn jump(&self) -> Option<&str> {
        self.text(Property::Jump)
    }

    /// The target token this rule jumps to, from `jump` or the generic action
    pub fn target(&self) -> Option<&str> {
        self.jump().or_else(|| self.action.map(Action::target))
    }

    /// Whether this rule lives in the given (chain, table)
    pub fn is_in(&self, chain: &str, table: &str) -> bool {
        self.chain == chain && self.table == table
    }

    pub fn has_synthetic_name(&self) -> bool {
        is_synthetic_name(&self.name)
    }

    /// Lists the fields of `self` (the desired rule) that `live` does not
    /// satisfy. Only fields `self` specifies are compared; placement is not
    /// compared here.
    pub fn divergences(&self, live: &Rule) -> Vec<String> {
        let mut diffs = Vec::new();

        if let Some(action) = self.action
            && live.action != Some(action)
        {
            diffs.push("action".to_string());
        }

        for (property, value) in &self.properties {
            if !value.satisfied_by(live.get(*property)) {
                diffs.push(property.to_string());
            }
        }

        diffs
    }

    pub fn converged_with(&self, live: &Rule) -> bool {
        self.divergences(live).is_empty()
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} {}:{})",
            self.name, self.family, self.table, self.chain
        )
    }
}

/// Name for a rule that has no comment, derived from its dump line.
///
/// Identical lines yield identical names.
pub fn synthetic_name(line: &str) -> String {
    let digest = Sha256::digest(line.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("{SYNTHETIC_NAME_PREFIX}{hex}")
}

/// Whether `name` has the form produced by [`synthetic_name`]
pub fn is_synthetic_name(name: &str) -> bool {
    name.strip_prefix(SYNTHETIC_NAME_PREFIX).is_some_and(|rest| {
        rest.len() == 64 && rest.chars().all(|c| c.is_ascii_hexdigit())
    })
}
