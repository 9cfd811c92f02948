//! Desired-state manifests
//!
//! A manifest is a JSON document listing rules and chains, each with an
//! `ensure` state:
//!
//! ```json
//! {
//!   "chains": [{ "name": "fw-log:filter:IP", "policy": "empty" }],
//!   "rules": [
//!     { "name": "100 allow ssh", "dport": 22, "action": "accept" },
//!     { "name": "200 web", "dport": ["80", "443"], "action": "accept" },
//!     { "name": "900 old", "ensure": "absent" }
//!   ]
//! }
//! ```
//!
//! Declared values are canonicalized the same way parsed live values are, so a
//! [`Rule`] built here compares directly against a live one.

use crate::core::canonical::{
    canonical_address, canonical_icmp, canonical_log_level, canonical_port, canonical_set_mark,
    canonical_states, canonical_switch, split_port_list,
};
use crate::core::chain::{ChainId, Policy};
use crate::core::error::{Error, Result};
use crate::core::property::{Family, Property, SyntaxOptions};
use crate::core::rule::{Action, PropertyValue, Rule};
use crate::core::rule_constraints::validate_rule;
use crate::validators::{validate_burst, validate_log_prefix, validate_rate_limit};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

/// Maximum number of rules in one manifest
pub const MAX_RULES: usize = 1000;

/// Requested state of a rule or chain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ensure {
    #[default]
    Present,
    Absent,
}

/// A value that may be written as a JSON number or string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Number(u64),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Number(n) => write!(f, "{n}"),
            Scalar::Text(s) => write!(f, "{s}"),
        }
    }
}

/// A bare switch written as a JSON bool or as `"true"`/`"false"`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Flag {
    Bool(bool),
    Text(String),
}

impl Flag {
    pub fn value(&self) -> Result<bool> {
        match self {
            Flag::Bool(b) => Ok(*b),
            Flag::Text(s) => canonical_switch(s),
        }
    }
}

/// A list property written either as one value or as an array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(Scalar),
    Many(Vec<Scalar>),
}

impl OneOrMany {
    pub fn items(&self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s.to_string()],
            OneOrMany::Many(v) => v.iter().map(ToString::to_string).collect(),
        }
    }
}

fn default_table() -> String {
    "filter".to_string()
}

fn default_chain() -> String {
    "INPUT".to_string()
}

fn default_proto() -> String {
    "tcp".to_string()
}

/// One declared rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    pub name: String,
    #[serde(default)]
    pub family: Family,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_chain")]
    pub chain: String,
    #[serde(default = "default_proto")]
    pub proto: String,
    pub action: Option<Action>,
    pub source: Option<String>,
    pub destination: Option<String>,
    pub iniface: Option<String>,
    pub outiface: Option<String>,
    pub isfragment: Option<Flag>,
    pub tcp_flags: Option<String>,
    pub gid: Option<Scalar>,
    pub uid: Option<Scalar>,
    pub sport: Option<OneOrMany>,
    pub dport: Option<OneOrMany>,
    pub port: Option<OneOrMany>,
    pub socket: Option<Flag>,
    pub pkttype: Option<String>,
    pub state: Option<OneOrMany>,
    pub icmp: Option<Scalar>,
    pub limit: Option<String>,
    pub burst: Option<Scalar>,
    pub jump: Option<String>,
    pub todest: Option<String>,
    pub tosource: Option<String>,
    pub toports: Option<Scalar>,
    pub log_prefix: Option<String>,
    pub log_level: Option<Scalar>,
    pub reject: Option<String>,
    pub set_mark: Option<Scalar>,
    #[serde(default)]
    pub ensure: Ensure,
}

fn port_list(value: &OneOrMany) -> Result<Vec<String>> {
    value
        .items()
        .iter()
        .flat_map(|item| split_port_list(item))
        .map(|element| canonical_port(&element))
        .collect()
}

impl RuleSpec {
    /// Builds the canonical desired [`Rule`] and checks it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedPlatform`] for the ethernet family, and
    /// [`Error::InvalidAddress`] or [`Error::Validation`] naming this rule for
    /// any value that does not canonicalize or validate.
    pub fn to_rule(&self, options: &SyntaxOptions) -> Result<Rule> {
        if !self.family.supports_rules() {
            return Err(Error::UnsupportedPlatform(format!(
                "rule '{}': rule management is not available for {}",
                self.name, self.family
            )));
        }

        let rule = self.build(options).map_err(|e| match e {
            Error::Validation { field, message } => {
                Error::validation(field, format!("[{}] {message}", self.name))
            }
            Error::InvalidAddress { value, reason } => Error::InvalidAddress {
                value,
                reason: format!("{reason} (rule '{}')", self.name),
            },
            other => other,
        })?;

        validate_rule(&rule)?;
        Ok(rule)
    }

    fn build(&self, options: &SyntaxOptions) -> Result<Rule> {
        use Property as P;
        use PropertyValue::{List, Switch, Text};

        let family = self.family;
        let checked = |field: &str, result: std::result::Result<String, String>| {
            result.map_err(|m| Error::validation(field, m))
        };
        let mut props = BTreeMap::new();

        if let Some(v) = &self.source {
            props.insert(P::Source, Text(canonical_address(v, family)?));
        }
        if let Some(v) = &self.destination {
            props.insert(P::Destination, Text(canonical_address(v, family)?));
        }
        if let Some(v) = &self.iniface {
            props.insert(P::Iniface, Text(v.clone()));
        }
        if let Some(v) = &self.outiface {
            props.insert(P::Outiface, Text(v.clone()));
        }
        props.insert(P::Proto, Text(self.proto.to_lowercase()));
        if let Some(v) = &self.isfragment {
            props.insert(P::Isfragment, Switch(v.value()?));
        }
        if let Some(v) = &self.tcp_flags {
            props.insert(
                P::TcpFlags,
                Text(v.split_whitespace().collect::<Vec<_>>().join(" ")),
            );
        }
        if let Some(v) = &self.gid {
            props.insert(P::Gid, Text(v.to_string()));
        }
        if let Some(v) = &self.uid {
            props.insert(P::Uid, Text(v.to_string()));
        }
        if let Some(v) = &self.sport {
            props.insert(P::Sport, List(port_list(v)?));
        }
        if let Some(v) = &self.dport {
            props.insert(P::Dport, List(port_list(v)?));
        }
        if let Some(v) = &self.port {
            props.insert(P::Port, List(port_list(v)?));
        }
        if let Some(v) = &self.socket {
            props.insert(P::Socket, Switch(v.value()?));
        }
        if let Some(v) = &self.pkttype {
            props.insert(P::Pkttype, Text(v.clone()));
        }
        if let Some(v) = &self.state {
            props.insert(P::State, List(canonical_states(v.items())));
        }
        if let Some(v) = &self.icmp {
            props.insert(P::Icmp, Text(canonical_icmp(&v.to_string(), family)?));
        }
        if let Some(v) = &self.limit {
            props.insert(P::Limit, Text(checked("limit", validate_rate_limit(v))?));
        }
        if let Some(v) = &self.burst {
            props.insert(P::Burst, Text(checked("burst", validate_burst(&v.to_string()))?));
        }
        if let Some(v) = &self.jump {
            props.insert(P::Jump, Text(v.clone()));
        }
        if let Some(v) = &self.todest {
            props.insert(P::Todest, Text(v.clone()));
        }
        if let Some(v) = &self.tosource {
            props.insert(P::Tosource, Text(v.clone()));
        }
        if let Some(v) = &self.toports {
            props.insert(P::Toports, Text(v.to_string()));
        }
        if let Some(v) = &self.log_prefix {
            props.insert(P::LogPrefix, Text(checked("log_prefix", validate_log_prefix(v))?));
        }
        if let Some(v) = &self.log_level {
            props.insert(P::LogLevel, Text(canonical_log_level(&v.to_string())?));
        }
        if let Some(v) = &self.reject {
            props.insert(P::Reject, Text(v.clone()));
        }
        if let Some(v) = &self.set_mark {
            props.insert(
                P::SetMark,
                Text(canonical_set_mark(&v.to_string(), options.legacy_set_mark)?),
            );
        }

        let mut rule = Rule::new(&self.name, family, &self.table, &self.chain);
        rule.action = self.action;
        rule.properties = props;
        Ok(rule)
    }
}

/// One declared chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainSpec {
    /// `CHAIN:table:family`
    pub name: String,
    #[serde(default)]
    pub policy: Option<Policy>,
    #[serde(default)]
    pub ensure: Ensure,
}

impl ChainSpec {
    pub fn id(&self) -> Result<ChainId> {
        self.name.parse()
    }
}

/// A complete desired state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
    #[serde(default)]
    pub chains: Vec<ChainSpec>,
}

impl Manifest {
    /// Parses and checks a manifest.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] for malformed JSON and
    /// [`Error::Validation`] for too many rules or a name declared twice in
    /// one family.
    pub fn from_json(json: &str) -> Result<Self> {
        let manifest: Manifest = serde_json::from_str(json)?;
        manifest.check()?;
        Ok(manifest)
    }

    /// Reads and parses a manifest file.
    pub async fn load(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json)
    }

    fn check(&self) -> Result<()> {
        if self.rules.len() > MAX_RULES {
            return Err(Error::validation(
                "rules",
                format!(
                    "manifest has {} rules, the limit is {MAX_RULES}",
                    self.rules.len()
                ),
            ));
        }

        let mut seen = HashSet::new();
        for rule in &self.rules {
            if !seen.insert((rule.family, rule.name.as_str())) {
                return Err(Error::validation(
                    "name",
                    format!("[{}] declared twice for {}", rule.name, rule.family),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(json: &str) -> RuleSpec {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_defaults() {
        let rule = spec(r#"{"name": "100 allow ssh", "dport": 22, "action": "accept"}"#)
            .to_rule(&SyntaxOptions::default())
            .unwrap();

        assert_eq!(rule.family, Family::Ipv4);
        assert_eq!(rule.table, "filter");
        assert_eq!(rule.chain, "INPUT");
        assert_eq!(rule.text(Property::Proto), Some("tcp"));
        assert_eq!(rule.list(Property::Dport), Some(&["22".to_string()][..]));
        assert_eq!(rule.action, Some(Action::Accept));
    }

    #[test]
    fn test_values_are_canonicalized() {
        let rule = spec(
            r#"{
                "name": "200 web",
                "source": "10.1.2.3",
                "dport": ["80,443", "8000:8080"],
                "state": ["RELATED", "ESTABLISHED"],
                "action": "accept"
            }"#,
        )
        .to_rule(&SyntaxOptions::default())
        .unwrap();

        assert_eq!(rule.text(Property::Source), Some("10.1.2.3/32"));
        assert_eq!(
            rule.list(Property::Dport).unwrap(),
            ["80", "443", "8000-8080"]
        );
        assert_eq!(rule.list(Property::State).unwrap(), ["ESTABLISHED", "RELATED"]);
    }

    #[test]
    fn test_mark_and_log_values() {
        let rule = spec(
            r#"{"name": "300 mark", "table": "mangle", "chain": "PREROUTING",
                "proto": "all", "jump": "MARK", "set_mark": 1}"#,
        )
        .to_rule(&SyntaxOptions::default())
        .unwrap();
        assert_eq!(rule.text(Property::SetMark), Some("0x1/0xffffffff"));

        let rule = spec(
            r#"{"name": "900 log", "proto": "all", "jump": "LOG",
                "log_prefix": "dropped: ", "log_level": "debug"}"#,
        )
        .to_rule(&SyntaxOptions::default())
        .unwrap();
        assert_eq!(rule.text(Property::LogLevel), Some("7"));
    }

    #[test]
    fn test_errors_name_the_rule() {
        let err = spec(r#"{"name": "100 bad", "source": "10.0.0.300"}"#)
            .to_rule(&SyntaxOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAddress { .. }));
        assert!(err.to_string().contains("100 bad"));

        let err = spec(r#"{"name": "100 bad", "dport": "0"}"#)
            .to_rule(&SyntaxOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains("100 bad"));

        let err = spec(r#"{"name": "100 bad", "limit": "fast"}"#)
            .to_rule(&SyntaxOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "limit"));
    }

    #[test]
    fn test_switches_accept_bool_or_text() {
        let rule = spec(r#"{"name": "100 frag", "proto": "all", "isfragment": true, "action": "drop"}"#)
            .to_rule(&SyntaxOptions::default())
            .unwrap();
        assert_eq!(rule.get(Property::Isfragment), Some(&PropertyValue::Switch(true)));

        let rule = spec(r#"{"name": "100 sock", "proto": "all", "socket": "False", "action": "accept"}"#)
            .to_rule(&SyntaxOptions::default())
            .unwrap();
        assert_eq!(rule.get(Property::Socket), Some(&PropertyValue::Switch(false)));

        let err = spec(r#"{"name": "100 sock", "socket": "maybe", "action": "accept"}"#)
            .to_rule(&SyntaxOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn test_state_and_pkttype_typos_rejected() {
        let err = spec(r#"{"name": "100 est", "state": "ESTABLISHD", "action": "accept"}"#)
            .to_rule(&SyntaxOptions::default())
            .unwrap_err();
        assert!(matches!(&err, Error::Validation { field, .. } if field == "state"), "{err}");

        let err = spec(r#"{"name": "100 bc", "pkttype": "broadcst", "action": "drop"}"#)
            .to_rule(&SyntaxOptions::default())
            .unwrap_err();
        assert!(matches!(&err, Error::Validation { field, .. } if field == "pkttype"), "{err}");
    }

    #[test]
    fn test_ethernet_rules_unsupported() {
        let err = spec(r#"{"name": "100 x", "family": "ethernet"}"#)
            .to_rule(&SyntaxOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedPlatform(_)));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: std::result::Result<RuleSpec, _> =
            serde_json::from_str(r#"{"name": "100 x", "dports": 22}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_manifest_parse() {
        let manifest = Manifest::from_json(
            r#"{
                "chains": [{"name": "fw-log:filter:IP", "policy": "empty"}],
                "rules": [
                    {"name": "100 allow ssh", "dport": 22, "action": "accept"},
                    {"name": "100 allow ssh", "family": "IPv6", "dport": 22, "action": "accept"},
                    {"name": "900 old", "ensure": "absent"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(manifest.rules.len(), 3);
        assert_eq!(manifest.rules[2].ensure, Ensure::Absent);
        assert_eq!(manifest.chains[0].policy, Some(Policy::Empty));
        assert_eq!(manifest.chains[0].id().unwrap().families.len(), 2);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = Manifest::from_json(
            r#"{"rules": [{"name": "100 a"}, {"name": "100 a", "dport": 80}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn test_rule_limit() {
        let rules: Vec<String> = (0..=MAX_RULES)
            .map(|i| format!(r#"{{"name": "{i:04} r"}}"#))
            .collect();
        let json = format!(r#"{{"rules": [{}]}}"#, rules.join(","));
        assert!(Manifest::from_json(&json).is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("site.json");
        tokio::fs::write(&path, r#"{"rules": [{"name": "100 allow ssh", "dport": 22}]}"#)
            .await
            .unwrap();

        let manifest = Manifest::load(&path).await.unwrap();
        assert_eq!(manifest.rules[0].name, "100 allow ssh");
        assert!(Manifest::load(&dir.path().join("missing.json")).await.is_err());
    }
}
