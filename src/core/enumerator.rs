//! Live rule enumeration
//!
//! Dumps one family's live state and parses it into a [`LiveRuleSet`]. A fresh
//! snapshot is taken for every reconciliation decision; nothing is cached
//! between decisions.

use crate::core::backend::{CommandRunner, FamilyBackend};
use crate::core::error::{Error, Result};
use crate::core::parser::RuleParser;
use crate::core::property::{Family, SyntaxTable};
use crate::core::rule::Rule;
use tracing::{debug, error};

/// All live rules of one family, in dump order
#[derive(Debug, Clone, Default)]
pub struct LiveRuleSet {
    family: Family,
    rules: Vec<Rule>,
}

impl LiveRuleSet {
    pub fn new(family: Family, rules: Vec<Rule>) -> Self {
        Self { family, rules }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The first live rule named `name` in this family
    pub fn find(&self, name: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.name == name)
    }

    /// The live rule that `desired` corresponds to: a same-named rule in its
    /// own (chain, table) if there is one, else the first one elsewhere
    pub fn locate(&self, desired: &Rule) -> Option<&Rule> {
        self.rules
            .iter()
            .find(|r| r.name == desired.name && r.is_in(&desired.chain, &desired.table))
            .or_else(|| self.find(&desired.name))
    }

    /// Names of the rules in (chain, table), in dump order
    pub fn names_in<'a>(&'a self, chain: &'a str, table: &'a str) -> impl Iterator<Item = &'a str> {
        self.rules
            .iter()
            .filter(move |r| r.is_in(chain, table))
            .map(|r| r.name.as_str())
    }
}

/// Reads and parses the live rules of `backend`'s family.
///
/// # Errors
///
/// Any dump or parse failure is returned as is; a single unparseable line fails
/// the whole enumeration.
pub async fn enumerate<R: CommandRunner>(
    backend: &FamilyBackend,
    table: &SyntaxTable,
    runner: &R,
) -> Result<LiveRuleSet> {
    if backend.family != table.family() {
        return Err(Error::Internal(format!(
            "syntax table for {} used with {} backend",
            table.family(),
            backend.family
        )));
    }

    let dump = backend.dump(runner).await?;
    let rules = RuleParser::new(table).parse_dump(&dump).inspect_err(|e| {
        error!("Cannot interpret live {} rules: {}", backend.family, e);
    })?;

    debug!("Enumerated {} live {} rules", rules.len(), backend.family);
    Ok(LiveRuleSet::new(backend.family, rules))
}
