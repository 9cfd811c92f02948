//! Convergence of desired rules against the live rule store
//!
//! The [`Reconciler`] owns one [`FamilyBackend`] per protocol family and one
//! [`SyntaxTable`] per rule-capable family. Every decision starts from a fresh
//! enumeration of the family's live rules:
//!
//! - absent ⇒ insert at the resolved position
//! - present but divergent ⇒ replace at the resolved position
//! - present in another (chain, table) ⇒ delete, then insert
//! - converged ⇒ no invocation at all
//!
//! Each successful mutation is followed by the family's persist step. A failed
//! persist is reported as [`Error::PersistFailed`] so callers can tell a
//! changed-but-unsaved state from a failed change.

use crate::audit::{AuditLog, EventType};
use crate::config::AppConfig;
use crate::core::backend::{CommandRunner, FamilyBackend, display_command};
use crate::core::chain::{ChainManager, Policy};
use crate::core::enumerator::{LiveRuleSet, enumerate};
use crate::core::error::{Error, Result};
use crate::core::manifest::{Ensure, Manifest};
use crate::core::position::insert_position;
use crate::core::property::{Family, SyntaxOptions, SyntaxTable};
use crate::core::rule::Rule;
use crate::core::rule_constraints::validate_rule;
use crate::core::serializer::{Operation, delete_args, mutation_args};
use std::collections::BTreeMap;
use std::fmt;
use strum::IntoEnumIterator;
use tracing::{debug, error, info, warn};

/// What converging one rule requires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Live rule already satisfies the desired one
    Unchanged,
    Insert { position: usize },
    /// Live rule exists in place but differs in `differences`
    Replace {
        position: usize,
        differences: Vec<String>,
    },
    /// Live rule of the same name sits in another (chain, table)
    Move { from: Rule, position: usize },
}

/// A decision together with the rules it was derived from
#[derive(Debug, Clone)]
pub struct Plan {
    pub desired: Rule,
    pub live: Option<Rule>,
    pub decision: Decision,
}

impl Plan {
    pub fn is_noop(&self) -> bool {
        self.decision == Decision::Unchanged
    }
}

/// Result of one converging step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Unchanged,
    Inserted { position: usize },
    Replaced { position: usize },
    Moved { position: usize },
    Deleted,
    ChainCreated { family: Family },
    ChainDeleted { family: Family },
    PolicySet { family: Family, policy: Policy },
    /// Built-in chains are never created or destroyed
    SkippedBuiltin { family: Family },
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Unchanged => write!(f, "unchanged"),
            Outcome::Inserted { position } => write!(f, "inserted at {position}"),
            Outcome::Replaced { position } => write!(f, "replaced at {position}"),
            Outcome::Moved { position } => write!(f, "moved to position {position}"),
            Outcome::Deleted => write!(f, "deleted"),
            Outcome::ChainCreated { family } => write!(f, "created ({family})"),
            Outcome::ChainDeleted { family } => write!(f, "deleted ({family})"),
            Outcome::PolicySet { family, policy } => write!(f, "policy {policy} ({family})"),
            Outcome::SkippedBuiltin { family } => write!(f, "built-in, skipped ({family})"),
        }
    }
}

/// Per-item result of a manifest run
#[derive(Debug)]
pub struct ItemReport {
    /// Rule or chain name
    pub item: String,
    pub result: Result<Vec<Outcome>>,
}

/// Results for every item of a manifest, in processing order
#[derive(Debug, Default)]
pub struct Report {
    pub items: Vec<ItemReport>,
}

impl Report {
    pub fn failures(&self) -> impl Iterator<Item = &ItemReport> {
        self.items.iter().filter(|i| i.result.is_err())
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }

    /// Number of items that changed live state
    pub fn changed(&self) -> usize {
        self.items
            .iter()
            .filter(|i| {
                i.result
                    .as_ref()
                    .is_ok_and(|o| o.iter().any(|o| *o != Outcome::Unchanged))
            })
            .count()
    }
}

/// Drives desired rules and chains to convergence through a [`CommandRunner`]
pub struct Reconciler<R: CommandRunner> {
    runner: R,
    backends: BTreeMap<Family, FamilyBackend>,
    tables: BTreeMap<Family, SyntaxTable>,
    options: SyntaxOptions,
    audit: Option<AuditLog>,
}

impl<R: CommandRunner> Reconciler<R> {
    /// Builds backends for every family and syntax tables for the rule
    /// families from `config`.
    ///
    /// # Errors
    ///
    /// Propagates syntax table construction failures.
    pub fn new(config: &AppConfig, runner: R) -> Result<Self> {
        let backends = Family::iter().map(|f| (f, config.backend(f))).collect();
        let tables = Family::iter()
            .filter(|f| f.supports_rules())
            .map(|f| SyntaxTable::new(f, &config.syntax).map(|t| (f, t)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok(Self {
            runner,
            backends,
            tables,
            options: config.syntax.clone(),
            audit: None,
        })
    }

    #[must_use]
    pub fn with_audit(mut self, audit: Option<AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn options(&self) -> &SyntaxOptions {
        &self.options
    }

    pub fn backend(&self, family: Family) -> Result<&FamilyBackend> {
        self.backends
            .get(&family)
            .ok_or_else(|| Error::UnsupportedPlatform(format!("no backend for {family}")))
    }

    /// The syntax table of a rule family.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedPlatform`] for families without rule support.
    pub fn table(&self, family: Family) -> Result<&SyntaxTable> {
        self.tables.get(&family).ok_or_else(|| {
            Error::UnsupportedPlatform(format!("rule management is not available for {family}"))
        })
    }

    /// A fresh snapshot of the family's live rules
    pub async fn live_rules(&self, family: Family) -> Result<LiveRuleSet> {
        enumerate(self.backend(family)?, self.table(family)?, &self.runner).await
    }

    pub fn chains(&self) -> ChainManager<'_, R> {
        ChainManager::new(self)
    }

    /// Decides what converging `desired` requires, without mutating anything.
    pub async fn plan(&self, desired: &Rule) -> Result<Plan> {
        let live = self.live_rules(desired.family).await?;
        let position =
            || insert_position(&desired.name, live.names_in(&desired.chain, &desired.table));

        let existing = live.locate(desired);
        let decision = match existing {
            None => Decision::Insert {
                position: position(),
            },
            Some(current) if !current.is_in(&desired.chain, &desired.table) => Decision::Move {
                from: current.clone(),
                position: position(),
            },
            Some(current) => {
                let differences = desired.divergences(current);
                if differences.is_empty() {
                    Decision::Unchanged
                } else {
                    let position = position();
                    if let Some(other) = displaced_rule(&live, desired, position) {
                        warn!(
                            "{}:{} is not in name order; replacing {} at position {} overwrites '{}'",
                            desired.table, desired.chain, desired, position, other
                        );
                    }
                    Decision::Replace {
                        position,
                        differences,
                    }
                }
            }
        };

        debug!("Plan for {}: {:?}", desired, decision);
        Ok(Plan {
            desired: desired.clone(),
            live: existing.cloned(),
            decision,
        })
    }

    /// Converges the live store so that `desired` is present and identical.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] before any invocation if the rule is not
    /// well formed, [`Error::ApplyFailed`] if a mutation fails and
    /// [`Error::PersistFailed`] if the flush after it fails.
    pub async fn ensure_present(&self, desired: &Rule) -> Result<Vec<Outcome>> {
        validate_rule(desired)?;
        let table = self.table(desired.family)?;
        let plan = self.plan(desired).await?;

        let details = |position: usize| {
            serde_json::json!({
                "rule": desired.name,
                "family": desired.family,
                "table": desired.table,
                "chain": desired.chain,
                "position": position,
            })
        };

        match plan.decision {
            Decision::Unchanged => {
                debug!("{} already converged", desired);
                Ok(vec![Outcome::Unchanged])
            }
            Decision::Insert { position } => {
                let args = mutation_args(table, desired, Operation::Insert(position))?;
                info!("Inserting {} at position {}", desired, position);
                self.apply(
                    desired.family,
                    EventType::InsertRule,
                    &desired.name,
                    &args,
                    details(position),
                )
                .await?;
                Ok(vec![Outcome::Inserted { position }])
            }
            Decision::Replace {
                position,
                differences,
            } => {
                let args = mutation_args(table, desired, Operation::Replace(position))?;
                info!(
                    "Replacing {} at position {} ({} differ)",
                    desired,
                    position,
                    differences.join(", ")
                );
                self.apply(
                    desired.family,
                    EventType::ReplaceRule,
                    &desired.name,
                    &args,
                    details(position),
                )
                .await?;
                Ok(vec![Outcome::Replaced { position }])
            }
            Decision::Move { from, position } => {
                let insert = mutation_args(table, desired, Operation::Insert(position))?;
                let delete = delete_args(&from)?;
                info!(
                    "Moving {} from {}:{} to position {}",
                    desired, from.table, from.chain, position
                );
                self.apply(
                    desired.family,
                    EventType::DeleteRule,
                    &from.name,
                    &delete,
                    serde_json::json!({
                        "rule": from.name,
                        "family": from.family,
                        "table": from.table,
                        "chain": from.chain,
                    }),
                )
                .await?;
                self.apply(
                    desired.family,
                    EventType::InsertRule,
                    &desired.name,
                    &insert,
                    details(position),
                )
                .await?;
                Ok(vec![Outcome::Deleted, Outcome::Moved { position }])
            }
        }
    }

    /// Removes the live rule named `name` from `family`, if there is one.
    ///
    /// The delete replays the rule's own dump line, so it matches exactly the
    /// rule the engine holds.
    pub async fn ensure_absent(&self, name: &str, family: Family) -> Result<Vec<Outcome>> {
        let live = self.live_rules(family).await?;
        let Some(rule) = live.find(name) else {
            debug!("{} is already absent from {}", name, family);
            return Ok(vec![Outcome::Unchanged]);
        };

        let args = delete_args(rule)?;
        info!("Deleting {}", rule);
        self.apply(
            family,
            EventType::DeleteRule,
            &rule.name,
            &args,
            serde_json::json!({
                "rule": rule.name,
                "family": family,
                "table": rule.table,
                "chain": rule.chain,
            }),
        )
        .await?;
        Ok(vec![Outcome::Deleted])
    }

    /// Converges every chain, then every rule, of `manifest`.
    ///
    /// A failing item is logged and recorded in the report; the remaining
    /// items are still processed.
    pub async fn reconcile_manifest(&self, manifest: &Manifest) -> Report {
        let mut report = Report::default();

        for spec in &manifest.chains {
            let result = match spec.id() {
                Ok(id) => match spec.ensure {
                    Ensure::Present => self.chains().ensure_present(&id, spec.policy).await,
                    Ensure::Absent => self.chains().ensure_absent(&id).await,
                },
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                error!("Chain {} failed: {}", spec.name, e);
            }
            report.items.push(ItemReport {
                item: spec.name.clone(),
                result,
            });
        }

        for spec in &manifest.rules {
            let result = match spec.ensure {
                Ensure::Present => match spec.to_rule(&self.options) {
                    Ok(rule) => self.ensure_present(&rule).await,
                    Err(e) => Err(e),
                },
                Ensure::Absent => self.ensure_absent(&spec.name, spec.family).await,
            };
            if let Err(e) = &result {
                error!("Rule {} failed: {}", spec.name, e);
            }
            report.items.push(ItemReport {
                item: spec.name.clone(),
                result,
            });
        }

        info!(
            "Manifest processed: {} items, {} changed, {} failed",
            report.items.len(),
            report.changed(),
            report.failures().count()
        );
        report
    }

    /// Runs one mutation, then persists the family. Both steps are audited.
    pub(crate) async fn apply(
        &self,
        family: Family,
        event: EventType,
        subject: &str,
        args: &[String],
        mut details: serde_json::Value,
    ) -> Result<()> {
        let backend = self.backend(family)?;
        if let Some(map) = details.as_object_mut() {
            map.insert(
                "command".to_string(),
                display_command(&backend.commands.binary, args).into(),
            );
        }

        let result = backend.mutate(&self.runner, subject, args).await;
        if let Some(audit) = &self.audit {
            audit
                .record(
                    event,
                    details,
                    result.as_ref().map(|_| ()).map_err(ToString::to_string),
                )
                .await;
        }
        result?;

        let persisted = backend.persist(&self.runner).await;
        if let Some(audit) = &self.audit {
            audit
                .record(
                    EventType::Persist,
                    serde_json::json!({ "family": family, "after": subject }),
                    persisted.as_ref().map(|_| ()).map_err(ToString::to_string),
                )
                .await;
        }
        if let Err(e) = &persisted {
            error!("{}", e);
        }
        persisted
    }
}

/// Name of the live rule sitting at `position` of the desired (chain, table)
/// when that rule is not `desired` itself
fn displaced_rule<'a>(live: &'a LiveRuleSet, desired: &'a Rule, position: usize) -> Option<&'a str> {
    live.names_in(&desired.chain, &desired.table)
        .nth(position.saturating_sub(1))
        .filter(|name| *name != desired.name)
}
