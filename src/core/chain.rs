//! Chain management across the three protocol families
//!
//! Chains are identified as `CHAIN:table:family`, where `family` is `IPv4`,
//! `IPv6`, `ethernet`, or `IP` for both address families at once. Unlike
//! rules, chains exist for the link-layer family too; its save tool prints
//! chain declarations without packet counters.
//!
//! Built-in chains are never created or destroyed, only warned about. Their
//! default policy can still be set.

use crate::audit::EventType;
use crate::core::backend::CommandRunner;
use crate::core::error::{Error, Result};
use crate::core::property::Family;
use crate::core::reconcile::{Outcome, Reconciler};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use strum::IntoEnumIterator;
use tracing::{debug, info, warn};

/// Chains that exist by construction in some table of every family
pub const BUILTIN_CHAINS: [&str; 6] = [
    "PREROUTING",
    "POSTROUTING",
    "BROUTING",
    "INPUT",
    "FORWARD",
    "OUTPUT",
];

/// Tables a chain may be declared in
pub const CHAIN_TABLES: [&str; 6] = ["nat", "mangle", "filter", "raw", "rawpost", "broute"];

const ETHERNET_TABLES: [&str; 3] = ["filter", "nat", "broute"];

static IP_CHAIN_RE: LazyLock<std::result::Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^:(.+)\s(\S+)\s\[\d+:\d+\]$"));
static ETHERNET_CHAIN_RE: LazyLock<std::result::Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^:(.+)\s(\S+)$"));

pub fn is_builtin(chain: &str) -> bool {
    BUILTIN_CHAINS.contains(&chain)
}

/// Default chain policy
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Policy {
    Accept,
    Drop,
    Return,
    /// Leave whatever policy the chain has
    Empty,
}

impl Policy {
    /// Token passed to `-P`; `None` for [`Policy::Empty`]
    pub const fn token(self) -> Option<&'static str> {
        match self {
            Policy::Accept => Some("ACCEPT"),
            Policy::Drop => Some("DROP"),
            Policy::Return => Some("RETURN"),
            Policy::Empty => None,
        }
    }
}

/// Identity of a declared chain, possibly spanning both address families
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainId {
    pub chain: String,
    pub table: String,
    pub families: Vec<Family>,
}

impl FromStr for ChainId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |message: String| Error::validation("chain", format!("[{s}] {message}"));

        let parts: Vec<&str> = s.split(':').collect();
        let [chain, table, family] = parts.as_slice() else {
            return Err(invalid(
                "chain names must look like CHAIN:table:family".to_string(),
            ));
        };

        crate::validators::validate_chain_name(chain).map_err(invalid)?;
        if !CHAIN_TABLES.contains(table) {
            return Err(invalid(format!("unknown table '{table}'")));
        }

        let families = if *family == "IP" {
            vec![Family::Ipv4, Family::Ipv6]
        } else {
            let parsed = family
                .parse::<Family>()
                .map_err(|_| invalid(format!("unknown family '{family}'")))?;
            vec![parsed]
        };

        let ethernet = families.contains(&Family::Ethernet);
        if ethernet && !ETHERNET_TABLES.contains(table) {
            return Err(invalid(format!(
                "table '{table}' does not exist for the ethernet family"
            )));
        }
        if !ethernet && *table == "broute" {
            return Err(invalid("table 'broute' only exists for the ethernet family".to_string()));
        }

        Ok(Self {
            chain: (*chain).to_string(),
            table: (*table).to_string(),
            families,
        })
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.families.as_slice() {
            [Family::Ipv4, Family::Ipv6] => write!(f, "{}:{}:IP", self.chain, self.table),
            [family] => write!(f, "{}:{}:{}", self.chain, self.table, family),
            _ => write!(f, "{}:{}", self.chain, self.table),
        }
    }
}

/// A chain declared in a live dump
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiveChain {
    pub chain: String,
    pub table: String,
    pub family: Family,
    /// `None` for user-defined chains of the address families (`-`)
    pub policy: Option<String>,
}

impl LiveChain {
    pub fn is_builtin(&self) -> bool {
        is_builtin(&self.chain)
    }
}

/// Extracts chain declarations from one family's dump.
///
/// # Errors
///
/// Returns [`Error::UnrecognizedRuleSyntax`] for a declaration that does not
/// fit the family's format or appears outside a table section.
pub fn parse_chains(family: Family, dump: &str) -> Result<Vec<LiveChain>> {
    let pattern = match family {
        Family::Ethernet => &*ETHERNET_CHAIN_RE,
        Family::Ipv4 | Family::Ipv6 => &*IP_CHAIN_RE,
    };
    let re = pattern
        .as_ref()
        .map_err(|e| Error::Internal(format!("chain declaration pattern: {e}")))?;

    let mut table: Option<&str> = None;
    let mut chains = Vec::new();

    for line in dump.lines().map(str::trim) {
        if let Some(name) = line.strip_prefix('*') {
            table = Some(name.trim());
            continue;
        }
        if !line.starts_with(':') {
            continue;
        }

        let caps = re
            .captures(line)
            .ok_or_else(|| Error::syntax(line, format!("malformed {family} chain declaration")))?;
        let table =
            table.ok_or_else(|| Error::syntax(line, "chain declaration outside of a table section"))?;
        let policy = match &caps[2] {
            "-" => None,
            p => Some(p.to_string()),
        };

        chains.push(LiveChain {
            chain: caps[1].to_string(),
            table: table.to_string(),
            family,
            policy,
        });
    }

    Ok(chains)
}

fn chain_args(table: &str, op: &str, chain: &str, extra: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "-t".to_string(),
        table.to_string(),
        op.to_string(),
        chain.to_string(),
    ];
    args.extend(extra.map(String::from));
    args
}

/// Create/destroy/set-policy operations, borrowed from a [`Reconciler`]
pub struct ChainManager<'r, R: CommandRunner> {
    reconciler: &'r Reconciler<R>,
}

impl<'r, R: CommandRunner> ChainManager<'r, R> {
    pub(crate) fn new(reconciler: &'r Reconciler<R>) -> Self {
        Self { reconciler }
    }

    /// Live chains of one family. Any failure is returned.
    pub async fn live_chains(&self, family: Family) -> Result<Vec<LiveChain>> {
        let backend = self.reconciler.backend(family)?;
        let dump = backend.dump(self.reconciler.runner()).await?;
        parse_chains(family, &dump)
    }

    /// Live chains of every family.
    ///
    /// A family whose save tool is missing or failing is skipped with a
    /// warning; malformed output is still an error.
    pub async fn enumerate(&self) -> Result<Vec<LiveChain>> {
        let mut all = Vec::new();
        for family in Family::iter() {
            match self.live_chains(family).await {
                Ok(chains) => all.extend(chains),
                Err(e @ (Error::Io(_) | Error::DumpFailed { .. })) => {
                    warn!("Skipping {} chains, backend unavailable: {}", family, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(all)
    }

    async fn find(&self, id: &ChainId, family: Family) -> Result<Option<LiveChain>> {
        Ok(self
            .live_chains(family)
            .await?
            .into_iter()
            .find(|c| c.chain == id.chain && c.table == id.table))
    }

    /// Creates the chain in every family it names and applies `policy`.
    ///
    /// A chain that already exists only gets its policy changed, and only if
    /// it differs.
    pub async fn ensure_present(&self, id: &ChainId, policy: Option<Policy>) -> Result<Vec<Outcome>> {
        let builtin = is_builtin(&id.chain);
        let mut outcomes = Vec::new();

        for &family in &id.families {
            let live = self.find(id, family).await?;

            if builtin {
                warn!("Attempting to create built-in chain {} ({})", id, family);
                if live.is_none() {
                    outcomes.push(Outcome::SkippedBuiltin { family });
                    continue;
                }
            } else if live.is_none() {
                info!("Creating chain {} ({})", id, family);
                self.reconciler
                    .apply(
                        family,
                        EventType::CreateChain,
                        &id.to_string(),
                        &chain_args(&id.table, "-N", &id.chain, None),
                        serde_json::json!({ "chain": id.chain, "table": id.table, "family": family }),
                    )
                    .await?;
                outcomes.push(Outcome::ChainCreated { family });
            } else {
                debug!("Chain {} ({}) already exists", id, family);
            }

            let current = live.as_ref().and_then(|c| c.policy.as_deref());
            match self.converge_policy(id, family, current, policy).await? {
                Some(outcome) => outcomes.push(outcome),
                None if live.is_some() && builtin => {
                    outcomes.push(Outcome::SkippedBuiltin { family });
                }
                None if live.is_some() => outcomes.push(Outcome::Unchanged),
                None => {}
            }
        }

        Ok(outcomes)
    }

    /// Destroys the chain in every family it names. Rules inside it are not
    /// touched; the engine refuses to delete a non-empty chain.
    pub async fn ensure_absent(&self, id: &ChainId) -> Result<Vec<Outcome>> {
        let mut outcomes = Vec::new();

        for &family in &id.families {
            if is_builtin(&id.chain) {
                warn!("Attempting to destroy built-in chain {} ({})", id, family);
                outcomes.push(Outcome::SkippedBuiltin { family });
                continue;
            }

            if self.find(id, family).await?.is_none() {
                debug!("Chain {} ({}) is already absent", id, family);
                outcomes.push(Outcome::Unchanged);
                continue;
            }

            info!("Deleting chain {} ({})", id, family);
            self.reconciler
                .apply(
                    family,
                    EventType::DeleteChain,
                    &id.to_string(),
                    &chain_args(&id.table, "-X", &id.chain, None),
                    serde_json::json!({ "chain": id.chain, "table": id.table, "family": family }),
                )
                .await?;
            outcomes.push(Outcome::ChainDeleted { family });
        }

        Ok(outcomes)
    }

    /// Sets the default policy in every family the chain names.
    ///
    /// [`Policy::Empty`] is a no-op.
    pub async fn set_policy(&self, id: &ChainId, policy: Policy) -> Result<Vec<Outcome>> {
        if policy.token().is_none() {
            debug!("No policy requested for {}", id);
            return Ok(vec![Outcome::Unchanged]);
        }

        let mut outcomes = Vec::new();
        for &family in &id.families {
            let live = self.find(id, family).await?;
            let current = live.as_ref().and_then(|c| c.policy.as_deref());
            outcomes.push(
                self.converge_policy(id, family, current, Some(policy))
                    .await?
                    .unwrap_or(Outcome::Unchanged),
            );
        }
        Ok(outcomes)
    }

    async fn converge_policy(
        &self,
        id: &ChainId,
        family: Family,
        current: Option<&str>,
        policy: Option<Policy>,
    ) -> Result<Option<Outcome>> {
        let Some(policy) = policy else {
            return Ok(None);
        };
        let Some(token) = policy.token() else {
            return Ok(None);
        };
        if current == Some(token) {
            return Ok(None);
        }

        info!("Setting policy of {} ({}) to {}", id, family, token);
        self.reconciler
            .apply(
                family,
                EventType::SetPolicy,
                &id.to_string(),
                &chain_args(&id.table, "-P", &id.chain, Some(token)),
                serde_json::json!({
                    "chain": id.chain,
                    "table": id.table,
                    "family": family,
                    "policy": token,
                }),
            )
            .await?;
        Ok(Some(Outcome::PolicySet { family, policy }))
    }
}
