//! Rule property vocabulary and the property↔flag syntax table
//!
//! Each protocol family that carries rules gets one [`SyntaxTable`], built once
//! at construction and then only read. The table fixes two things:
//!
//! - which command-line flag sequences express each [`Property`] (some
//!   properties accept several legacy spellings when parsing a dump)
//! - the canonical order in which properties appear, which mirrors the order
//!   the save tools print them so that serialized and dumped rules line up
//!
//! ```
//! use fwconverge::core::property::{Family, Property, SyntaxOptions, SyntaxTable};
//!
//! let table = SyntaxTable::new(Family::Ipv4, &SyntaxOptions::default()).unwrap();
//! assert_eq!(table.entry(Property::Dport).unwrap().flag(), "-m multiport --dports");
//! assert!(SyntaxTable::new(Family::Ethernet, &SyntaxOptions::default()).is_err());
//! ```

use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Protocol family backends.
///
/// Rules are managed for the two address families; chains for all three.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[strum(ascii_case_insensitive)]
pub enum Family {
    /// 32-bit addresses (iptables)
    #[default]
    #[serde(rename = "IPv4", alias = "ipv4")]
    #[strum(serialize = "IPv4")]
    Ipv4,
    /// 128-bit addresses (ip6tables)
    #[serde(rename = "IPv6", alias = "ipv6")]
    #[strum(serialize = "IPv6")]
    Ipv6,
    /// Link layer (ebtables)
    #[serde(rename = "ethernet")]
    #[strum(serialize = "ethernet")]
    Ethernet,
}

impl Family {
    /// Whether this family has a rule provider (as opposed to chains only)
    pub const fn supports_rules(self) -> bool {
        matches!(self, Family::Ipv4 | Family::Ipv6)
    }
}

/// Every rule property the engine knows how to express.
///
/// `Name` is carried by the comment match; parsed rules move it into
/// [`Rule::name`](crate::core::rule::Rule::name).
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Property {
    Source,
    Destination,
    Iniface,
    Outiface,
    Proto,
    Isfragment,
    TcpFlags,
    Gid,
    Uid,
    Sport,
    Dport,
    Port,
    Socket,
    Pkttype,
    Name,
    State,
    Icmp,
    Limit,
    Burst,
    Jump,
    Todest,
    Tosource,
    Toports,
    LogPrefix,
    LogLevel,
    Reject,
    SetMark,
}

/// How a property's value is written after its flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// One token
    Text,
    /// One comma-joined token, held as an ordered list
    List,
    /// Bare switch: the flag alone, no value token
    Switch,
    /// Two tokens, held as one space-joined string
    Pair,
}

impl Property {
    pub const fn kind(self) -> ValueKind {
        match self {
            Property::Isfragment | Property::Socket => ValueKind::Switch,
            Property::TcpFlags => ValueKind::Pair,
            Property::Sport | Property::Dport | Property::Port | Property::State => ValueKind::List,
            _ => ValueKind::Text,
        }
    }

    /// Port-list properties, whose range separator differs between the
    /// declared form (`-`) and the engine's own form (`:`)
    pub const fn is_port_list(self) -> bool {
        matches!(self, Property::Sport | Property::Dport | Property::Port)
    }
}

/// One row of the syntax table
#[derive(Debug, Clone)]
pub struct SyntaxEntry {
    pub property: Property,
    /// Flag spellings; the first is the one emitted
    candidates: Vec<&'static str>,
}

impl SyntaxEntry {
    fn new(property: Property, candidates: &[&'static str]) -> Self {
        Self {
            property,
            candidates: candidates.to_vec(),
        }
    }

    /// The spelling used when serializing
    pub fn flag(&self) -> &'static str {
        self.candidates[0]
    }

    /// All spellings as token sequences, longest first, for tail matching
    pub fn candidate_tokens(&self) -> Vec<Vec<&'static str>> {
        let mut tokens: Vec<Vec<&'static str>> = self
            .candidates
            .iter()
            .map(|c| c.split_whitespace().collect())
            .collect();
        tokens.sort_by_key(|t| std::cmp::Reverse(t.len()));
        tokens
    }
}

/// Knobs that change the table for a given installation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntaxOptions {
    /// iptables older than 1.4.1 only knows `--set-mark`
    #[serde(default)]
    pub legacy_set_mark: bool,
}

/// Read-only property↔flag mapping and canonical order for one family
#[derive(Debug, Clone)]
pub struct SyntaxTable {
    family: Family,
    options: SyntaxOptions,
    entries: Vec<SyntaxEntry>,
}

impl SyntaxTable {
    /// Builds the table for `family`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedPlatform`] for families without a rule provider.
    pub fn new(family: Family, options: &SyntaxOptions) -> Result<Self> {
        use Property as P;

        let entries = match family {
            Family::Ipv4 => {
                let set_mark: &[&'static str] = if options.legacy_set_mark {
                    &["--set-mark", "--set-xmark"]
                } else {
                    &["--set-xmark", "--set-mark"]
                };
                vec![
                    SyntaxEntry::new(P::Source, &["-s"]),
                    SyntaxEntry::new(P::Destination, &["-d"]),
                    SyntaxEntry::new(P::Iniface, &["-i"]),
                    SyntaxEntry::new(P::Outiface, &["-o"]),
                    SyntaxEntry::new(P::Proto, &["-p"]),
                    SyntaxEntry::new(P::Isfragment, &["-f"]),
                    SyntaxEntry::new(P::TcpFlags, &["-m tcp --tcp-flags", "--tcp-flags"]),
                    SyntaxEntry::new(P::Gid, &["-m owner --gid-owner", "--gid-owner"]),
                    SyntaxEntry::new(P::Uid, &["-m owner --uid-owner", "--uid-owner"]),
                    SyntaxEntry::new(
                        P::Sport,
                        &["-m multiport --sports", "-m tcp --sport", "-m udp --sport", "--sport"],
                    ),
                    SyntaxEntry::new(
                        P::Dport,
                        &["-m multiport --dports", "-m tcp --dport", "-m udp --dport", "--dport"],
                    ),
                    SyntaxEntry::new(P::Port, &["-m multiport --ports"]),
                    SyntaxEntry::new(P::Socket, &["-m socket"]),
                    SyntaxEntry::new(P::Pkttype, &["-m pkttype --pkt-type"]),
                    SyntaxEntry::new(P::Name, &["-m comment --comment"]),
                    SyntaxEntry::new(P::State, &["-m state --state", "-m conntrack --ctstate"]),
                    SyntaxEntry::new(P::Icmp, &["-m icmp --icmp-type"]),
                    SyntaxEntry::new(P::Limit, &["-m limit --limit"]),
                    SyntaxEntry::new(P::Burst, &["--limit-burst"]),
                    SyntaxEntry::new(P::Jump, &["-j"]),
                    SyntaxEntry::new(P::Todest, &["--to-destination"]),
                    SyntaxEntry::new(P::Tosource, &["--to-source"]),
                    SyntaxEntry::new(P::Toports, &["--to-ports"]),
                    SyntaxEntry::new(P::LogPrefix, &["--log-prefix"]),
                    SyntaxEntry::new(P::LogLevel, &["--log-level"]),
                    SyntaxEntry::new(P::Reject, &["--reject-with"]),
                    SyntaxEntry::new(P::SetMark, set_mark),
                ]
            }
            Family::Ipv6 => vec![
                SyntaxEntry::new(P::Source, &["-s"]),
                SyntaxEntry::new(P::Destination, &["-d"]),
                SyntaxEntry::new(P::Iniface, &["-i"]),
                SyntaxEntry::new(P::Outiface, &["-o"]),
                SyntaxEntry::new(P::Proto, &["-p"]),
                SyntaxEntry::new(P::Gid, &["-m owner --gid-owner", "--gid-owner"]),
                SyntaxEntry::new(P::Uid, &["-m owner --uid-owner", "--uid-owner"]),
                SyntaxEntry::new(
                    P::Sport,
                    &["-m multiport --sports", "-m tcp --sport", "-m udp --sport", "--sport"],
                ),
                SyntaxEntry::new(
                    P::Dport,
                    &["-m multiport --dports", "-m tcp --dport", "-m udp --dport", "--dport"],
                ),
                SyntaxEntry::new(P::Port, &["-m multiport --ports"]),
                SyntaxEntry::new(P::Pkttype, &["-m pkttype --pkt-type"]),
                SyntaxEntry::new(P::Name, &["-m comment --comment"]),
                SyntaxEntry::new(P::State, &["-m state --state", "-m conntrack --ctstate"]),
                SyntaxEntry::new(P::Icmp, &["-m icmp6 --icmpv6-type"]),
                SyntaxEntry::new(P::Limit, &["-m limit --limit"]),
                SyntaxEntry::new(P::Burst, &["--limit-burst"]),
                SyntaxEntry::new(P::Jump, &["-j"]),
                SyntaxEntry::new(P::Todest, &["--to-destination"]),
                SyntaxEntry::new(P::Tosource, &["--to-source"]),
                SyntaxEntry::new(P::Toports, &["--to-ports"]),
                SyntaxEntry::new(P::LogPrefix, &["--log-prefix"]),
                SyntaxEntry::new(P::LogLevel, &["--log-level"]),
                SyntaxEntry::new(P::Reject, &["--reject-with"]),
            ],
            Family::Ethernet => {
                return Err(Error::UnsupportedPlatform(
                    "rule management is not available for the ethernet family".to_string(),
                ));
            }
        };

        Ok(Self {
            family,
            options: options.clone(),
            entries,
        })
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn options(&self) -> &SyntaxOptions {
        &self.options
    }

    /// Entries in canonical (dump) order
    pub fn entries(&self) -> &[SyntaxEntry] {
        &self.entries
    }

    pub fn entry(&self, property: Property) -> Option<&SyntaxEntry> {
        self.entries.iter().find(|e| e.property == property)
    }

    pub fn supports(&self, property: Property) -> bool {
        self.entry(property).is_some()
    }
}
