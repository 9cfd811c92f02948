//! Rule dump parser
//!
//! Reads the text a family's save tool prints:
//!
//! ```text
//! # Generated by iptables-save
//! *filter
//! :INPUT ACCEPT [0:0]
//! -A INPUT -p tcp -m multiport --dports 22,80 -m comment --comment "200 web" -j ACCEPT
//! COMMIT
//! ```
//!
//! Each `-A` line is tokenized quote-aware and then taken apart from the end:
//! properties are tried in reverse canonical order, each stripping its flag
//! tokens (plus one value token, unless it is a switch) off the tail. What is
//! left must be exactly `-A <chain>`. Anything else means the line holds syntax
//! outside the known grammar, which is reported rather than skipped.

use crate::core::canonical;
use crate::core::error::{Error, Result};
use crate::core::property::{Family, Property, SyntaxTable, ValueKind};
use crate::core::rule::{Action, PropertyValue, Rule, synthetic_name};
use logos::Logos;
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Flag whose value spans two tokens (`--tcp-flags SYN,RST SYN`)
const TWO_TOKEN_FLAG: &str = "--tcp-flags";

#[derive(Logos, Debug, PartialEq)]
enum Token<'a> {
    #[regex(r"[ \t\r\n]+")]
    Whitespace,

    #[regex(r#""([^"\\]|\\.)*""#, quoted)]
    Quoted(&'a str),

    #[regex(r#"[^ \t\r\n"]+"#, bare)]
    Bare(&'a str),
}

fn quoted<'s>(lex: &mut logos::Lexer<'s, Token<'s>>) -> &'s str {
    let s = lex.slice();
    &s[1..s.len() - 1]
}

fn bare<'s>(lex: &mut logos::Lexer<'s, Token<'s>>) -> &'s str {
    lex.slice()
}

/// Splits a dump line into arguments, honoring double quotes.
///
/// A quoted value is one argument with the quotes removed and `\"` unescaped.
/// Adjacent pieces with no whitespace between them join into one argument.
///
/// # Errors
///
/// Returns [`Error::UnrecognizedRuleSyntax`] on an unbalanced quote.
pub fn tokenize(line: &str) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut current: Option<String> = None;

    for token in Token::lexer(line) {
        match token {
            Ok(Token::Whitespace) => {
                if let Some(arg) = current.take() {
                    args.push(arg);
                }
            }
            Ok(Token::Quoted(s)) => {
                current
                    .get_or_insert_with(String::new)
                    .push_str(&s.replace("\\\"", "\""));
            }
            Ok(Token::Bare(s)) => current.get_or_insert_with(String::new).push_str(s),
            Err(()) => return Err(Error::syntax(line, "unbalanced quote")),
        }
    }
    if let Some(arg) = current {
        args.push(arg);
    }

    Ok(args)
}

/// Joins the two value tokens after `--tcp-flags` into one, so the tail
/// stripper can treat every valued property as taking exactly one token.
fn merge_two_token_values(tokens: &mut Vec<String>) {
    let mut i = 0;
    while i < tokens.len() {
        if tokens[i] == TWO_TOKEN_FLAG && i + 2 < tokens.len() {
            let second = tokens.remove(i + 2);
            tokens[i + 1] = format!("{} {second}", tokens[i + 1]);
        }
        i += 1;
    }
}

/// Parser for one family's dump, built around that family's syntax table
pub struct RuleParser<'t> {
    table: &'t SyntaxTable,
}

impl<'t> RuleParser<'t> {
    pub fn new(table: &'t SyntaxTable) -> Self {
        Self { table }
    }

    pub fn family(&self) -> Family {
        self.table.family()
    }

    /// Parses a whole dump into rules, in dump order.
    ///
    /// Comments, chain declarations, `COMMIT` and blank lines are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnrecognizedRuleSyntax`] for the first rule line that
    /// does not fully decompose, or for a rule line outside any table section.
    pub fn parse_dump(&self, dump: &str) -> Result<Vec<Rule>> {
        let mut current_table: Option<&str> = None;
        let mut rules = Vec::new();

        for raw in dump.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(':') || line == "COMMIT" {
                continue;
            }

            if let Some(table) = line.strip_prefix('*') {
                trace!("Entering table section {}", table);
                current_table = Some(table.trim());
                continue;
            }

            if line.starts_with("-A ") {
                let table = current_table
                    .ok_or_else(|| Error::syntax(line, "rule outside of a table section"))?;
                rules.push(self.parse_line(table, line)?);
                continue;
            }

            return Err(Error::syntax(line, "unexpected line in dump"));
        }

        debug!(
            "Parsed {} {} rules from dump",
            rules.len(),
            self.table.family()
        );
        Ok(rules)
    }

    /// Parses one `-A` line belonging to `table`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnrecognizedRuleSyntax`] if tokens remain after every
    /// known property has been stripped, or if a value fails canonicalization.
    pub fn parse_line(&self, table: &str, line: &str) -> Result<Rule> {
        let mut tokens = tokenize(line)?;
        merge_two_token_values(&mut tokens);

        let mut properties = BTreeMap::new();
        for entry in self.table.entries().iter().rev() {
            for candidate in entry.candidate_tokens() {
                let takes_value = entry.property.kind() != ValueKind::Switch;
                let needed = candidate.len() + usize::from(takes_value);
                // Keep at least `-A <chain>` in front
                if tokens.len() < needed + 2 {
                    continue;
                }

                let flag_start = tokens.len() - needed;
                let matches = tokens[flag_start..flag_start + candidate.len()]
                    .iter()
                    .zip(&candidate)
                    .all(|(t, c)| t == c);
                if !matches {
                    continue;
                }

                let value = if takes_value { tokens.pop() } else { None };
                tokens.truncate(flag_start);
                properties.insert(entry.property, value);
                break;
            }
        }

        match tokens.as_slice() {
            [marker, _chain] if marker == "-A" => {}
            _ => {
                return Err(Error::syntax(
                    line,
                    format!("unrecognized arguments: {}", tokens.join(" ")),
                ));
            }
        }
        let chain = tokens.pop().unwrap_or_default();

        self.build_rule(table, chain, line, properties)
    }

    fn build_rule(
        &self,
        table: &str,
        chain: String,
        line: &str,
        raw: BTreeMap<Property, Option<String>>,
    ) -> Result<Rule> {
        let family = self.table.family();
        let legacy = self.table.options().legacy_set_mark;
        let syntax = |e: Error| Error::syntax(line, e.to_string());

        let mut rule = Rule::new(String::new(), family, table, chain);
        rule.line = Some(line.to_string());

        for (property, value) in raw {
            let Some(value) = value else {
                rule.properties.insert(property, PropertyValue::Switch(true));
                continue;
            };

            let value = match property {
                Property::Name => {
                    rule.name = value;
                    continue;
                }
                Property::Source | Property::Destination => PropertyValue::Text(
                    canonical::canonical_address(&value, family).map_err(syntax)?,
                ),
                p if p.is_port_list() => PropertyValue::List(canonical::split_port_list(&value)),
                Property::State => PropertyValue::List(canonical::canonical_states([value])),
                Property::Icmp => {
                    PropertyValue::Text(canonical::canonical_icmp(&value, family).map_err(syntax)?)
                }
                Property::LogLevel => {
                    PropertyValue::Text(canonical::canonical_log_level(&value).map_err(syntax)?)
                }
                Property::SetMark => PropertyValue::Text(
                    canonical::canonical_set_mark(&value, legacy).map_err(syntax)?,
                ),
                _ => PropertyValue::Text(value),
            };
            rule.properties.insert(property, value);
        }

        if rule.name.is_empty() {
            rule.name = synthetic_name(line);
        }

        rule.properties
            .entry(Property::Proto)
            .or_insert_with(|| PropertyValue::Text("all".to_string()));

        if let Some(action) = rule.jump().and_then(Action::from_target) {
            rule.action = Some(action);
            rule.properties.remove(&Property::Jump);
        }

        if rule.jump() == Some("LOG") {
            rule.properties
                .entry(Property::LogLevel)
                .or_insert_with(|| PropertyValue::Text(canonical::DEFAULT_LOG_LEVEL.to_string()));
        }

        Ok(rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::property::SyntaxOptions;
    use crate::core::rule::is_synthetic_name;

    fn v4() -> SyntaxTable {
        SyntaxTable::new(Family::Ipv4, &SyntaxOptions::default()).unwrap()
    }

    #[test]
    fn test_tokenize_quotes() {
        let tokens = tokenize(r#"-A INPUT -m comment --comment "100 allow ssh" -j ACCEPT"#).unwrap();
        assert_eq!(
            tokens,
            vec!["-A", "INPUT", "-m", "comment", "--comment", "100 allow ssh", "-j", "ACCEPT"]
        );
    }

    #[test]
    fn test_tokenize_escaped_quote_and_unbalanced() {
        let tokens = tokenize(r#"--log-prefix "say \"hi\" ""#).unwrap();
        assert_eq!(tokens, vec!["--log-prefix", "say \"hi\" "]);
        assert!(tokenize(r#"--comment "oops"#).is_err());
    }

    #[test]
    fn test_multiport_comment_accept() {
        let table = v4();
        let parser = RuleParser::new(&table);
        let rule = parser
            .parse_line(
                "filter",
                r#"-A INPUT -m multiport --dports 22,80 -m comment --comment "200 web" -j ACCEPT"#,
            )
            .unwrap();

        assert_eq!(rule.name, "200 web");
        assert_eq!(rule.chain, "INPUT");
        assert_eq!(rule.list(Property::Dport).unwrap(), ["22", "80"]);
        assert_eq!(rule.action, Some(Action::Accept));
        assert!(rule.jump().is_none());
        assert_eq!(rule.text(Property::Proto), Some("all"));
    }

    #[test]
    fn test_fragment_switch_present_and_absent() {
        let table = v4();
        let parser = RuleParser::new(&table);

        let rule = parser.parse_line("filter", "-A INPUT -f -j DROP").unwrap();
        assert_eq!(rule.get(Property::Isfragment), Some(&PropertyValue::Switch(true)));
        assert_eq!(rule.action, Some(Action::Drop));

        let rule = parser.parse_line("filter", "-A INPUT -p tcp -j DROP").unwrap();
        assert!(rule.get(Property::Isfragment).is_none());
    }

    #[test]
    fn test_socket_switch_does_not_eat_neighbours() {
        let table = v4();
        let parser = RuleParser::new(&table);
        let rule = parser
            .parse_line("mangle", "-A PREROUTING -p tcp -m socket -j MARK --set-xmark 0x1/0xffffffff")
            .unwrap();
        assert!(rule.switch(Property::Socket));
        assert_eq!(rule.jump(), Some("MARK"));
        assert_eq!(rule.text(Property::SetMark), Some("0x1/0xffffffff"));
    }

    #[test]
    fn test_tcp_flags_two_tokens() {
        let table = v4();
        let parser = RuleParser::new(&table);
        let rule = parser
            .parse_line("filter", "-A INPUT -p tcp -m tcp --tcp-flags FIN,SYN,RST,ACK SYN -j DROP")
            .unwrap();
        assert_eq!(rule.text(Property::TcpFlags), Some("FIN,SYN,RST,ACK SYN"));
    }

    #[test]
    fn test_state_sorted_and_ranges_canonical() {
        let table = v4();
        let parser = RuleParser::new(&table);
        let rule = parser
            .parse_line(
                "filter",
                r#"-A INPUT -p tcp -m multiport --dports 1024:2048 -m comment --comment "300 high" -m state --state RELATED,ESTABLISHED -j ACCEPT"#,
            )
            .unwrap();
        assert_eq!(rule.list(Property::Dport).unwrap(), ["1024-2048"]);
        assert_eq!(rule.list(Property::State).unwrap(), ["ESTABLISHED", "RELATED"]);
    }

    #[test]
    fn test_log_default_level() {
        let table = v4();
        let parser = RuleParser::new(&table);
        let rule = parser
            .parse_line("filter", r#"-A INPUT -m comment --comment "900 log" -j LOG --log-prefix "dropped: ""#)
            .unwrap();
        assert_eq!(rule.jump(), Some("LOG"));
        assert_eq!(rule.text(Property::LogPrefix), Some("dropped: "));
        assert_eq!(rule.text(Property::LogLevel), Some("4"));
        assert!(rule.action.is_none());
    }

    #[test]
    fn test_unnamed_rule_gets_synthetic_name() {
        let table = v4();
        let parser = RuleParser::new(&table);
        let line = "-A INPUT -s 10.0.0.1/32 -j DROP";
        let rule = parser.parse_line("filter", line).unwrap();
        assert!(is_synthetic_name(&rule.name));
        assert_eq!(rule.name, synthetic_name(line));
        assert_eq!(rule.text(Property::Source), Some("10.0.0.1/32"));
    }

    #[test]
    fn test_unknown_syntax_is_an_error() {
        let table = v4();
        let parser = RuleParser::new(&table);
        for line in [
            "-A INPUT ! -s 10.0.0.1/32 -j DROP",
            "-A INPUT -m recent --set --name ssh -j ACCEPT",
            "-A INPUT -j ACCEPT -s 10.0.0.1/32",
        ] {
            let err = parser.parse_line("filter", line).unwrap_err();
            assert!(matches!(err, Error::UnrecognizedRuleSyntax { .. }), "{line}");
        }
    }

    #[test]
    fn test_parse_dump_tracks_tables() {
        let dump = "\
# Generated by iptables-save v1.8.7
*nat
:PREROUTING ACCEPT [0:0]
:POSTROUTING ACCEPT [0:0]
-A POSTROUTING -o eth0 -m comment --comment \"100 masq\" -j MASQUERADE
COMMIT
*filter
:INPUT DROP [12:3456]
-A INPUT -p tcp -m tcp --dport 22 -m comment --comment \"100 allow ssh\" -j ACCEPT
COMMIT
";
        let table = v4();
        let rules = RuleParser::new(&table).parse_dump(dump).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].table, "nat");
        assert_eq!(rules[0].jump(), Some("MASQUERADE"));
        assert_eq!(rules[1].table, "filter");
        assert_eq!(rules[1].list(Property::Dport).unwrap(), ["22"]);
    }

    #[test]
    fn test_rule_before_table_header() {
        let table = v4();
        let err = RuleParser::new(&table)
            .parse_dump("-A INPUT -j ACCEPT\n")
            .unwrap_err();
        assert!(matches!(err, Error::UnrecognizedRuleSyntax { .. }));
    }

    #[test]
    fn test_ipv6_icmp() {
        let table = SyntaxTable::new(Family::Ipv6, &SyntaxOptions::default()).unwrap();
        let rule = RuleParser::new(&table)
            .parse_line(
                "filter",
                "-A INPUT -s 2001:db8::/32 -p ipv6-icmp -m icmp6 --icmpv6-type 128 -j ACCEPT",
            )
            .unwrap();
        assert_eq!(rule.family, Family::Ipv6);
        assert_eq!(rule.text(Property::Icmp), Some("128"));
        assert_eq!(rule.text(Property::Source), Some("2001:db8::/32"));
    }
}
