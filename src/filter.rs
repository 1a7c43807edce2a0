//! RFC 4515 filter strings: parsing, printing and escaping.

use std::borrow::Cow;
use std::fmt::Write;

use bytes::Bytes;
use once_cell::sync::Lazy;
use pest::{
    iterators::{Pair, Pairs},
    Parser,
};
use pest_derive::Parser;
use regex::bytes::{Captures, Regex};

use crate::{
    error::Error,
    proto::{Filter, SubstringPart},
};

type RulePair<'a> = Pair<'a, Rule>;
type RulePairs<'a> = Pairs<'a, Rule>;

#[inline]
fn nibble_to_bin(nibble: u8) -> u8 {
    match nibble {
        b'0'..=b'9' => nibble - b'0',
        b'a'..=b'f' => nibble - b'a' + 10,
        b'A'..=b'F' => nibble - b'A' + 10,
        _ => panic!("Unexpected value"),
    }
}

#[inline]
fn byte_to_bin(data: &[u8]) -> u8 {
    (nibble_to_bin(data[0]) << 4) | nibble_to_bin(data[1])
}

fn unescape(s: &[u8]) -> Cow<[u8]> {
    static HEX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\\([\da-fA-F]{2})"#).unwrap());

    HEX_RE.replace_all(s, |caps: &Captures| [byte_to_bin(&caps[1])])
}

/// Replace NUL, `(`, `)`, `*`, `\` and every byte above 0x7f with its
/// lowercase `\HH` form, making `value` safe to embed in a filter string.
pub fn escape_filter<S: AsRef<str>>(value: S) -> String {
    escape_bytes(value.as_ref().as_bytes())
}

pub(crate) fn escape_bytes(value: &[u8]) -> String {
    let mut out = String::with_capacity(value.len());
    for &b in value {
        match b {
            0x00 | b'(' | b')' | b'*' | b'\\' => {
                let _ = write!(out, "\\{b:02x}");
            }
            _ if b >= 0x80 => {
                let _ = write!(out, "\\{b:02x}");
            }
            _ => out.push(b as char),
        }
    }
    out
}

#[derive(Parser)]
#[grammar = "filter.pest"]
pub(crate) struct FilterParser;

pub fn parse_filter<S: AsRef<str>>(filter: S) -> Result<Filter, Error> {
    let mut parsed = FilterParser::parse(Rule::rfc2254, filter.as_ref())?;
    Ok(parse_rule(parsed.next().expect("No top level rule")))
}

fn as_bytes(pair: &RulePair) -> Bytes {
    unescape(pair.as_str().as_bytes()).into_owned().into()
}

fn as_inner(pair: RulePair) -> RulePair {
    pair.into_inner().next().expect("No inner rule")
}

fn parse_rule(pair: RulePair) -> Filter {
    match pair.as_rule() {
        Rule::and => Filter::And(parse_set(pair.into_inner())),
        Rule::or => Filter::Or(parse_set(pair.into_inner())),
        Rule::not => Filter::Not(Box::new(parse_rule(as_inner(pair)))),
        Rule::simple => parse_simple(pair.into_inner()),
        Rule::present => Filter::Present(as_inner(pair).as_str().to_owned()),
        Rule::substring => parse_substring(pair.into_inner()),
        Rule::extensible => parse_extensible(pair.into_inner()),
        _ => panic!("Unexpected rule"),
    }
}

fn parse_set(pairs: RulePairs) -> Vec<Filter> {
    pairs.map(parse_rule).collect()
}

fn parse_simple(pairs: RulePairs) -> Filter {
    let pairs = pairs.collect::<Vec<_>>();
    let attribute = pairs[0].as_str().to_owned();
    let value = as_bytes(&pairs[2]);
    match pairs[1].as_rule() {
        Rule::equal => Filter::EqualityMatch { attribute, value },
        Rule::approx => Filter::ApproxMatch { attribute, value },
        Rule::greater => Filter::GreaterOrEqual { attribute, value },
        Rule::less => Filter::LessOrEqual { attribute, value },
        _ => panic!("Unexpected rule"),
    }
}

fn parse_substring(mut pairs: RulePairs) -> Filter {
    let attribute = pairs.next().expect("No substring attribute").as_str().to_owned();
    let parts = pairs
        .map(|pair| match pair.as_rule() {
            Rule::initial => SubstringPart::Initial(as_bytes(&pair)),
            Rule::any => SubstringPart::Any(as_bytes(&pair)),
            Rule::final_ => SubstringPart::Final(as_bytes(&pair)),
            _ => panic!("Unexpected rule"),
        })
        .collect();
    Filter::Substrings { attribute, parts }
}

fn parse_extensible(pairs: RulePairs) -> Filter {
    let mut matching_rule = None;
    let mut attribute = None;
    let mut value = Bytes::new();
    let mut dn_attributes = false;
    for pair in pairs {
        match pair.as_rule() {
            Rule::ident => attribute = Some(pair.as_str().to_owned()),
            Rule::dnattr => dn_attributes = true,
            Rule::ruleid => matching_rule = Some(pair.as_str().to_owned()),
            Rule::string => value = as_bytes(&pair),
            _ => panic!("Unexpected rule"),
        }
    }
    Filter::ExtensibleMatch {
        matching_rule,
        attribute,
        value,
        dn_attributes,
    }
}

impl Filter {
    /// Canonical RFC 4515 string form; `parse_filter` inverts it.
    pub fn to_filter_string(&self) -> String {
        match self {
            Filter::And(children) => format!(
                "(&{})",
                children.iter().map(Filter::to_filter_string).collect::<String>()
            ),
            Filter::Or(children) => format!(
                "(|{})",
                children.iter().map(Filter::to_filter_string).collect::<String>()
            ),
            Filter::Not(child) => format!("(!{})", child.to_filter_string()),
            Filter::EqualityMatch { attribute, value } => {
                format!("({}={})", attribute, escape_bytes(value))
            }
            Filter::ApproxMatch { attribute, value } => {
                format!("({}~={})", attribute, escape_bytes(value))
            }
            Filter::GreaterOrEqual { attribute, value } => {
                format!("({}>={})", attribute, escape_bytes(value))
            }
            Filter::LessOrEqual { attribute, value } => {
                format!("({}<={})", attribute, escape_bytes(value))
            }
            Filter::Present(attribute) => format!("({attribute}=*)"),
            Filter::Substrings { attribute, parts } => {
                let mut out = format!("({attribute}=");
                for part in parts {
                    match part {
                        SubstringPart::Initial(v) => out.push_str(&escape_bytes(v)),
                        SubstringPart::Any(v) | SubstringPart::Final(v) => {
                            out.push('*');
                            out.push_str(&escape_bytes(v));
                        }
                    }
                }
                if !matches!(parts.last(), Some(SubstringPart::Final(_))) {
                    out.push('*');
                }
                out.push(')');
                out
            }
            Filter::ExtensibleMatch {
                matching_rule,
                attribute,
                value,
                dn_attributes,
            } => {
                let mut out = String::from("(");
                if let Some(attribute) = attribute {
                    out.push_str(attribute);
                }
                if *dn_attributes {
                    out.push_str(":dn");
                }
                if let Some(rule) = matching_rule {
                    out.push(':');
                    out.push_str(rule);
                }
                out.push_str(":=");
                out.push_str(&escape_bytes(value));
                out.push(')');
                out
            }
        }
    }
}
