//! Forward-chaining rule engine
//!
//! Facts are small tagged tuples; rules are pure functions from the current
//! fact set to newly derivable facts. Chaining stops at a fixed point or at
//! the depth limit, whichever comes first.

use crate::errors::{AppError, Result};
use regex_lite::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Static type-subtype table (subtype, supertype)
const SUBTYPES: &[(&str, &str)] = &[
    ("function", "code_element"),
    ("method", "function"),
    ("class", "code_element"),
    ("module", "code_element"),
    ("variable", "code_element"),
    ("interface", "code_element"),
    ("api", "interface"),
    ("code_element", "artifact"),
    ("page", "document"),
    ("document", "artifact"),
];

/// Static property-implication table (property, implied property)
const PROPERTY_IMPLICATIONS: &[(&str, &str)] = &[
    ("safe", "usable"),
    ("deprecated", "discouraged"),
    ("tested", "reliable"),
    ("documented", "discoverable"),
    ("public", "accessible"),
    ("pure", "deterministic"),
];

/// A ground fact
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Fact {
    Instance(String),
    Type(String, String),
    Property(String, String),
    Relation(String, String, String),
}

impl fmt::Display for Fact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fact::Instance(e) => write!(f, "instance({})", e),
            Fact::Type(e, t) => write!(f, "type({}, {})", e, t),
            Fact::Property(e, p) => write!(f, "property({}, {})", e, p),
            Fact::Relation(s, p, o) => write!(f, "relation({}, {}, {})", s, p, o),
        }
    }
}

fn fact_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*(instance|type|property|relation)\s*\(([^()]*)\)\s*$")
            .expect("fact pattern is valid")
    })
}

impl FromStr for Fact {
    type Err = AppError;

    /// Parse `type(parser, function)` style notation
    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| AppError::Validation {
            message: format!("Invalid fact '{}': {}", s.trim(), reason),
            field: Some("facts".to_string()),
        };

        let caps = fact_pattern()
            .captures(s)
            .ok_or_else(|| invalid("expected kind(arg, ...)"))?;

        let args: Vec<String> = caps[2].split(',').map(|a| a.trim().to_string()).collect();
        if args.iter().any(|a| a.is_empty()) {
            return Err(invalid("empty argument"));
        }

        match (&caps[1], args.as_slice()) {
            ("instance", [e]) => Ok(Fact::Instance(e.clone())),
            ("type", [e, t]) => Ok(Fact::Type(e.clone(), t.clone())),
            ("property", [e, p]) => Ok(Fact::Property(e.clone(), p.clone())),
            ("relation", [s, p, o]) => Ok(Fact::Relation(s.clone(), p.clone(), o.clone())),
            (kind, _) => Err(invalid(&format!("wrong number of arguments for {}", kind))),
        }
    }
}

/// What a rule derives; determines conclusion confidence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivationKind {
    Type,
    Property,
}

/// A newly derivable fact and the fact it follows from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Derivation {
    pub fact: Fact,
    pub premise: Fact,
}

/// A named inference rule
#[derive(Debug, Clone, Copy)]
pub struct RuleDef {
    pub name: &'static str,
    pub kind: DerivationKind,
    pub description: &'static str,
    pub apply: fn(&BTreeSet<Fact>) -> Vec<Derivation>,
}

pub static BUILTIN_RULES: &[RuleDef] = &[
    RuleDef {
        name: "subtype",
        kind: DerivationKind::Type,
        description: "type(X, T) and T is a subtype of S implies type(X, S)",
        apply: apply_subtypes,
    },
    RuleDef {
        name: "property_implication",
        kind: DerivationKind::Property,
        description: "property(X, P) and P implies Q implies property(X, Q)",
        apply: apply_property_implications,
    },
];

fn apply_subtypes(facts: &BTreeSet<Fact>) -> Vec<Derivation> {
    facts
        .iter()
        .filter_map(|fact| match fact {
            Fact::Type(entity, t) => Some((fact, entity, t)),
            _ => None,
        })
        .flat_map(|(premise, entity, t)| {
            SUBTYPES
                .iter()
                .filter(move |(sub, _)| sub == t)
                .map(move |(_, sup)| Derivation {
                    fact: Fact::Type(entity.clone(), sup.to_string()),
                    premise: premise.clone(),
                })
        })
        .collect()
}

fn apply_property_implications(facts: &BTreeSet<Fact>) -> Vec<Derivation> {
    facts
        .iter()
        .filter_map(|fact| match fact {
            Fact::Property(entity, p) => Some((fact, entity, p)),
            _ => None,
        })
        .flat_map(|(premise, entity, p)| {
            PROPERTY_IMPLICATIONS
                .iter()
                .filter(move |(from, _)| from == p)
                .map(move |(_, implied)| Derivation {
                    fact: Fact::Property(entity.clone(), implied.to_string()),
                    premise: premise.clone(),
                })
        })
        .collect()
}

/// How a fact entered the fact set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Given,
    Derived {
        rule: &'static str,
        kind: DerivationKind,
        premise: Fact,
        iteration: usize,
    },
}

#[derive(Debug, Clone)]
pub struct ChainResult {
    pub facts: BTreeMap<Fact, Origin>,
    pub iterations: usize,
    pub reached_fixed_point: bool,
}

impl ChainResult {
    pub fn derived(&self) -> impl Iterator<Item = (&Fact, &Origin)> {
        self.facts.iter().filter(|(_, o)| matches!(o, Origin::Derived { .. }))
    }
}

/// Apply `rules` until an iteration adds nothing or `max_depth` iterations ran
pub fn forward_chain(
    initial: impl IntoIterator<Item = Fact>,
    rules: &[RuleDef],
    max_depth: usize,
) -> ChainResult {
    let mut facts: BTreeMap<Fact, Origin> =
        initial.into_iter().map(|f| (f, Origin::Given)).collect();
    let mut iterations = 0;
    let mut reached_fixed_point = false;

    while iterations < max_depth {
        iterations += 1;
        let current: BTreeSet<Fact> = facts.keys().cloned().collect();
        let mut added = 0;

        for rule in rules {
            for derivation in (rule.apply)(&current) {
                if facts.contains_key(&derivation.fact) {
                    continue;
                }
                facts.insert(
                    derivation.fact,
                    Origin::Derived {
                        rule: rule.name,
                        kind: rule.kind,
                        premise: derivation.premise,
                        iteration: iterations,
                    },
                );
                added += 1;
            }
        }

        if added == 0 {
            reached_fixed_point = true;
            break;
        }
    }

    tracing::debug!(
        facts = facts.len(),
        iterations,
        reached_fixed_point,
        "Forward chaining finished"
    );

    ChainResult {
        facts,
        iterations,
        reached_fixed_point,
    }
}
