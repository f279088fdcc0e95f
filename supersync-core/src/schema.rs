//! Declarative schema rules and the validator that checks values against them.
//!
//! A [`Schema`] maps top-level property names to [`Rule`]s. Rules are either
//! built in code with the constructor helpers or deserialized from JSON:
//!
//! ```json
//! { "name": { "type": "string", "minLength": 1, "maxLength": 80 },
//!   "type": { "type": "string?" } }
//! ```
//!
//! Validation never fails loudly; [`check_violation`] returns the first
//! [`Violation`] it finds, and [`format_violation`] renders the diagnostic
//! string that is sent back to clients.

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Errors raised while building a schema from its JSON description.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Unknown rule type: {0}")]
    UnknownType(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("Invalid items for {kind} rule: {message}")]
    InvalidItems { kind: &'static str, message: String },
}

/// A compiled string pattern.
#[derive(Debug, Clone)]
pub struct Pattern(Regex);

impl Pattern {
    pub fn new(source: &str) -> Result<Self, SchemaError> {
        Ok(Self(Regex::new(source)?))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.0.is_match(text)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

/// Constraints shared by string rules.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StringRule {
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub length: Option<usize>,
    pub pattern: Option<Pattern>,
    /// Allowed values, if the string is restricted to a set
    pub one_of: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ArrayRule {
    pub items: Option<Box<Rule>>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub length: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct HashRule {
    /// Declared sub-properties. Unknown keys are rejected when set.
    pub properties: Option<BTreeMap<String, Rule>>,
    /// Rule applied to every value of an open-keyed hash
    pub values: Option<Box<Rule>>,
    /// Rule applied to every key (checked as a string)
    pub keys: Option<Box<Rule>>,
}

/// The shape a rule constrains a value to.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleKind {
    Boolean,
    Number { min: Option<f64>, max: Option<f64> },
    Integer { min: Option<f64>, max: Option<f64> },
    String(StringRule),
    Enum { items: Vec<String> },
    Array(ArrayRule),
    Hash(HashRule),
    /// Accepts anything, including everything nested below it
    Any,
}

impl RuleKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            RuleKind::Boolean => "boolean",
            RuleKind::Number { .. } => "number",
            RuleKind::Integer { .. } => "integer",
            RuleKind::String(_) => "string",
            RuleKind::Enum { .. } => "enum",
            RuleKind::Array(_) => "array",
            RuleKind::Hash(_) => "hash",
            RuleKind::Any => "any",
        }
    }
}

/// A single declarative constraint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RuleDef")]
pub struct Rule {
    pub kind: RuleKind,
    /// `null` (or an absent hash property) is accepted
    pub optional: bool,
    /// Whether the value may change after creation
    pub mutable: bool,
}

impl Rule {
    pub fn new(kind: RuleKind) -> Self {
        Self {
            kind,
            optional: false,
            mutable: true,
        }
    }

    pub fn boolean() -> Self {
        Self::new(RuleKind::Boolean)
    }

    pub fn number() -> Self {
        Self::new(RuleKind::Number { min: None, max: None })
    }

    pub fn integer() -> Self {
        Self::new(RuleKind::Integer { min: None, max: None })
    }

    pub fn string() -> Self {
        Self::new(RuleKind::String(StringRule::default()))
    }

    pub fn enumeration<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(RuleKind::Enum {
            items: items.into_iter().map(Into::into).collect(),
        })
    }

    /// An array whose elements all match `items`.
    pub fn array(items: Rule) -> Self {
        Self::new(RuleKind::Array(ArrayRule {
            items: Some(Box::new(items)),
            ..ArrayRule::default()
        }))
    }

    /// An array with unchecked elements.
    pub fn any_array() -> Self {
        Self::new(RuleKind::Array(ArrayRule::default()))
    }

    /// A hash with the given declared properties.
    pub fn hash<I, K>(properties: I) -> Self
    where
        I: IntoIterator<Item = (K, Rule)>,
        K: Into<String>,
    {
        Self::new(RuleKind::Hash(HashRule {
            properties: Some(
                properties
                    .into_iter()
                    .map(|(key, rule)| (key.into(), rule))
                    .collect(),
            ),
            ..HashRule::default()
        }))
    }

    /// An open-keyed hash whose values all match `values`.
    pub fn map_of(values: Rule) -> Self {
        Self::new(RuleKind::Hash(HashRule {
            values: Some(Box::new(values)),
            ..HashRule::default()
        }))
    }

    pub fn any() -> Self {
        Self::new(RuleKind::Any)
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn immutable(mut self) -> Self {
        self.mutable = false;
        self
    }

    /// Lower bound for number and integer rules. Ignored by other kinds.
    pub fn min(mut self, value: f64) -> Self {
        if let RuleKind::Number { min, .. } | RuleKind::Integer { min, .. } = &mut self.kind {
            *min = Some(value);
        }
        self
    }

    /// Upper bound for number and integer rules. Ignored by other kinds.
    pub fn max(mut self, value: f64) -> Self {
        if let RuleKind::Number { max, .. } | RuleKind::Integer { max, .. } = &mut self.kind {
            *max = Some(value);
        }
        self
    }

    /// Minimum length for string and array rules. Ignored by other kinds.
    pub fn min_length(mut self, value: usize) -> Self {
        match &mut self.kind {
            RuleKind::String(s) => s.min_length = Some(value),
            RuleKind::Array(a) => a.min_length = Some(value),
            _ => {}
        }
        self
    }

    /// Maximum length for string and array rules. Ignored by other kinds.
    pub fn max_length(mut self, value: usize) -> Self {
        match &mut self.kind {
            RuleKind::String(s) => s.max_length = Some(value),
            RuleKind::Array(a) => a.max_length = Some(value),
            _ => {}
        }
        self
    }

    pub fn pattern(mut self, source: &str) -> Result<Self, SchemaError> {
        if let RuleKind::String(s) = &mut self.kind {
            s.pattern = Some(Pattern::new(source)?);
        }
        Ok(self)
    }

    /// Restrict a string rule to a fixed set of values.
    pub fn one_of<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let RuleKind::String(s) = &mut self.kind {
            s.one_of = Some(values.into_iter().map(Into::into).collect());
        }
        self
    }

    pub fn is_any(&self) -> bool {
        matches!(self.kind, RuleKind::Any)
    }

    /// Rule for the nested property `key`, if this rule describes one.
    pub fn child(&self, key: &str) -> Option<&Rule> {
        match &self.kind {
            RuleKind::Hash(hash) => hash
                .properties
                .as_ref()
                .and_then(|properties| properties.get(key))
                .or(hash.values.as_deref()),
            _ => None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// JSON form of a rule, before compilation.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuleDef {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    optional: bool,
    #[serde(default = "default_true")]
    mutable: bool,
    min: Option<f64>,
    max: Option<f64>,
    min_length: Option<usize>,
    max_length: Option<usize>,
    length: Option<usize>,
    pattern: Option<String>,
    #[serde(rename = "enum")]
    one_of: Option<Vec<String>>,
    /// Allowed values for `enum`, element rule for `array`
    items: Option<Value>,
    properties: Option<BTreeMap<String, Rule>>,
    values: Option<Box<Rule>>,
    keys: Option<Box<Rule>>,
}

impl TryFrom<RuleDef> for Rule {
    type Error = SchemaError;

    fn try_from(def: RuleDef) -> Result<Self, Self::Error> {
        let (name, trailing_optional) = match def.kind.strip_suffix('?') {
            Some(name) => (name, true),
            None => (def.kind.as_str(), false),
        };

        let kind = match name {
            "boolean" => RuleKind::Boolean,
            "number" => RuleKind::Number {
                min: def.min,
                max: def.max,
            },
            "integer" => RuleKind::Integer {
                min: def.min,
                max: def.max,
            },
            "string" => RuleKind::String(StringRule {
                min_length: def.min_length,
                max_length: def.max_length,
                length: def.length,
                pattern: def.pattern.as_deref().map(Pattern::new).transpose()?,
                one_of: def.one_of,
            }),
            "enum" => {
                let items = match def.items {
                    Some(items) => serde_json::from_value::<Vec<String>>(items).map_err(|e| {
                        SchemaError::InvalidItems {
                            kind: "enum",
                            message: e.to_string(),
                        }
                    })?,
                    None => Vec::new(),
                };
                RuleKind::Enum { items }
            }
            "array" => {
                let items = match def.items {
                    Some(items) => Some(Box::new(serde_json::from_value::<Rule>(items).map_err(
                        |e| SchemaError::InvalidItems {
                            kind: "array",
                            message: e.to_string(),
                        },
                    )?)),
                    None => None,
                };
                RuleKind::Array(ArrayRule {
                    items,
                    min_length: def.min_length,
                    max_length: def.max_length,
                    length: def.length,
                })
            }
            "hash" => RuleKind::Hash(HashRule {
                properties: def.properties,
                values: def.values,
                keys: def.keys,
            }),
            "any" => RuleKind::Any,
            other => return Err(SchemaError::UnknownType(other.to_string())),
        };

        Ok(Rule {
            kind,
            optional: def.optional || trailing_optional,
            mutable: def.mutable,
        })
    }
}

/// A mapping from top-level property name to rule.
///
/// Attached once to a replica and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    rules: BTreeMap<String, Rule>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(value: &Value) -> Result<Self, serde_json::Error> {
        Schema::deserialize(value)
    }

    pub fn with(mut self, key: impl Into<String>, rule: Rule) -> Self {
        self.rules.insert(key.into(), rule);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Rule> {
        self.rules.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Rule)> {
        self.rules.iter().map(|(key, rule)| (key.as_str(), rule))
    }

    /// Clients may only pick ids for items when the schema declares one.
    pub fn allows_client_ids(&self) -> bool {
        self.rules.contains_key("id")
    }

    /// Resolve the rule governing a dotted property path.
    ///
    /// Walking stops at the first `any` rule, which then governs the rest of
    /// the path.
    pub fn resolve_path(&self, path: &str) -> Option<&Rule> {
        let mut segments = path.split('.');
        let first = segments.next().filter(|s| !s.is_empty())?;
        let mut rule = self.rules.get(first)?;

        for segment in segments {
            if rule.is_any() {
                return Some(rule);
            }
            if segment.is_empty() {
                return None;
            }
            rule = rule.child(segment)?;
        }

        Some(rule)
    }
}

/// What went wrong when a value failed its rule.
#[derive(Debug, Clone, PartialEq)]
pub enum ViolationKind {
    Immutable,
    ExpectedType(&'static str),
    BelowMinimum { value: f64, min: f64 },
    AboveMaximum { value: f64, max: f64 },
    TooShort { len: usize, min: usize },
    TooLong { len: usize, max: usize },
    WrongLength { len: usize, expected: usize },
    PatternMismatch { pattern: String },
    NotAllowed { value: String },
    UnexpectedProperty(String),
    MissingProperty(String),
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationKind::Immutable => write!(f, "Immutable"),
            ViolationKind::ExpectedType(name) => write!(f, "Expected {}", name),
            ViolationKind::BelowMinimum { value, min } => {
                write!(f, "Value ({}) is less than minimum value ({})", value, min)
            }
            ViolationKind::AboveMaximum { value, max } => {
                write!(f, "Value ({}) is greater than maximum value ({})", value, max)
            }
            ViolationKind::TooShort { len, min } => {
                write!(f, "Length ({}) is less than minimum length ({})", len, min)
            }
            ViolationKind::TooLong { len, max } => {
                write!(f, "Length ({}) is greater than maximum length ({})", len, max)
            }
            ViolationKind::WrongLength { len, expected } => {
                write!(f, "Length ({}) must be exactly {}", len, expected)
            }
            ViolationKind::PatternMismatch { pattern } => {
                write!(f, "Value does not match pattern {}", pattern)
            }
            ViolationKind::NotAllowed { value } => write!(f, "Invalid enum value: {}", value),
            ViolationKind::UnexpectedProperty(key) => write!(f, "Unexpected property {}", key),
            ViolationKind::MissingProperty(key) => write!(f, "Missing property {}", key),
        }
    }
}

/// A rule violation, located by its path below the checked value.
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub kind: ViolationKind,
    /// `a.b[2].c` style path; empty when the checked value itself is at fault
    pub path: String,
}

impl Violation {
    fn new(kind: ViolationKind) -> Self {
        Self {
            kind,
            path: String::new(),
        }
    }

    fn under_key(mut self, key: &str) -> Self {
        self.path = if self.path.is_empty() {
            key.to_string()
        } else if self.path.starts_with('[') {
            format!("{}{}", key, self.path)
        } else {
            format!("{}.{}", key, self.path)
        };
        self
    }

    fn under_index(mut self, index: usize) -> Self {
        self.path = if self.path.is_empty() || self.path.starts_with('[') {
            format!("[{}]{}", index, self.path)
        } else {
            format!("[{}].{}", index, self.path)
        };
        self
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.path, self.kind)
        }
    }
}

/// Render a violation as the human-readable diagnostic sent to clients.
pub fn format_violation(violation: &Violation) -> String {
    violation.to_string()
}

/// Check `value` against `rule`.
///
/// `is_creation` is set when the value is part of a brand new item; only
/// then may immutable rules be satisfied. Anything nested inside a
/// composite value is always checked as a creation.
pub fn check_violation(value: &Value, rule: &Rule, is_creation: bool) -> Option<Violation> {
    if !is_creation && !rule.mutable {
        return Some(Violation::new(ViolationKind::Immutable));
    }
    if value.is_null() && rule.optional {
        return None;
    }

    match &rule.kind {
        RuleKind::Boolean => {
            if !value.is_boolean() {
                return Some(Violation::new(ViolationKind::ExpectedType("boolean")));
            }
            None
        }
        RuleKind::Number { min, max } => match value.as_f64() {
            Some(number) => check_bounds(number, *min, *max),
            None => Some(Violation::new(ViolationKind::ExpectedType("number"))),
        },
        RuleKind::Integer { min, max } => match value.as_f64() {
            Some(number) if number.fract() == 0.0 => check_bounds(number, *min, *max),
            _ => Some(Violation::new(ViolationKind::ExpectedType("integer"))),
        },
        RuleKind::String(string_rule) => match value.as_str() {
            Some(text) => check_string(text, string_rule),
            None => Some(Violation::new(ViolationKind::ExpectedType("string"))),
        },
        RuleKind::Enum { items } => match value.as_str() {
            Some(text) if items.iter().any(|item| item == text) => None,
            Some(text) => Some(Violation::new(ViolationKind::NotAllowed {
                value: text.to_string(),
            })),
            None => Some(Violation::new(ViolationKind::ExpectedType("string"))),
        },
        RuleKind::Array(array_rule) => match value.as_array() {
            Some(elements) => check_array(elements, array_rule),
            None => Some(Violation::new(ViolationKind::ExpectedType("array"))),
        },
        RuleKind::Hash(hash_rule) => match value.as_object() {
            Some(object) => check_hash(object, hash_rule),
            None => Some(Violation::new(ViolationKind::ExpectedType("hash"))),
        },
        RuleKind::Any => None,
    }
}

fn check_bounds(value: f64, min: Option<f64>, max: Option<f64>) -> Option<Violation> {
    if let Some(min) = min {
        if value < min {
            return Some(Violation::new(ViolationKind::BelowMinimum { value, min }));
        }
    }
    if let Some(max) = max {
        if value > max {
            return Some(Violation::new(ViolationKind::AboveMaximum { value, max }));
        }
    }
    None
}

fn check_length(
    len: usize,
    min: Option<usize>,
    max: Option<usize>,
    exact: Option<usize>,
) -> Option<Violation> {
    if let Some(expected) = exact {
        if len != expected {
            return Some(Violation::new(ViolationKind::WrongLength { len, expected }));
        }
    }
    if let Some(min) = min {
        if len < min {
            return Some(Violation::new(ViolationKind::TooShort { len, min }));
        }
    }
    if let Some(max) = max {
        if len > max {
            return Some(Violation::new(ViolationKind::TooLong { len, max }));
        }
    }
    None
}

fn check_string(text: &str, rule: &StringRule) -> Option<Violation> {
    let len = text.chars().count();
    if let Some(violation) = check_length(len, rule.min_length, rule.max_length, rule.length) {
        return Some(violation);
    }
    if let Some(pattern) = &rule.pattern {
        if !pattern.is_match(text) {
            return Some(Violation::new(ViolationKind::PatternMismatch {
                pattern: pattern.as_str().to_string(),
            }));
        }
    }
    if let Some(allowed) = &rule.one_of {
        if !allowed.iter().any(|item| item == text) {
            return Some(Violation::new(ViolationKind::NotAllowed {
                value: text.to_string(),
            }));
        }
    }
    None
}

fn check_array(elements: &[Value], rule: &ArrayRule) -> Option<Violation> {
    if let Some(violation) =
        check_length(elements.len(), rule.min_length, rule.max_length, rule.length)
    {
        return Some(violation);
    }
    let items = rule.items.as_deref()?;
    elements.iter().enumerate().find_map(|(index, element)| {
        check_violation(element, items, true).map(|violation| violation.under_index(index))
    })
}

fn check_hash(object: &serde_json::Map<String, Value>, rule: &HashRule) -> Option<Violation> {
    if let Some(keys) = rule.keys.as_deref() {
        for key in object.keys() {
            if let Some(violation) = check_violation(&Value::String(key.clone()), keys, true) {
                return Some(violation.under_key(key));
            }
        }
    }

    if let Some(properties) = &rule.properties {
        for (key, value) in object {
            match properties.get(key) {
                Some(property_rule) => {
                    if let Some(violation) = check_violation(value, property_rule, true) {
                        return Some(violation.under_key(key));
                    }
                }
                None if rule.values.is_some() => {}
                None => {
                    return Some(Violation::new(ViolationKind::UnexpectedProperty(
                        key.clone(),
                    )))
                }
            }
        }
        for (key, property_rule) in properties {
            if !object.contains_key(key) && !property_rule.optional {
                return Some(Violation::new(ViolationKind::MissingProperty(key.clone())));
            }
        }
    }

    if let Some(values) = rule.values.as_deref() {
        for (key, value) in object {
            let declared = rule
                .properties
                .as_ref()
                .is_some_and(|properties| properties.contains_key(key));
            if declared {
                continue;
            }
            if let Some(violation) = check_violation(value, values, true) {
                return Some(violation.under_key(key));
            }
        }
    }

    None
}
