use std::cmp::Ordering;
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{QuiverError, Result};

/// One token of a version string.
///
/// Ordering across classes: known pre-release qualifiers < numeric <
/// unknown qualifiers. `ga`, `final` and `release` collapse to the numeric
/// zero token so that `1.0-ga`, `1.0.0` and `1.0` compare equal.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    /// alpha(0) < beta(1) < milestone(2) < rc(3) < snapshot(4)
    Pre(u8),
    /// Canonical decimal digits, no leading zeros ("0" for empty).
    Num(String),
    /// Anything else, compared lexicographically.
    Other(String),
}

impl Token {
    fn zero() -> Token {
        Token::Num("0".to_string())
    }

    fn compare(&self, other: &Token) -> Ordering {
        use Token::*;
        match (self, other) {
            (Pre(a), Pre(b)) => a.cmp(b),
            (Pre(_), _) => Ordering::Less,
            (_, Pre(_)) => Ordering::Greater,
            (Num(a), Num(b)) => compare_numeric(a, b),
            (Num(_), Other(_)) => Ordering::Less,
            (Other(_), Num(_)) => Ordering::Greater,
            (Other(a), Other(b)) => a.cmp(b),
        }
    }
}

/// Compare canonical digit strings without parsing into a machine integer,
/// so absurdly long numeric segments still order correctly.
fn compare_numeric(a: &str, b: &str) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn canonical_digits(digits: &str) -> String {
    let trimmed = digits.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

fn qualifier_token(text: &str, attached_to_digit: bool) -> Token {
    match text {
        "alpha" => Token::Pre(0),
        "beta" => Token::Pre(1),
        "milestone" => Token::Pre(2),
        "rc" | "cr" => Token::Pre(3),
        "snapshot" => Token::Pre(4),
        "ga" | "final" | "release" => Token::zero(),
        // Single-letter aliases only count when glued to a number: 1.0a1.
        "a" if attached_to_digit => Token::Pre(0),
        "b" if attached_to_digit => Token::Pre(1),
        "m" if attached_to_digit => Token::Pre(2),
        other => Token::Other(other.to_string()),
    }
}

fn tokenize(input: &str) -> Vec<Token> {
    let lower = input.trim().to_ascii_lowercase();
    let mut tokens = Vec::new();
    let mut chars = lower.chars().peekable();
    let mut current = String::new();
    let mut current_is_digit: Option<bool> = None;

    let mut flush = |buf: &mut String, is_digit: Option<bool>, glued: bool| {
        if buf.is_empty() {
            return;
        }
        let token = if is_digit == Some(true) {
            Token::Num(canonical_digits(buf))
        } else {
            qualifier_token(buf.as_str(), glued)
        };
        tokens.push(token);
        buf.clear();
    };

    while let Some(c) = chars.next() {
        if c == '.' || c == '-' || c == '_' {
            flush(&mut current, current_is_digit, false);
            current_is_digit = None;
            continue;
        }
        let is_digit = c.is_ascii_digit();
        if let Some(prev) = current_is_digit {
            if prev != is_digit {
                // Digit/alpha boundary. An alpha run followed directly by a
                // digit gets the glued-alias treatment.
                let glued = !prev && is_digit;
                flush(&mut current, current_is_digit, glued);
            }
        }
        current_is_digit = Some(is_digit);
        current.push(c);
        // Peek so the last run knows whether a digit follows it.
        if current_is_digit == Some(false) {
            if let Some(next) = chars.peek() {
                if next.is_ascii_digit() {
                    flush(&mut current, current_is_digit, true);
                    current_is_digit = None;
                }
            }
        }
    }
    flush(&mut current, current_is_digit, false);
    tokens
}

/// A parsed version with the total ordering of the repository ecosystem.
#[derive(Debug, Clone)]
pub struct Version {
    raw: String,
    tokens: Vec<Token>,
}

impl Version {
    pub fn parse(input: &str) -> Version {
        Version {
            raw: input.trim().to_string(),
            tokens: tokenize(input),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_snapshot(&self) -> bool {
        self.tokens.contains(&Token::Pre(4))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.tokens.len().max(other.tokens.len());
        let zero = Token::zero();
        for i in 0..len {
            let a = self.tokens.get(i).unwrap_or(&zero);
            let b = other.tokens.get(i).unwrap_or(&zero);
            let ord = a.compare(b);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// One bound of a version range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bound {
    pub version: String,
    pub inclusive: bool,
}

/// A half- or fully-bounded interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRange {
    pub lower: Option<Bound>,
    pub upper: Option<Bound>,
}

impl VersionRange {
    pub fn contains(&self, candidate: &Version) -> bool {
        if let Some(lower) = &self.lower {
            let bound = Version::parse(&lower.version);
            match candidate.cmp(&bound) {
                Ordering::Less => return false,
                Ordering::Equal if !lower.inclusive => return false,
                _ => {}
            }
        }
        if let Some(upper) = &self.upper {
            let bound = Version::parse(&upper.version);
            match candidate.cmp(&bound) {
                Ordering::Greater => return false,
                Ordering::Equal if !upper.inclusive => return false,
                _ => {}
            }
        }
        true
    }
}

/// The symbolic "give me the newest" tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LatestKind {
    /// Any version, snapshots included.
    Integration,
    /// Newest non-snapshot version.
    Release,
}

/// A version constraint as written in a descriptor or on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionConstraint {
    /// `[1.0]` — exactly this version.
    Exact(String),
    /// `1.0` — preferred, may be overridden by reconciliation.
    Soft(String),
    /// `[1.0,2.0)` and friends; a comma-separated union of intervals.
    Ranges(Vec<VersionRange>),
    /// `latest.*` / `release` symbolic tokens, resolved against the
    /// repository version listing.
    Latest(LatestKind),
}

impl VersionConstraint {
    pub fn soft(version: impl Into<String>) -> Self {
        VersionConstraint::Soft(version.into())
    }

    pub fn parse(input: &str) -> Result<VersionConstraint> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(QuiverError::Config("empty version constraint".to_string()));
        }
        match trimmed {
            "latest" | "latest.integration" => {
                return Ok(VersionConstraint::Latest(LatestKind::Integration))
            }
            "release" | "latest.release" | "latest.stable" => {
                return Ok(VersionConstraint::Latest(LatestKind::Release))
            }
            _ => {}
        }
        if trimmed.starts_with('[') || trimmed.starts_with('(') {
            return parse_ranges(trimmed);
        }
        Ok(VersionConstraint::Soft(trimmed.to_string()))
    }

    /// The version to ask a repository for directly, when the constraint
    /// names one. Ranges never name one: a bound is not necessarily an
    /// available version, so they resolve against the repository version
    /// listing like the `latest.*` tokens.
    pub fn preferred(&self) -> Option<&str> {
        match self {
            VersionConstraint::Exact(v) | VersionConstraint::Soft(v) => Some(v),
            VersionConstraint::Ranges(_) | VersionConstraint::Latest(_) => None,
        }
    }

    pub fn matches(&self, candidate: &Version) -> bool {
        match self {
            VersionConstraint::Exact(v) | VersionConstraint::Soft(v) => {
                Version::parse(v) == *candidate
            }
            VersionConstraint::Ranges(ranges) => ranges.iter().any(|r| r.contains(candidate)),
            VersionConstraint::Latest(LatestKind::Integration) => true,
            VersionConstraint::Latest(LatestKind::Release) => !candidate.is_snapshot(),
        }
    }

    /// Hard constraints reject reconciliation winners outside them; soft
    /// ones merely prefer.
    pub fn is_hard(&self) -> bool {
        matches!(
            self,
            VersionConstraint::Exact(_) | VersionConstraint::Ranges(_)
        )
    }
}

fn parse_ranges(input: &str) -> Result<VersionConstraint> {
    let bad = |reason: &str| QuiverError::Config(format!("malformed range '{input}': {reason}"));

    let mut ranges = Vec::new();
    let mut rest = input.trim();
    while let Some(open) = rest.chars().next() {
        if open != '[' && open != '(' {
            return Err(bad("expected '[' or '('"));
        }
        let close_idx = rest
            .find([']', ')'])
            .ok_or_else(|| bad("missing closing bracket"))?;
        let close = rest.as_bytes()[close_idx] as char;
        let body = &rest[1..close_idx];

        let lower_inclusive = open == '[';
        let upper_inclusive = close == ']';

        match body.split(',').collect::<Vec<_>>().as_slice() {
            [single] => {
                let v = single.trim();
                if v.is_empty() {
                    return Err(bad("empty interval"));
                }
                if !(lower_inclusive && upper_inclusive) {
                    return Err(bad("single-version interval must be inclusive"));
                }
                // `[1.0]` alone is the exact form; inside a union it is a
                // degenerate range.
                if rest.len() == close_idx + 1 && ranges.is_empty() {
                    return Ok(VersionConstraint::Exact(v.to_string()));
                }
                ranges.push(VersionRange {
                    lower: Some(Bound {
                        version: v.to_string(),
                        inclusive: true,
                    }),
                    upper: Some(Bound {
                        version: v.to_string(),
                        inclusive: true,
                    }),
                });
            }
            [low, high] => {
                let low = low.trim();
                let high = high.trim();
                ranges.push(VersionRange {
                    lower: (!low.is_empty()).then(|| Bound {
                        version: low.to_string(),
                        inclusive: lower_inclusive,
                    }),
                    upper: (!high.is_empty()).then(|| Bound {
                        version: high.to_string(),
                        inclusive: upper_inclusive,
                    }),
                });
            }
            _ => return Err(bad("more than one comma in interval")),
        }

        rest = rest[close_idx + 1..].trim_start();
        if let Some(stripped) = rest.strip_prefix(',') {
            rest = stripped.trim_start();
            if rest.is_empty() {
                return Err(bad("trailing comma"));
            }
        } else if !rest.is_empty() {
            return Err(bad("expected ',' between intervals"));
        }
    }
    if ranges.is_empty() {
        return Err(bad("no intervals"));
    }
    Ok(VersionConstraint::Ranges(ranges))
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionConstraint::Exact(v) => write!(f, "[{v}]"),
            VersionConstraint::Soft(v) => f.write_str(v),
            VersionConstraint::Latest(LatestKind::Integration) => f.write_str("latest"),
            VersionConstraint::Latest(LatestKind::Release) => f.write_str("latest.release"),
            VersionConstraint::Ranges(ranges) => {
                for (i, range) in ranges.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    match &range.lower {
                        Some(b) if b.inclusive => write!(f, "[{}", b.version)?,
                        Some(b) => write!(f, "({}", b.version)?,
                        None => f.write_str("(")?,
                    }
                    f.write_str(",")?;
                    match &range.upper {
                        Some(b) if b.inclusive => write!(f, "{}]", b.version)?,
                        Some(b) => write!(f, "{})", b.version)?,
                        None => f.write_str(")")?,
                    }
                }
                Ok(())
            }
        }
    }
}

impl Serialize for VersionConstraint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VersionConstraint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        VersionConstraint::parse(&raw).map_err(D::Error::custom)
    }
}
