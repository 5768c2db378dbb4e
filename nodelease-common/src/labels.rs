//! Capability labels shared between templates and provisioning requests.
//!
//! Templates declare a flat, space separated label list. Requests carry a
//! small boolean expression over label atoms:
//!
//! - `linux` matches templates carrying the `linux` label
//! - `linux && docker`, `linux || windows`, `!gpu`
//! - parentheses group, `!` binds tightest, then `&&`, then `||`
//!
//! Labels are case-sensitive; nothing else is supported.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Serialize, Serializer};

use crate::error::{NodeError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSet(BTreeSet<String>);

impl LabelSet {
    /// Split on whitespace, drop empty entries.
    pub fn parse(raw: &str) -> Self {
        Self(raw.split_whitespace().map(|s| s.to_string()).collect())
    }

    pub fn contains(&self, label: &str) -> bool {
        self.0.contains(label)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|s| s.as_str())
    }

    /// An empty label set never satisfies anything, negations included.
    pub fn satisfies(&self, expr: &LabelExpr) -> bool {
        !self.is_empty() && expr.matches(self)
    }
}

impl Serialize for LabelSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelExpr {
    Atom(String),
    Not(Box<LabelExpr>),
    And(Box<LabelExpr>, Box<LabelExpr>),
    Or(Box<LabelExpr>, Box<LabelExpr>),
}

impl LabelExpr {
    pub fn atom(label: &str) -> Self {
        LabelExpr::Atom(label.to_string())
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let tokens = tokenize(raw)?;
        if tokens.is_empty() {
            return Err(NodeError::InvalidLabelExpression(
                "empty expression".to_string(),
            ));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(NodeError::InvalidLabelExpression(format!(
                "unexpected token {:?} in {:?}",
                parser.tokens[parser.pos], raw
            )));
        }
        Ok(expr)
    }

    pub fn matches(&self, labels: &LabelSet) -> bool {
        match self {
            LabelExpr::Atom(a) => labels.contains(a),
            LabelExpr::Not(e) => !e.matches(labels),
            LabelExpr::And(l, r) => l.matches(labels) && r.matches(labels),
            LabelExpr::Or(l, r) => l.matches(labels) || r.matches(labels),
        }
    }
}

impl fmt::Display for LabelExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelExpr::Atom(a) => f.write_str(a),
            LabelExpr::Not(e) => write!(f, "!{}", e),
            LabelExpr::And(l, r) => write!(f, "({} && {})", l, r),
            LabelExpr::Or(l, r) => write!(f, "({} || {})", l, r),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Atom(String),
    Not,
    And,
    Or,
    Open,
    Close,
}

fn tokenize(raw: &str) -> Result<Vec<Token>> {
    let mut out = Vec::new();
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {}
            '(' => out.push(Token::Open),
            ')' => out.push(Token::Close),
            '!' => out.push(Token::Not),
            '&' | '|' => {
                if chars.next() != Some(c) {
                    return Err(NodeError::InvalidLabelExpression(format!(
                        "expected '{}{}' in {:?}",
                        c, c, raw
                    )));
                }
                out.push(if c == '&' { Token::And } else { Token::Or });
            }
            _ => {
                let mut atom = String::from(c);
                while let Some(&n) = chars.peek() {
                    if n.is_whitespace() || "()!&|".contains(n) {
                        break;
                    }
                    atom.push(n);
                    chars.next();
                }
                out.push(Token::Atom(atom));
            }
        }
    }
    Ok(out)
}

/// Deepest `!`/parenthesis nesting accepted.
pub const MAX_NESTING: usize = 32;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn parse_or(&mut self) -> Result<LabelExpr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = LabelExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<LabelExpr> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = LabelExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.depth >= MAX_NESTING {
            return Err(NodeError::InvalidLabelExpression(format!(
                "nesting deeper than {}",
                MAX_NESTING
            )));
        }
        self.depth += 1;
        let out = f(self);
        self.depth -= 1;
        out
    }

    fn parse_unary(&mut self) -> Result<LabelExpr> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        match token {
            Some(Token::Not) => {
                let inner = self.nested(Self::parse_unary)?;
                Ok(LabelExpr::Not(Box::new(inner)))
            }
            Some(Token::Open) => {
                let inner = self.nested(Self::parse_or)?;
                if self.peek() != Some(&Token::Close) {
                    return Err(NodeError::InvalidLabelExpression(
                        "unbalanced parenthesis".to_string(),
                    ));
                }
                self.pos += 1;
                Ok(inner)
            }
            Some(Token::Atom(a)) => Ok(LabelExpr::Atom(a)),
            Some(other) => Err(NodeError::InvalidLabelExpression(format!(
                "unexpected token {:?}",
                other
            ))),
            None => Err(NodeError::InvalidLabelExpression(
                "unexpected end of expression".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_set_splits_on_whitespace() {
        let set = LabelSet::parse("  linux   docker\tx86_64 ");
        assert!(set.contains("linux"));
        assert!(set.contains("docker"));
        assert!(set.contains("x86_64"));
        assert!(!set.contains("Linux"));
        assert_eq!(set.iter().count(), 3);
    }

    #[test]
    fn empty_label_set_matches_nothing() {
        let empty = LabelSet::parse("   ");
        assert!(empty.is_empty());
        assert!(!empty.satisfies(&LabelExpr::atom("linux")));
        assert!(!empty.satisfies(&LabelExpr::parse("!gpu").unwrap()));
    }

    #[test]
    fn atom_membership() {
        let set = LabelSet::parse("linux docker");
        assert!(set.satisfies(&LabelExpr::parse("linux").unwrap()));
        assert!(!set.satisfies(&LabelExpr::parse("windows").unwrap()));
    }

    #[test]
    fn operators_and_precedence() {
        let set = LabelSet::parse("linux docker");
        let yes = [
            "linux && docker",
            "windows || linux",
            "!gpu",
            "linux && !gpu",
            "gpu || linux && docker",
            "(gpu || linux) && docker",
            "!(gpu && linux)",
        ];
        for raw in yes {
            assert!(set.satisfies(&LabelExpr::parse(raw).unwrap()), "{}", raw);
        }
        let no = ["linux && gpu", "!linux", "(gpu || windows) && linux"];
        for raw in no {
            assert!(!set.satisfies(&LabelExpr::parse(raw).unwrap()), "{}", raw);
        }
    }

    #[test]
    fn nesting_is_bounded() {
        let set = LabelSet::parse("linux");
        let shallow = format!("{}linux", "!!".repeat(MAX_NESTING / 2));
        assert!(set.satisfies(&LabelExpr::parse(&shallow).unwrap()));
        let grouped = format!("{}linux{}", "(".repeat(MAX_NESTING), ")".repeat(MAX_NESTING));
        assert!(LabelExpr::parse(&grouped).is_ok());

        for raw in [
            format!("{}linux", "!".repeat(500_000)),
            format!("{}linux", "(".repeat(500_000)),
            format!("{}linux{}", "(".repeat(MAX_NESTING + 1), ")".repeat(MAX_NESTING + 1)),
        ] {
            assert!(matches!(
                LabelExpr::parse(&raw),
                Err(NodeError::InvalidLabelExpression(_))
            ));
        }
    }

    #[test]
    fn parse_errors() {
        for raw in ["", "   ", "linux &&", "(linux", "linux docker", "a & b", ")"] {
            assert!(
                matches!(
                    LabelExpr::parse(raw),
                    Err(NodeError::InvalidLabelExpression(_))
                ),
                "{:?}",
                raw
            );
        }
    }
}
