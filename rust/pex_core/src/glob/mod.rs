//! Glob compiler and matcher for permission patterns.
//!
//! Patterns compile once into an immutable [`Glob`]: pure literals compare
//! by string equality, anything else is translated to an anchored
//! `regex::Regex`. Every glob carries a [`Specificity`] used as the merge
//! tie-break between rules matching the same permission.

mod parser;

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;

use parser::{ClassItem, Node, Parser};

/// Malformed pattern. Reported per pattern; never fatal to a query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GlobSyntaxError {
    #[error("unclosed '{{' opened at {position}")]
    UnclosedGroup { position: usize },

    #[error("unclosed '[' opened at {position}")]
    UnclosedClass { position: usize },

    #[error("unexpected '{ch}' at {position}")]
    UnexpectedClose { ch: char, position: usize },

    #[error("empty alternative at {position}")]
    EmptyAlternative { position: usize },

    #[error("empty character class at {position}")]
    EmptyClass { position: usize },

    #[error("dangling escape at {position}")]
    DanglingEscape { position: usize },

    #[error("invalid range '{start}-{end}' at {position}")]
    InvalidRange {
        start: char,
        end: char,
        position: usize,
    },

    #[error("pattern too complex: {0}")]
    Regex(String),
}

/// Characters with glob meaning; they cannot serve as separators.
pub fn is_meta(c: char) -> bool {
    matches!(c, '*' | '?' | '[' | ']' | '{' | '}' | '\\' | ',')
}

/// Comparable specificity score: `(literal chars, -wildcards, length)`,
/// compared lexicographically. Greater is more specific.
///
/// Each wildcard, class or group is one generalization unit regardless of
/// its width; characters inside a group are not counted as literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Specificity {
    pub literals: usize,
    pub wildcards: usize,
    pub length: usize,
}

impl Ord for Specificity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.literals
            .cmp(&other.literals)
            .then_with(|| other.wildcards.cmp(&self.wildcards))
            .then_with(|| self.length.cmp(&other.length))
    }
}

impl PartialOrd for Specificity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Clone)]
enum Matcher {
    Literal,
    Regex(Regex),
}

/// Compiled, immutable glob.
#[derive(Clone)]
pub struct Glob {
    pattern: String,
    nodes: Arc<[Node]>,
    separator: char,
    matcher: Matcher,
    specificity: Specificity,
    literal_prefix: String,
}

impl fmt::Debug for Glob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Glob")
            .field("pattern", &self.pattern)
            .field("specificity", &self.specificity)
            .finish()
    }
}

impl PartialEq for Glob {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

impl Eq for Glob {}

/// Compile `pattern`; `*` and `?` stop at `separator`.
pub fn compile(pattern: &str, separator: char) -> Result<Glob, GlobSyntaxError> {
    let nodes = Parser::new(pattern).parse()?;

    let literals = nodes.iter().filter(|n| n.is_literal()).count();
    let specificity = Specificity {
        literals,
        wildcards: nodes.len() - literals,
        length: pattern.chars().count(),
    };
    let literal_prefix: String = nodes
        .iter()
        .map_while(|n| match n {
            Node::Literal(c) => Some(*c),
            _ => None,
        })
        .collect();

    let matcher = if literal_prefix.chars().count() == nodes.len() {
        Matcher::Literal
    } else {
        let mut source = String::with_capacity(pattern.len() * 2 + 8);
        source.push_str("^(?s:");
        write_nodes(&mut source, &nodes, separator);
        source.push_str(")$");
        Matcher::Regex(Regex::new(&source).map_err(|e| GlobSyntaxError::Regex(e.to_string()))?)
    };

    Ok(Glob {
        pattern: pattern.to_string(),
        nodes: nodes.into(),
        separator,
        matcher,
        specificity,
        literal_prefix,
    })
}

fn write_nodes(out: &mut String, nodes: &[Node], separator: char) {
    let sep = regex::escape(&separator.to_string());
    for node in nodes {
        match node {
            Node::Literal(c) => out.push_str(&regex::escape(&c.to_string())),
            Node::Star => {
                out.push_str("[^");
                out.push_str(&sep);
                out.push_str("]*");
            }
            Node::DoubleStar => out.push_str(".*"),
            Node::Any => {
                out.push_str("[^");
                out.push_str(&sep);
                out.push(']');
            }
            Node::Class { negated, items } => {
                out.push('[');
                if *negated {
                    out.push('^');
                    out.push_str(&sep);
                }
                for item in items {
                    match item {
                        ClassItem::Char(c) => out.push_str(&regex::escape(&c.to_string())),
                        ClassItem::Range(a, b) => {
                            out.push_str(&regex::escape(&a.to_string()));
                            out.push('-');
                            out.push_str(&regex::escape(&b.to_string()));
                        }
                    }
                }
                out.push(']');
            }
            Node::Group(branches) => {
                out.push_str("(?:");
                for (i, branch) in branches.iter().enumerate() {
                    if i > 0 {
                        out.push('|');
                    }
                    write_nodes(out, branch, separator);
                }
                out.push(')');
            }
        }
    }
}

impl Glob {
    /// Whole-string match.
    pub fn matches(&self, candidate: &str) -> bool {
        match &self.matcher {
            Matcher::Literal => self.literal_prefix == candidate,
            Matcher::Regex(re) => re.is_match(candidate),
        }
    }

    pub fn specificity(&self) -> Specificity {
        self.specificity
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// True when the pattern has no wildcard, class or group.
    pub fn is_literal(&self) -> bool {
        matches!(self.matcher, Matcher::Literal)
    }

    /// Unescaped literal text before the first wildcard construct; the whole
    /// permission for literal patterns.
    pub fn literal_prefix(&self) -> &str {
        &self.literal_prefix
    }

    /// Whether this pattern could match some permission selected by `filter`.
    ///
    /// Exact for prefix filters. A glob filter is narrowed to its literal
    /// prefix unless this pattern is itself literal.
    pub fn may_match_filter(&self, filter: &Filter) -> bool {
        match filter {
            Filter::Prefix(prefix) if self.is_literal() => {
                self.literal_prefix.starts_with(prefix.as_str())
            }
            Filter::Prefix(prefix) => self.matches_some_extension_of(prefix),
            Filter::Glob(glob) if self.is_literal() => glob.matches(&self.literal_prefix),
            Filter::Glob(glob) => self.matches_some_extension_of(&glob.literal_prefix),
        }
    }

    /// Whether some string starting with `prefix` matches this pattern.
    fn matches_some_extension_of(&self, prefix: &str) -> bool {
        let input: Vec<char> = prefix.chars().collect();
        extends(&self.nodes, &input, self.separator)
    }
}

/// Whether `nodes` match some string with `input` as a prefix. Every
/// parsed pattern matches at least one string, so an exhausted input
/// always succeeds.
fn extends(nodes: &[Node], input: &[char], separator: char) -> bool {
    let Some((first, rest)) = input.split_first() else {
        return true;
    };
    let Some((node, tail)) = nodes.split_first() else {
        return false;
    };
    match node {
        Node::Literal(c) => c == first && extends(tail, rest, separator),
        Node::Any => *first != separator && extends(tail, rest, separator),
        Node::Class { negated, items } => {
            class_contains(*negated, items, *first, separator) && extends(tail, rest, separator)
        }
        Node::DoubleStar => true,
        Node::Star => {
            let run = input.iter().take_while(|&&c| c != separator).count();
            (0..=run).any(|taken| extends(tail, &input[taken..], separator))
        }
        Node::Group(branches) => branches.iter().any(|branch| {
            let joined: Vec<Node> = branch.iter().chain(tail).cloned().collect();
            extends(&joined, input, separator)
        }),
    }
}

fn class_contains(negated: bool, items: &[ClassItem], c: char, separator: char) -> bool {
    let listed = items.iter().any(|item| match item {
        ClassItem::Char(x) => *x == c,
        ClassItem::Range(a, b) => (*a..=*b).contains(&c),
    });
    if negated {
        c != separator && !listed
    } else {
        listed
    }
}

/// Selection for bulk queries: a plain prefix or a glob.
#[derive(Debug, Clone)]
pub enum Filter {
    Prefix(String),
    Glob(Glob),
}

impl Filter {
    /// A filter containing glob metacharacters compiles as a glob; anything
    /// else is a plain prefix (the empty string selects everything).
    pub fn parse(filter: &str, separator: char) -> Result<Filter, GlobSyntaxError> {
        if filter.chars().any(|c| matches!(c, '*' | '?' | '[' | '{' | '\\')) {
            Ok(Filter::Glob(compile(filter, separator)?))
        } else {
            Ok(Filter::Prefix(filter.to_string()))
        }
    }
}
