//! Glob pattern parser.
//!
//! Grammar:
//! ```text
//! pattern := node*
//! node    := literal | '\' any | '*' | '**' | '?' | class | group
//! class   := '[' '!'? (char | char '-' char)+ ']'
//! group   := '{' pattern (',' pattern)* '}'
//! ```
//! Positions in errors are char offsets into the pattern.

use super::GlobSyntaxError;

/// Parsed glob element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Node {
    Literal(char),
    /// `*`: any run of non-separator characters.
    Star,
    /// `**`: any run of characters, separators included.
    DoubleStar,
    /// `?`: exactly one non-separator character.
    Any,
    Class {
        negated: bool,
        items: Vec<ClassItem>,
    },
    /// `{a,b}`: OR over branches.
    Group(Vec<Vec<Node>>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ClassItem {
    Char(char),
    Range(char, char),
}

impl Node {
    pub(crate) fn is_literal(&self) -> bool {
        matches!(self, Node::Literal(_))
    }
}

pub(crate) struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    pub(crate) fn new(pattern: &str) -> Self {
        Self {
            chars: pattern.chars().collect(),
            pos: 0,
        }
    }

    /// Parse the whole pattern.
    pub(crate) fn parse(mut self) -> Result<Vec<Node>, GlobSyntaxError> {
        let nodes = self.sequence(false)?;
        debug_assert!(self.pos == self.chars.len());
        Ok(nodes)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    /// Parse nodes until end of input, or until an unconsumed `,`/`}` when
    /// inside a group.
    fn sequence(&mut self, in_group: bool) -> Result<Vec<Node>, GlobSyntaxError> {
        let mut nodes = Vec::new();
        while let Some(c) = self.peek() {
            let start = self.pos;
            match c {
                ',' | '}' if in_group => break,
                '}' | ']' => {
                    return Err(GlobSyntaxError::UnexpectedClose {
                        ch: c,
                        position: start,
                    })
                }
                '\\' => {
                    self.bump();
                    let escaped = self
                        .bump()
                        .ok_or(GlobSyntaxError::DanglingEscape { position: start })?;
                    nodes.push(Node::Literal(escaped));
                }
                '*' => {
                    self.bump();
                    if self.peek() == Some('*') {
                        while self.peek() == Some('*') {
                            self.bump();
                        }
                        nodes.push(Node::DoubleStar);
                    } else {
                        nodes.push(Node::Star);
                    }
                }
                '?' => {
                    self.bump();
                    nodes.push(Node::Any);
                }
                '[' => {
                    self.bump();
                    nodes.push(self.class(start)?);
                }
                '{' => {
                    self.bump();
                    nodes.push(self.group(start)?);
                }
                _ => {
                    self.bump();
                    nodes.push(Node::Literal(c));
                }
            }
        }
        Ok(nodes)
    }

    fn group(&mut self, open: usize) -> Result<Node, GlobSyntaxError> {
        let mut branches = Vec::new();
        loop {
            let branch_start = self.pos;
            let branch = self.sequence(true)?;
            if branch.is_empty() {
                return Err(match self.peek() {
                    None => GlobSyntaxError::UnclosedGroup { position: open },
                    Some(_) => GlobSyntaxError::EmptyAlternative {
                        position: branch_start,
                    },
                });
            }
            branches.push(branch);
            match self.bump() {
                Some(',') => continue,
                Some('}') => return Ok(Node::Group(branches)),
                _ => return Err(GlobSyntaxError::UnclosedGroup { position: open }),
            }
        }
    }

    fn class(&mut self, open: usize) -> Result<Node, GlobSyntaxError> {
        let negated = matches!(self.peek(), Some('!') | Some('^'));
        if negated {
            self.bump();
        }

        let mut items = Vec::new();
        loop {
            let at = self.pos;
            let c = match self.bump() {
                None => return Err(GlobSyntaxError::UnclosedClass { position: open }),
                Some(']') if items.is_empty() => {
                    return Err(GlobSyntaxError::EmptyClass { position: open })
                }
                Some(']') => return Ok(Node::Class { negated, items }),
                Some('\\') => self
                    .bump()
                    .ok_or(GlobSyntaxError::DanglingEscape { position: at })?,
                Some(c) => c,
            };

            // `a-z`, but a trailing `-` before `]` is literal
            let is_range = self.peek() == Some('-')
                && matches!(self.chars.get(self.pos + 1), Some(&next) if next != ']');
            if !is_range {
                items.push(ClassItem::Char(c));
                continue;
            }

            self.bump(); // '-'
            let end_at = self.pos;
            let end = match self.bump() {
                Some('\\') => self
                    .bump()
                    .ok_or(GlobSyntaxError::DanglingEscape { position: end_at })?,
                Some(e) => e,
                None => return Err(GlobSyntaxError::UnclosedClass { position: open }),
            };
            if c > end {
                return Err(GlobSyntaxError::InvalidRange {
                    start: c,
                    end,
                    position: at,
                });
            }
            items.push(ClassItem::Range(c, end));
        }
    }
}
