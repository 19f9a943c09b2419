//! KL-011: Positional source templates for the compiler.
//!
//! A template is parsed once into text and slots:
//! - `$N` inserts fragment `N`
//! - `$*N` splices list fragment `N`, joined by `, `
//! - `$$` is a literal `$`
//!
//! Fragments are either already-rendered [`Code`], which is inserted as is,
//! or raw strings, which are encoded as Rust string literals exactly once.
//! Rendering an argument list and nesting the result into another template
//! therefore never escapes anything twice.

use std::fmt;
use thiserror::Error;

/// Template parse or fill failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("invalid token at byte {pos} in template '{template}'")]
    InvalidToken { pos: usize, template: String },

    #[error("template slot ${index} has no fragment")]
    MissingFragment { index: usize },

    #[error("fragment {index} is a list and must be spliced with $*{index}")]
    ListInScalarSlot { index: usize },

    #[error("fragment {index} is not a list and cannot be spliced")]
    ScalarInListSlot { index: usize },
}

/// Rendered source text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Code(String);

impl Code {
    pub fn new(source: impl Into<String>) -> Self {
        Self(source.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One value filled into a slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    Code(Code),
    /// Encoded as a string literal.
    Str(String),
    Spread(Vec<Code>),
}

impl From<Code> for Fragment {
    fn from(code: Code) -> Self {
        Self::Code(code)
    }
}

impl From<Vec<Code>> for Fragment {
    fn from(items: Vec<Code>) -> Self {
        Self::Spread(items)
    }
}

/// Encode `s` as a Rust string literal.
pub fn string_literal(s: &str) -> Code {
    Code(format!("{:?}", s))
}

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Text(String),
    Slot(usize),
    Splice(usize),
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    parts: Vec<Part>,
}

impl Template {
    pub fn parse(template: &str) -> Result<Self, TemplateError> {
        let bytes = template.as_bytes();
        let invalid = |pos| TemplateError::InvalidToken {
            pos,
            template: template.to_string(),
        };
        let mut parts = Vec::new();
        let mut text = String::new();
        let mut rest = template;
        let mut offset = 0;

        while let Some(idx) = rest.find('$') {
            text.push_str(&rest[..idx]);
            let pos = offset + idx;
            let (splice, digits_at) = match bytes.get(pos + 1) {
                Some(b'$') => {
                    text.push('$');
                    offset = pos + 2;
                    rest = &template[offset..];
                    continue;
                }
                Some(b'*') => (true, pos + 2),
                Some(b) if b.is_ascii_digit() => (false, pos + 1),
                _ => return Err(invalid(pos)),
            };
            let digits = template[digits_at..]
                .bytes()
                .take_while(u8::is_ascii_digit)
                .count();
            if digits == 0 {
                return Err(invalid(pos));
            }
            let index = template[digits_at..digits_at + digits]
                .parse()
                .map_err(|_| invalid(pos))?;
            if !text.is_empty() {
                parts.push(Part::Text(std::mem::take(&mut text)));
            }
            parts.push(if splice {
                Part::Splice(index)
            } else {
                Part::Slot(index)
            });
            offset = digits_at + digits;
            rest = &template[offset..];
        }
        text.push_str(rest);
        if !text.is_empty() {
            parts.push(Part::Text(text));
        }
        Ok(Self { parts })
    }

    /// Fill every slot from `fragments`.
    pub fn render(&self, fragments: &[Fragment]) -> Result<Code, TemplateError> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Text(text) => out.push_str(text),
                Part::Slot(index) => match fragments.get(*index) {
                    Some(Fragment::Code(code)) => out.push_str(code.as_str()),
                    Some(Fragment::Str(s)) => out.push_str(string_literal(s).as_str()),
                    Some(Fragment::Spread(_)) => {
                        return Err(TemplateError::ListInScalarSlot { index: *index })
                    }
                    None => return Err(TemplateError::MissingFragment { index: *index }),
                },
                Part::Splice(index) => match fragments.get(*index) {
                    Some(Fragment::Spread(items)) => {
                        for (i, item) in items.iter().enumerate() {
                            if i > 0 {
                                out.push_str(", ");
                            }
                            out.push_str(item.as_str());
                        }
                    }
                    Some(_) => return Err(TemplateError::ScalarInListSlot { index: *index }),
                    None => return Err(TemplateError::MissingFragment { index: *index }),
                },
            }
        }
        Ok(Code(out))
    }
}

/// Parse and render in one step.
pub fn fill(template: &str, fragments: &[Fragment]) -> Result<Code, TemplateError> {
    Template::parse(template)?.render(fragments)
}
