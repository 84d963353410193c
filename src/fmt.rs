//! `{field}` string templates.
//!
//! Rules project LDAP attributes into role names, comments, grantees, etc.
//! with a minimal substitution format: `{member}` or `{member.cn}`, with
//! `{{` and `}}` escaping literal braces.

use crate::errors::{Error, Result};
use log::warn;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(String),
}

/// A parsed template. Holds the literal source for display and the parsed
/// segment list for substitution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Format {
    spec: String,
    segments: Vec<Segment>,
}

impl Format {
    pub fn parse(spec: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = spec.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' => {
                    if chars.peek() == Some(&'{') {
                        chars.next();
                        literal.push('{');
                        continue;
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    let mut field = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) if c.is_ascii_alphanumeric() || c == '_' || c == '.' => {
                                field.push(c)
                            }
                            Some(c) => {
                                return Err(Error::Config(format!(
                                    "bad character {:?} in field of template {:?}",
                                    c, spec
                                )))
                            }
                            None => {
                                return Err(Error::Config(format!(
                                    "unterminated field in template {:?}",
                                    spec
                                )))
                            }
                        }
                    }
                    if field.is_empty() {
                        return Err(Error::Config(format!("empty field in template {:?}", spec)));
                    }
                    segments.push(Segment::Field(field));
                }
                '}' => {
                    if chars.peek() == Some(&'}') {
                        chars.next();
                        literal.push('}');
                    } else {
                        return Err(Error::Config(format!(
                            "single '}}' in template {:?}",
                            spec
                        )));
                    }
                }
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Format {
            spec: spec.to_string(),
            segments,
        })
    }

    /// Referenced field names, in order of first appearance.
    pub fn fields(&self) -> Vec<&str> {
        let mut fields = Vec::new();
        for segment in &self.segments {
            if let Segment::Field(f) = segment {
                if !fields.contains(&f.as_str()) {
                    fields.push(f.as_str());
                }
            }
        }
        fields
    }

    /// A template without fields formats to itself.
    pub fn is_static(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    pub fn is_empty(&self) -> bool {
        self.spec.is_empty()
    }

    /// Substitute fields from `values`. A missing field substitutes the
    /// empty string with a warning: LDAP entries legitimately omit
    /// attributes, so this is never a hard failure.
    pub fn format(&self, values: &HashMap<String, String>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(l) => out.push_str(l),
                Segment::Field(f) => match values.get(f) {
                    Some(v) => out.push_str(v),
                    None => {
                        warn!("Unknown field {:?} in template {:?}.", f, self.spec);
                    }
                },
            }
        }
        out
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.spec)
    }
}

/// Union of fields referenced by a set of templates, deduplicated,
/// preserving first-appearance order.
pub fn list_fields<'a>(formats: impl IntoIterator<Item = &'a Format>) -> Vec<String> {
    let mut fields: Vec<String> = Vec::new();
    for format in formats {
        for field in format.fields() {
            if !fields.iter().any(|f| f == field) {
                fields.push(field.to_string());
            }
        }
    }
    fields
}
