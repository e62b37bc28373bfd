//! Tag scanner over a growing text buffer.
//!
//! The scanner looks only at bytes after the cursor and only recognizes the
//! tags that are meaningful in the current parser context. Everything else is
//! literal text. When the bytes after the cursor could still turn into a
//! recognized tag, it answers `Incomplete` and consumes nothing.
//!
//! All delimiters (`<`, `>`, quotes) are ASCII, so every offset returned is a
//! char boundary of the buffer.

use std::collections::HashMap;

use super::{ACTION_TAG, ARTIFACT_TAG};

/// Which tags are recognizable at the current position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanContext {
    /// Only an artifact open tag
    OutsideArtifact,

    /// Action open tags and the artifact close tag
    InsideArtifact,

    /// Only the action close tag; everything else is action content
    InsideAction,
}

impl ScanContext {
    fn patterns(self) -> &'static [TagPattern] {
        const OUTSIDE: &[TagPattern] = &[TagPattern::open(ARTIFACT_TAG)];
        const ARTIFACT: &[TagPattern] = &[
            TagPattern::open(ACTION_TAG),
            TagPattern::close(ARTIFACT_TAG),
        ];
        const ACTION: &[TagPattern] = &[TagPattern::close(ACTION_TAG)];

        match self {
            Self::OutsideArtifact => OUTSIDE,
            Self::InsideArtifact => ARTIFACT,
            Self::InsideAction => ACTION,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TagPattern {
    name: &'static str,
    closing: bool,
}

impl TagPattern {
    const fn open(name: &'static str) -> Self {
        Self {
            name,
            closing: false,
        }
    }

    const fn close(name: &'static str) -> Self {
        Self {
            name,
            closing: true,
        }
    }

    /// Match `rest` (which starts with `<`) against this pattern
    fn matches<'a>(&self, rest: &'a str) -> Match<'a> {
        let marker = if self.closing { "</" } else { "<" };
        let prefix_len = marker.len() + self.name.len();

        if rest.len() < prefix_len {
            // Could still grow into the tag name
            let candidate_matches = rest
                .strip_prefix(marker)
                .map(|partial| self.name.starts_with(partial))
                .unwrap_or_else(|| marker.starts_with(rest));
            return if candidate_matches {
                Match::Undecided
            } else {
                Match::No
            };
        }

        let Some(after) = rest
            .strip_prefix(marker)
            .and_then(|r| r.strip_prefix(self.name))
        else {
            return Match::No;
        };

        match after.as_bytes().first() {
            None => return Match::Undecided,
            Some(b'>') => {}
            Some(b) if b.is_ascii_whitespace() => {}
            Some(b'/') if !self.closing => {}
            // A longer tag name such as `<actions`
            Some(_) => return Match::No,
        }

        let Some(gt) = find_tag_end(after) else {
            return Match::Undecided;
        };

        let end = prefix_len + gt + 1;
        let inner = after[..gt].trim();

        if self.closing {
            return Match::Close { end };
        }

        let (attributes, self_closing) = match inner.strip_suffix('/') {
            Some(attrs) => (attrs.trim_end(), true),
            None => (inner, false),
        };

        Match::Open {
            attributes,
            self_closing,
            end,
        }
    }
}

enum Match<'a> {
    No,
    Undecided,
    Open {
        attributes: &'a str,
        self_closing: bool,
        end: usize,
    },
    Close {
        end: usize,
    },
}

/// One lexical token. All `end` offsets are absolute positions in the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token<'a> {
    /// A literal run of text ending at `end`
    Text { text: &'a str, end: usize },

    /// A recognized open tag
    Open {
        name: &'static str,
        attributes: &'a str,
        self_closing: bool,
        end: usize,
    },

    /// A recognized close tag
    Close { name: &'static str, end: usize },

    /// The bytes after the cursor may be the start of a tag; wait for more
    Incomplete,

    /// Nothing left after the cursor
    End,
}

/// Produce the next token starting at `cursor`.
///
/// Re-invoking with a longer buffer and the same cursor is always safe: a
/// token is only returned once its last byte is known.
pub fn scan(buffer: &str, cursor: usize, context: ScanContext) -> Token<'_> {
    let rest = &buffer[cursor..];

    if rest.is_empty() {
        return Token::End;
    }

    let lt = match rest.find('<') {
        Some(pos) => pos,
        None => {
            return Token::Text {
                text: rest,
                end: buffer.len(),
            }
        }
    };

    if lt > 0 {
        return Token::Text {
            text: &rest[..lt],
            end: cursor + lt,
        };
    }

    let mut undecided = false;

    for pattern in context.patterns() {
        match pattern.matches(rest) {
            Match::No => {}
            Match::Undecided => undecided = true,
            Match::Open {
                attributes,
                self_closing,
                end,
            } => {
                return Token::Open {
                    name: pattern.name,
                    attributes,
                    self_closing,
                    end: cursor + end,
                }
            }
            Match::Close { end } => {
                return Token::Close {
                    name: pattern.name,
                    end: cursor + end,
                }
            }
        }
    }

    if undecided {
        return Token::Incomplete;
    }

    // A `<` that cannot start a recognized tag is literal, up to the next `<`
    let next = rest[1..].find('<').map(|i| i + 1).unwrap_or(rest.len());
    Token::Text {
        text: &rest[..next],
        end: cursor + next,
    }
}

/// Index of the `>` that ends a tag, ignoring any inside quoted values
fn find_tag_end(s: &str) -> Option<usize> {
    let mut quote: Option<u8> = None;

    for (i, b) in s.bytes().enumerate() {
        match (quote, b) {
            (Some(q), _) if b == q => quote = None,
            (Some(_), _) => {}
            (None, b'"') | (None, b'\'') => quote = Some(b),
            (None, b'>') => return Some(i),
            _ => {}
        }
    }

    None
}

/// Parse a raw attribute string (`id="a1" title='Demo'`) into a map.
///
/// Values may be double-quoted, single-quoted, or bare. Attributes without a
/// value map to an empty string. Later duplicates win.
pub fn parse_attributes(raw: &str) -> HashMap<String, String> {
    let mut attributes = HashMap::new();
    let bytes = raw.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }

        let name_start = i;
        while i < bytes.len() && !bytes[i].is_ascii_whitespace() && bytes[i] != b'=' {
            i += 1;
        }
        let name = &raw[name_start..i];

        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }

        let mut value = String::new();
        if i < bytes.len() && bytes[i] == b'=' {
            i += 1;
            while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                i += 1;
            }

            if i < bytes.len() && (bytes[i] == b'"' || bytes[i] == b'\'') {
                let quote = bytes[i];
                let value_start = i + 1;
                let value_end = raw[value_start..]
                    .bytes()
                    .position(|b| b == quote)
                    .map(|p| value_start + p)
                    .unwrap_or(bytes.len());
                value = decode_entities(&raw[value_start..value_end]);
                i = (value_end + 1).min(bytes.len());
            } else {
                let value_start = i;
                while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                    i += 1;
                }
                value = decode_entities(&raw[value_start..i]);
            }
        }

        if !name.is_empty() {
            attributes.insert(name.to_string(), value);
        }
    }

    attributes
}

fn decode_entities(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }

    value
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
