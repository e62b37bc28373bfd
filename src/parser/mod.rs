//! Streaming parser for artifact markup embedded in assistant messages.
//!
//! # Wire format
//!
//! ```text
//! <artifact id="todo-app" title="Todo App">
//!   <action type="file" path="src/index.js">console.log("hi");</action>
//!   <action type="shell">npm install</action>
//! </artifact>
//! ```
//!
//! - `artifact` attributes: `id` (defaults to `{message_id}-{n}`), `title`
//!   (defaults to `Untitled`).
//! - `action` attributes: `type` = `file` | `shell` (`command` is an alias of
//!   `shell`), `path` for files (`filePath` is accepted too).
//! - One newline directly after an action open tag is not content.
//! - Inside an action only `</action>` ends the content.

pub mod message_parser;
pub mod scanner;

pub use message_parser::{
    coalesce_updates, ArtifactPlaceholder, ParseOutput, ParserOptions, StreamingMessageParser,
};
pub use scanner::{parse_attributes, scan, ScanContext, Token};

/// Name of the artifact element
pub const ARTIFACT_TAG: &str = "artifact";

/// Name of the action element
pub const ACTION_TAG: &str = "action";
