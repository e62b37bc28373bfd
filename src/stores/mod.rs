//! Leaf stores behind the workbench's derived views.
//!
//! - Files: the file tree written by actions
//! - Terminal: command output
//! - Previews: dev server URLs found in command output

pub mod files;
pub mod previews;
pub mod terminal;

pub use files::{content_hash, Dirent, FileMap, FileModification, FilesStore};
pub use previews::{detect_previews, PreviewInfo, PreviewsStore};
pub use terminal::{TerminalEntry, TerminalStore};
