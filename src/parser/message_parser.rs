//! Per-message streaming state machine.
//!
//! Callers hand in the full text received so far for a message. The parser
//! keeps a cursor per message and only consumes the bytes it can classify,
//! so repeated calls with a growing buffer produce each event exactly once.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::domain::{Action, ActionKey, ActionKind, ArtifactKey, ParserEvent, DEFAULT_TITLE};

use super::scanner::{parse_attributes, scan, ScanContext, Token};
use super::{ACTION_TAG, ARTIFACT_TAG};

/// Renders the display marker inserted where an artifact opens
pub type ArtifactPlaceholder = Box<dyn Fn(&ArtifactKey, &str) -> String + Send + Sync>;

/// Parser configuration
#[derive(Default)]
pub struct ParserOptions {
    /// Marker rendered into the display text at each artifact open tag
    pub artifact_placeholder: Option<ArtifactPlaceholder>,
}

impl fmt::Debug for ParserOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParserOptions")
            .field("artifact_placeholder", &self.artifact_placeholder.is_some())
            .finish()
    }
}

/// Result of one parse pass: only what this pass consumed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParseOutput {
    /// Renderable text with control markup stripped
    pub display: String,

    /// Structural events, in stream order
    pub events: Vec<ParserEvent>,
}

impl ParseOutput {
    pub fn is_empty(&self) -> bool {
        self.display.is_empty() && self.events.is_empty()
    }
}

/// Streaming parser holding an independent state machine per message id
#[derive(Debug, Default)]
pub struct StreamingMessageParser {
    options: ParserOptions,
    messages: HashMap<String, MessageState>,
}

#[derive(Debug, Default)]
struct MessageState {
    /// Bytes before the cursor are consumed and never looked at again
    cursor: usize,
    phase: Phase,
    artifact_count: usize,
    finished: bool,
}

#[derive(Debug, Default)]
enum Phase {
    #[default]
    OutsideArtifact,
    InsideArtifact(OpenArtifact),
    InsideAction(OpenArtifact, OpenAction),
}

impl Phase {
    fn context(&self) -> ScanContext {
        match self {
            Self::OutsideArtifact => ScanContext::OutsideArtifact,
            Self::InsideArtifact(_) => ScanContext::InsideArtifact,
            Self::InsideAction(..) => ScanContext::InsideAction,
        }
    }
}

#[derive(Debug)]
struct OpenArtifact {
    id: String,
    action_count: usize,
}

#[derive(Debug)]
struct OpenAction {
    /// `None` for actions that were rejected at open; their content is dropped
    header: Option<ActionHeader>,
    content: String,
    /// The newline right after the open tag has not been decided yet
    leading_newline_pending: bool,
}

#[derive(Debug)]
struct ActionHeader {
    key: ActionKey,
    kind: ActionKind,
    target: Option<String>,
}

impl StreamingMessageParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ParserOptions) -> Self {
        Self {
            options,
            messages: HashMap::new(),
        }
    }

    /// Parse everything new in `full_text` for `message_id`.
    ///
    /// `full_text` is cumulative. With `is_final`, a trailing unterminated tag
    /// is degraded to literal text and the message stops accepting input
    /// until it is reset.
    pub fn parse(&mut self, message_id: &str, full_text: &str, is_final: bool) -> ParseOutput {
        let Self { options, messages } = self;
        let state = messages.entry(message_id.to_string()).or_default();
        let mut out = ParseOutput::default();

        if state.finished {
            return out;
        }

        if full_text.len() < state.cursor || !full_text.is_char_boundary(state.cursor) {
            warn!(
                message_id,
                cursor = state.cursor,
                len = full_text.len(),
                "Message text does not extend the parsed prefix, ignoring"
            );
            return out;
        }

        loop {
            if let Phase::InsideAction(_, action) = &mut state.phase {
                if action.leading_newline_pending {
                    match full_text.as_bytes()[state.cursor..] {
                        [] | [b'\r'] if !is_final => break,
                        [b'\r'] => {
                            debug!(message_id, "Stream ended on a lone carriage return, keeping it as content")
                        }
                        [b'\n', ..] => state.cursor += 1,
                        [b'\r', b'\n', ..] => state.cursor += 2,
                        _ => {}
                    }
                    action.leading_newline_pending = false;
                }
            }

            match scan(full_text, state.cursor, state.phase.context()) {
                Token::End => break,
                Token::Incomplete => {
                    if is_final {
                        let rest = &full_text[state.cursor..];
                        debug!(message_id, fragment = %rest, "Unterminated tag at end of stream, treating as text");
                        push_text(&mut state.phase, rest, &mut out);
                        state.cursor = full_text.len();
                    }
                    break;
                }
                Token::Text { text, end } => {
                    push_text(&mut state.phase, text, &mut out);
                    state.cursor = end;
                }
                Token::Open {
                    name,
                    attributes,
                    self_closing,
                    end,
                } => {
                    state.cursor = end;
                    open_tag(options, message_id, state, name, attributes, &mut out);
                    if self_closing {
                        close_tag(message_id, state, name, &mut out);
                    }
                }
                Token::Close { name, end } => {
                    state.cursor = end;
                    close_tag(message_id, state, name, &mut out);
                }
            }
        }

        if is_final {
            state.finished = true;
            match state.phase {
                Phase::OutsideArtifact => {}
                Phase::InsideArtifact(ref artifact) | Phase::InsideAction(ref artifact, _) => {
                    warn!(
                        message_id,
                        artifact_id = %artifact.id,
                        "Stream ended inside an artifact"
                    );
                }
            }
        }

        trace!(
            message_id,
            cursor = state.cursor,
            events = out.events.len(),
            "Parse pass complete"
        );

        out
    }

    /// Forget every message's state
    pub fn reset(&mut self) {
        self.messages.clear();
    }

    /// Forget one message's state; other messages are untouched
    pub fn reset_message(&mut self, message_id: &str) {
        self.messages.remove(message_id);
    }

    /// How far the parser has consumed this message
    pub fn cursor(&self, message_id: &str) -> Option<usize> {
        self.messages.get(message_id).map(|s| s.cursor)
    }

    /// Whether the message received its final chunk
    pub fn is_finished(&self, message_id: &str) -> bool {
        self.messages
            .get(message_id)
            .map(|s| s.finished)
            .unwrap_or(false)
    }
}

fn push_text(phase: &mut Phase, text: &str, out: &mut ParseOutput) {
    if text.is_empty() {
        return;
    }

    let action = match phase {
        Phase::OutsideArtifact | Phase::InsideArtifact(_) => {
            out.display.push_str(text);
            return;
        }
        Phase::InsideAction(_, action) => action,
    };

    let Some(header) = &action.header else {
        return;
    };

    let offset = action.content.len();
    action.content.push_str(text);

    if !header.kind.is_streamable() {
        return;
    }

    // Merge with the previous delta of the same action from this pass
    if let Some(ParserEvent::ActionUpdate {
        key,
        offset: prev_offset,
        delta,
        ..
    }) = out.events.last_mut()
    {
        if *key == header.key && *prev_offset + delta.len() == offset {
            delta.push_str(text);
            return;
        }
    }

    out.events.push(ParserEvent::ActionUpdate {
        key: header.key.clone(),
        kind: header.kind,
        target: header.target.clone(),
        offset,
        delta: text.to_string(),
    });
}

fn open_tag(
    options: &ParserOptions,
    message_id: &str,
    state: &mut MessageState,
    name: &str,
    attributes: &str,
    out: &mut ParseOutput,
) {
    let attrs = parse_attributes(attributes);

    match (name, state.phase.context()) {
        (ARTIFACT_TAG, ScanContext::OutsideArtifact) => {
            let id = attrs
                .get("id")
                .filter(|id| !id.is_empty())
                .cloned()
                .unwrap_or_else(|| format!("{}-{}", message_id, state.artifact_count));
            let title = attrs
                .get("title")
                .filter(|t| !t.is_empty())
                .cloned()
                .unwrap_or_else(|| DEFAULT_TITLE.to_string());
            state.artifact_count += 1;

            debug!(message_id, artifact_id = %id, %title, "Artifact opened");

            if let Some(placeholder) = &options.artifact_placeholder {
                let key = ArtifactKey::new(message_id, id.clone());
                out.display.push_str(&placeholder(&key, &title));
            }

            out.events.push(ParserEvent::ArtifactOpen {
                message_id: message_id.to_string(),
                artifact_id: id.clone(),
                title,
            });
            state.phase = Phase::InsideArtifact(OpenArtifact {
                id,
                action_count: 0,
            });
        }
        (ACTION_TAG, ScanContext::InsideArtifact) => {
            let Phase::InsideArtifact(mut artifact) = std::mem::take(&mut state.phase) else {
                return;
            };

            let header = action_header(message_id, &mut artifact, &attrs);
            if let Some(header) = &header {
                debug!(key = %header.key, kind = %header.kind, target = ?header.target, "Action opened");
                out.events.push(ParserEvent::ActionOpen {
                    key: header.key.clone(),
                    kind: header.kind,
                    target: header.target.clone(),
                });
            }

            state.phase = Phase::InsideAction(
                artifact,
                OpenAction {
                    header,
                    content: String::new(),
                    leading_newline_pending: true,
                },
            );
        }
        // The scanner only yields tags valid for the current phase
        _ => {}
    }
}

fn action_header(
    message_id: &str,
    artifact: &mut OpenArtifact,
    attrs: &HashMap<String, String>,
) -> Option<ActionHeader> {
    let raw_kind = attrs.get("type").map(String::as_str).unwrap_or_default();
    let Some(kind) = ActionKind::from_attribute(raw_kind) else {
        warn!(message_id, artifact_id = %artifact.id, kind = raw_kind, "Ignoring action of unknown type");
        return None;
    };

    let target = attrs
        .get("path")
        .or_else(|| attrs.get("filePath"))
        .filter(|p| !p.is_empty())
        .cloned();

    if kind == ActionKind::File && target.is_none() {
        warn!(message_id, artifact_id = %artifact.id, "Ignoring file action without a path");
        return None;
    }

    let key = ActionKey::new(message_id, artifact.id.clone(), artifact.action_count);
    artifact.action_count += 1;

    Some(ActionHeader {
        key,
        kind,
        target: if kind == ActionKind::File { target } else { None },
    })
}

fn close_tag(message_id: &str, state: &mut MessageState, name: &str, out: &mut ParseOutput) {
    match (name, std::mem::take(&mut state.phase)) {
        (ACTION_TAG, Phase::InsideAction(artifact, action)) => {
            if let Some(header) = action.header {
                debug!(key = %header.key, bytes = action.content.len(), "Action closed");
                out.events.push(ParserEvent::ActionClose {
                    action: Action {
                        key: header.key,
                        kind: header.kind,
                        target: header.target,
                        content: action.content,
                    },
                });
            }
            state.phase = Phase::InsideArtifact(artifact);
        }
        (ARTIFACT_TAG, Phase::InsideArtifact(artifact)) => {
            debug!(message_id, artifact_id = %artifact.id, "Artifact closed");
            out.events.push(ParserEvent::ArtifactClose {
                message_id: message_id.to_string(),
                artifact_id: artifact.id,
            });
            state.phase = Phase::OutsideArtifact;
        }
        (_, phase) => state.phase = phase,
    }
}

/// Merge consecutive updates of the same action into one.
///
/// Update deltas depend on where chunks were split; everything else does
/// not. After coalescing, any two chunkings of the same text yield equal
/// event lists.
pub fn coalesce_updates(events: Vec<ParserEvent>) -> Vec<ParserEvent> {
    let mut merged: Vec<ParserEvent> = Vec::with_capacity(events.len());

    for event in events {
        if let ParserEvent::ActionUpdate {
            key: ref next_key,
            delta: ref next_delta,
            ..
        } = event
        {
            if let Some(ParserEvent::ActionUpdate { key, delta, .. }) = merged.last_mut() {
                if key == next_key {
                    delta.push_str(next_delta);
                    continue;
                }
            }
        }
        merged.push(event);
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEMO: &str = "<artifact id=\"a1\" title=\"Demo\"><action type=\"file\" path=\"x.txt\">hello</action></artifact>";

    fn parse_all(text: &str) -> ParseOutput {
        StreamingMessageParser::new().parse("m1", text, true)
    }

    #[test]
    fn test_single_pass_events() {
        let out = parse_all(DEMO);

        assert_eq!(out.display, "");
        assert_eq!(
            out.events,
            vec![
                ParserEvent::ArtifactOpen {
                    message_id: "m1".to_string(),
                    artifact_id: "a1".to_string(),
                    title: "Demo".to_string(),
                },
                ParserEvent::ActionOpen {
                    key: ActionKey::new("m1", "a1", 0),
                    kind: ActionKind::File,
                    target: Some("x.txt".to_string()),
                },
                ParserEvent::ActionUpdate {
                    key: ActionKey::new("m1", "a1", 0),
                    kind: ActionKind::File,
                    target: Some("x.txt".to_string()),
                    offset: 0,
                    delta: "hello".to_string(),
                },
                ParserEvent::ActionClose {
                    action: Action {
                        key: ActionKey::new("m1", "a1", 0),
                        kind: ActionKind::File,
                        target: Some("x.txt".to_string()),
                        content: "hello".to_string(),
                    },
                },
                ParserEvent::ArtifactClose {
                    message_id: "m1".to_string(),
                    artifact_id: "a1".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_text_around_artifact_passes_through() {
        let out = parse_all("Here you go:\n<artifact id=\"a\" title=\"t\">\n</artifact>\nDone.");
        assert_eq!(out.display, "Here you go:\n\n\nDone.");
    }

    #[test]
    fn test_byte_by_byte_never_re_emits() {
        let mut parser = StreamingMessageParser::new();
        let mut events = Vec::new();

        for end in 1..=DEMO.len() {
            let out = parser.parse("m1", &DEMO[..end], false);
            events.extend(out.events);
            // Same buffer again yields nothing new
            assert!(parser.parse("m1", &DEMO[..end], false).is_empty());
        }

        assert_eq!(coalesce_updates(events), parse_all(DEMO).events);
    }

    #[test]
    fn test_shell_content_only_at_close() {
        let mut parser = StreamingMessageParser::new();
        let text = "<artifact id=\"a\"><action type=\"shell\">npm install && npm run dev</action></artifact>";
        let split = text.find("&&").unwrap();

        let first = parser.parse("m1", &text[..split], false);
        assert!(first
            .events
            .iter()
            .all(|e| !matches!(e, ParserEvent::ActionUpdate { .. } | ParserEvent::ActionClose { .. })));

        let second = parser.parse("m1", text, false);
        let close = second
            .events
            .iter()
            .find_map(|e| match e {
                ParserEvent::ActionClose { action } => Some(action.content.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(close, "npm install && npm run dev");
    }

    #[test]
    fn test_leading_newline_is_stripped_across_chunks() {
        let text = "<artifact id=\"a\"><action type=\"file\" path=\"f\">\r\nbody</action></artifact>";
        let open_end = text.find('\r').unwrap();

        let mut parser = StreamingMessageParser::new();
        let mut events = parser.parse("m", &text[..open_end], false).events;
        events.extend(parser.parse("m", &text[..open_end + 1], false).events);
        events.extend(parser.parse("m", text, true).events);

        assert_eq!(coalesce_updates(events), parse_all_as("m", text));
    }

    #[test]
    fn test_lone_carriage_return_at_end_is_content() {
        let text = "<artifact id=\"a\"><action type=\"file\" path=\"f\">\r";

        let mut parser = StreamingMessageParser::new();
        assert!(!parser
            .parse("m", text, false)
            .events
            .iter()
            .any(|e| matches!(e, ParserEvent::ActionUpdate { .. })));

        let deltas: Vec<String> = parser
            .parse("m", text, true)
            .events
            .into_iter()
            .filter_map(|e| match e {
                ParserEvent::ActionUpdate { delta, .. } => Some(delta),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec!["\r".to_string()]);
    }

    fn parse_all_as(message_id: &str, text: &str) -> Vec<ParserEvent> {
        StreamingMessageParser::new().parse(message_id, text, true).events
    }

    #[test]
    fn test_default_ids_and_titles() {
        let out = parse_all("<artifact><action type=\"shell\">ls</action></artifact><artifact></artifact>");
        let opened: Vec<(String, String)> = out
            .events
            .iter()
            .filter_map(|e| match e {
                ParserEvent::ArtifactOpen {
                    artifact_id, title, ..
                } => Some((artifact_id.clone(), title.clone())),
                _ => None,
            })
            .collect();

        assert_eq!(
            opened,
            vec![
                ("m1-0".to_string(), DEFAULT_TITLE.to_string()),
                ("m1-1".to_string(), DEFAULT_TITLE.to_string()),
            ]
        );
    }

    #[test]
    fn test_unknown_action_is_swallowed() {
        let out = parse_all(
            "<artifact id=\"a\"><action type=\"deploy\">secret</action><action type=\"shell\">ls</action></artifact>",
        );

        assert_eq!(out.display, "");
        let closes: Vec<&Action> = out
            .events
            .iter()
            .filter_map(|e| match e {
                ParserEvent::ActionClose { action } => Some(action),
                _ => None,
            })
            .collect();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].key.index, 0);
        assert_eq!(closes[0].content, "ls");
    }

    #[test]
    fn test_unterminated_tag_degrades_to_text_at_end() {
        let mut parser = StreamingMessageParser::new();

        let partial = parser.parse("m1", "Result: <artif", false);
        assert_eq!(partial.display, "Result: ");

        let last = parser.parse("m1", "Result: <artif", true);
        assert_eq!(last.display, "<artif");
        assert!(parser.is_finished("m1"));

        // Nothing more after the final chunk
        assert!(parser.parse("m1", "Result: <artifact>", false).is_empty());
    }

    #[test]
    fn test_shrunk_buffer_is_ignored() {
        let mut parser = StreamingMessageParser::new();
        parser.parse("m1", "hello world", false);
        assert!(parser.parse("m1", "hello", false).is_empty());
        assert_eq!(parser.cursor("m1"), Some(11));
    }

    #[test]
    fn test_reset_message_leaves_others() {
        let mut parser = StreamingMessageParser::new();
        parser.parse("m1", "<artifact id=\"a\">", false);
        parser.parse("m2", "<artifact id=\"b\"><action type=\"shell\">l", false);

        parser.reset_message("m1");
        assert_eq!(parser.cursor("m1"), None);

        let out = parser.parse("m2", "<artifact id=\"b\"><action type=\"shell\">ls</action>", false);
        assert!(matches!(
            out.events.as_slice(),
            [ParserEvent::ActionClose { action }] if action.content == "ls"
        ));
    }

    #[test]
    fn test_artifact_placeholder() {
        let mut parser = StreamingMessageParser::with_options(ParserOptions {
            artifact_placeholder: Some(Box::new(|key: &ArtifactKey, title: &str| {
                format!("[{}: {}]", key.artifact_id, title)
            })),
        });

        let out = parser.parse("m1", "Intro <artifact id=\"a1\" title=\"Demo\"></artifact> end", true);
        assert_eq!(out.display, "Intro [a1: Demo] end");
    }

    #[test]
    fn test_html_content_inside_file_action() {
        let text = "<artifact id=\"a\"><action type=\"file\" path=\"index.html\"><div><p>hi</p></div></action></artifact>";
        let out = parse_all(text);

        let updates: Vec<&ParserEvent> = out
            .events
            .iter()
            .filter(|e| matches!(e, ParserEvent::ActionUpdate { .. }))
            .collect();
        // Several literal runs in one pass merge into a single delta
        assert_eq!(updates.len(), 1);
        match updates[0] {
            ParserEvent::ActionUpdate { delta, .. } => assert_eq!(delta, "<div><p>hi</p></div>"),
            _ => unreachable!(),
        }
    }
}
