//! Incremental rendering of assistant replies
//!
//! The [`Renderer`] keeps the conversation history and at most one live
//! [`RenderSurface`], the entry the in-flight assistant reply is written into.
//! Deltas are accumulated on the surface and the viewport is told to show the
//! whole accumulation each time, so one reply always maps to one entry.

use std::io::Write;

use crate::conversation::{ChatTurn, ConversationHistory, Role};

/// Shown in place of a reply when the request fails before any text arrived
pub const FALLBACK_MESSAGE: &str = "Sorry, something went wrong. Please try again later.";

/// Handle to a display entry owned by a [`Viewport`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(pub usize);

/// The UI a [`Renderer`] draws into
pub trait Viewport {
    /// Append a new entry showing `text`
    fn push_entry(&mut self, role: Role, text: &str) -> EntryId;

    /// Replace the text shown by an existing entry
    fn set_text(&mut self, entry: EntryId, text: &str);

    /// Bring the newest content into view
    fn scroll_to_latest(&mut self);

    /// The entry will not change again
    fn close_entry(&mut self, entry: EntryId);
}

/// The in-progress assistant message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderSurface {
    entry: EntryId,
    content: String,
}

impl RenderSurface {
    pub fn content(&self) -> &str {
        &self.content
    }
}

pub struct Renderer<V: Viewport> {
    viewport: V,
    history: ConversationHistory,
    surface: Option<RenderSurface>,
}

impl<V: Viewport> Renderer<V> {
    pub fn new(viewport: V) -> Self {
        Self::with_history(viewport, ConversationHistory::new())
    }

    pub fn with_history(viewport: V, history: ConversationHistory) -> Self {
        Self {
            viewport,
            history,
            surface: None,
        }
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn surface(&self) -> Option<&RenderSurface> {
        self.surface.as_ref()
    }

    #[cfg(test)]
    pub fn viewport(&self) -> &V {
        &self.viewport
    }

    pub fn append_user_turn(&mut self, text: &str) {
        self.viewport.push_entry(Role::User, text);
        self.viewport.scroll_to_latest();
        self.history.push(ChatTurn::user(text));
    }

    /// Create the surface for the current reply, or return the existing one
    pub fn begin_assistant_turn(&mut self) -> EntryId {
        if let Some(ref surface) = self.surface {
            return surface.entry;
        }

        let entry = self.viewport.push_entry(Role::Assistant, "");
        self.viewport.scroll_to_latest();
        self.surface = Some(RenderSurface {
            entry,
            content: String::new(),
        });
        entry
    }

    pub fn apply_delta(&mut self, text: &str) {
        self.begin_assistant_turn();
        if let Some(ref mut surface) = self.surface {
            surface.content.push_str(text);
            self.viewport.set_text(surface.entry, &surface.content);
        }
        self.viewport.scroll_to_latest();
    }

    /// Move the surface's content into history as an assistant turn.
    ///
    /// Returns `None` when no reply was in progress.
    pub fn finalize_assistant_turn(&mut self) -> Option<&ChatTurn> {
        let surface = self.surface.take()?;
        self.viewport.close_entry(surface.entry);
        self.history.push(ChatTurn::assistant(surface.content));
        self.history.last()
    }

    /// Show the fallback message and close the reply with whatever arrived
    pub fn fail_assistant_turn(&mut self) -> Option<&ChatTurn> {
        let entry = self.begin_assistant_turn();
        self.viewport.set_text(entry, FALLBACK_MESSAGE);
        self.viewport.scroll_to_latest();
        self.finalize_assistant_turn()
    }
}

/// Line-oriented viewport for a terminal.
///
/// Only the newest entry can change in place; updates that extend what is
/// already shown print the new suffix, anything else reprints the entry.
pub struct TerminalViewport<W: Write> {
    out: W,
    entries: Vec<(Role, String)>,
    echo_user: bool,
    line_open: bool,
}

impl<W: Write> TerminalViewport<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            entries: Vec::new(),
            echo_user: true,
            line_open: false,
        }
    }

    /// Skip printing user entries that the terminal already echoed
    pub fn without_user_echo(mut self) -> Self {
        self.echo_user = false;
        self
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }

    fn label(role: Role) -> &'static str {
        match role {
            Role::User => "you",
            Role::Assistant => "moxie",
            Role::System => "system",
        }
    }

    fn emit(&mut self, text: &str) {
        if let Err(e) = self.out.write_all(text.as_bytes()) {
            tracing::debug!(error = %e, "terminal write failed");
        }
    }

    fn start_entry(&mut self, role: Role, text: &str) {
        if self.line_open {
            self.emit("\n");
        }
        let line = format!("{}> {}", Self::label(role), text);
        self.emit(&line);
        self.line_open = true;
    }
}

impl<W: Write> Viewport for TerminalViewport<W> {
    fn push_entry(&mut self, role: Role, text: &str) -> EntryId {
        self.entries.push((role, text.to_string()));
        if role != Role::User || self.echo_user {
            self.start_entry(role, text);
        }
        EntryId(self.entries.len() - 1)
    }

    fn set_text(&mut self, entry: EntryId, text: &str) {
        let is_last = entry.0 + 1 == self.entries.len();
        let Some((role, shown)) = self.entries.get(entry.0).cloned() else {
            return;
        };

        match text.strip_prefix(shown.as_str()) {
            Some(suffix) if is_last => self.emit(suffix),
            _ => self.start_entry(role, text),
        }
        self.entries[entry.0].1 = text.to_string();
    }

    fn scroll_to_latest(&mut self) {
        if let Err(e) = self.out.flush() {
            tracing::debug!(error = %e, "terminal flush failed");
        }
    }

    fn close_entry(&mut self, _entry: EntryId) {
        if self.line_open {
            self.emit("\n");
            self.line_open = false;
        }
        self.scroll_to_latest();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Viewport that records every entry and every text it was asked to show
    #[derive(Debug, Default)]
    pub struct RecordingViewport {
        pub entries: Vec<(Role, String)>,
        pub shown: Vec<String>,
        pub scrolls: usize,
        pub closed: Vec<EntryId>,
    }

    impl Viewport for RecordingViewport {
        fn push_entry(&mut self, role: Role, text: &str) -> EntryId {
            self.entries.push((role, text.to_string()));
            EntryId(self.entries.len() - 1)
        }

        fn set_text(&mut self, entry: EntryId, text: &str) {
            self.entries[entry.0].1 = text.to_string();
            self.shown.push(text.to_string());
        }

        fn scroll_to_latest(&mut self) {
            self.scrolls += 1;
        }

        fn close_entry(&mut self, entry: EntryId) {
            self.closed.push(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingViewport;
    use super::*;

    fn renderer() -> Renderer<RecordingViewport> {
        Renderer::new(RecordingViewport::default())
    }

    #[test]
    fn test_deltas_accumulate_on_one_surface() {
        let mut r = renderer();
        r.apply_delta("A");
        r.apply_delta("B");

        assert_eq!(r.viewport().entries, vec![(Role::Assistant, "AB".to_string())]);
        assert_eq!(r.viewport().shown, vec!["A", "AB"]);
        assert_eq!(r.surface().unwrap().content(), "AB");
    }

    #[test]
    fn test_begin_is_idempotent() {
        let mut r = renderer();
        let first = r.begin_assistant_turn();
        let second = r.begin_assistant_turn();

        assert_eq!(first, second);
        assert_eq!(r.viewport().entries.len(), 1);
    }

    #[test]
    fn test_non_streaming_reply_becomes_one_turn() {
        let mut r = renderer();
        r.append_user_turn("hi");
        r.apply_delta("hello");
        let turn = r.finalize_assistant_turn().cloned();

        assert_eq!(turn, Some(ChatTurn::assistant("hello")));
        assert_eq!(r.viewport().closed, vec![EntryId(1)]);
        assert_eq!(
            r.history().turns(),
            &[ChatTurn::user("hi"), ChatTurn::assistant("hello")]
        );
        assert!(r.surface().is_none());
    }

    #[test]
    fn test_finalize_without_surface_is_noop() {
        let mut r = renderer();
        assert!(r.finalize_assistant_turn().is_none());
        assert!(r.history().is_empty());
    }

    #[test]
    fn test_next_reply_gets_a_fresh_surface() {
        let mut r = renderer();
        r.apply_delta("one");
        r.finalize_assistant_turn();
        r.append_user_turn("again");
        r.apply_delta("two");
        r.finalize_assistant_turn();

        let texts: Vec<&str> = r.viewport().entries.iter().map(|(_, t)| t.as_str()).collect();
        assert_eq!(texts, vec!["one", "again", "two"]);
        assert_eq!(r.history().len(), 3);
    }

    #[test]
    fn test_failure_before_any_delta() {
        let mut r = renderer();
        r.append_user_turn("hi");
        let turn = r.fail_assistant_turn().cloned();

        assert_eq!(turn, Some(ChatTurn::assistant("")));
        assert_eq!(
            r.viewport().entries.last(),
            Some(&(Role::Assistant, FALLBACK_MESSAGE.to_string()))
        );
        assert!(r.surface().is_none());
    }

    #[test]
    fn test_scrolls_after_every_delta() {
        let mut r = renderer();
        r.append_user_turn("hi");
        let before = r.viewport().scrolls;
        r.apply_delta("a");
        r.apply_delta("b");
        r.apply_delta("c");
        // first delta also scrolls once for the new entry
        assert_eq!(r.viewport().scrolls - before, 4);
    }

    #[test]
    fn test_terminal_prints_only_new_suffix() {
        let mut r = Renderer::new(TerminalViewport::new(Vec::new()));
        r.append_user_turn("hi");
        r.apply_delta("He");
        r.apply_delta("llo");
        r.finalize_assistant_turn();

        let out = String::from_utf8(r.viewport.into_inner()).unwrap();
        assert_eq!(out, "you> hi\nmoxie> Hello\n");
    }

    #[test]
    fn test_terminal_turns_have_no_blank_lines() {
        let mut r = Renderer::new(TerminalViewport::new(Vec::new()).without_user_echo());
        r.append_user_turn("hi");
        r.apply_delta("Hello");
        r.finalize_assistant_turn();
        r.append_user_turn("bye");
        r.fail_assistant_turn();
        r.append_user_turn("again");
        r.apply_delta("Back");
        r.finalize_assistant_turn();

        let out = String::from_utf8(r.viewport.into_inner()).unwrap();
        assert_eq!(
            out,
            format!("moxie> Hello\nmoxie> {}\nmoxie> Back\n", FALLBACK_MESSAGE)
        );
    }

    #[test]
    fn test_terminal_reprints_replaced_text() {
        let mut viewport = TerminalViewport::new(Vec::new()).without_user_echo();
        viewport.push_entry(Role::User, "hi");
        let entry = viewport.push_entry(Role::Assistant, "");
        viewport.set_text(entry, "partial");
        viewport.set_text(entry, FALLBACK_MESSAGE);

        let out = String::from_utf8(viewport.into_inner()).unwrap();
        assert_eq!(out, format!("moxie> partial\nmoxie> {}", FALLBACK_MESSAGE));
    }
}
