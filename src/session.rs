//! Per-window conversation state: the ordered transcript and the pending gate.
//!
//! The screen owns one [`Session`] and hands it to `view` by reference; there is
//! no other place conversation state lives.

use tracing::{debug, info};

use crate::dispatch::RawResponse;
use crate::error::ChatError;
use crate::normalize::reply_for;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Author {
    User,
    Bot,
}

impl Author {
    pub fn default_name(self) -> &'static str {
        match self {
            Author::User => "You",
            Author::Bot => "Assistant",
        }
    }
}

/// What a bot message is, as far as forwarding it as context is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Reply,
    Welcome,
    /// Error or empty-answer notice produced locally.
    Notice,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    content: String,
    author: Author,
    display_name: Option<String>,
    kind: MessageKind,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(content, Author::User, MessageKind::Reply)
    }

    pub fn bot(content: impl Into<String>) -> Self {
        Self::new(content, Author::Bot, MessageKind::Reply)
    }

    pub fn welcome(content: impl Into<String>) -> Self {
        Self::new(content, Author::Bot, MessageKind::Welcome)
    }

    pub fn notice(content: impl Into<String>) -> Self {
        Self::new(content, Author::Bot, MessageKind::Notice)
    }

    fn new(content: impl Into<String>, author: Author, kind: MessageKind) -> Self {
        ChatMessage {
            content: content.into(),
            author,
            display_name: None,
            kind,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn author(&self) -> Author {
        self.author
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn display_name(&self) -> &str {
        self.display_name
            .as_deref()
            .unwrap_or_else(|| self.author.default_name())
    }
}

/// A dispatched turn: the query to send and the id its reply must carry back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub id: u64,
    pub query: String,
}

#[derive(Debug, Default)]
pub struct Session {
    transcript: Vec<ChatMessage>,
    pending: bool,
    welcome: Option<String>,
    revision: u64,
    // advanced by every begin_turn and reset; older replies are stale
    turn: u64,
}

impl Session {
    pub fn new(welcome: Option<String>) -> Self {
        let mut session = Session {
            welcome: welcome.filter(|w| !w.trim().is_empty()),
            ..Default::default()
        };
        session.seed_welcome();
        session
    }

    fn seed_welcome(&mut self) {
        if let Some(welcome) = &self.welcome {
            self.transcript.push(ChatMessage::welcome(welcome.clone()));
        }
    }

    fn touch(&mut self) {
        self.revision = self.revision.wrapping_add(1);
    }

    pub fn append(&mut self, message: ChatMessage) {
        self.transcript.push(message);
        self.touch();
    }

    /// Empties the transcript (re-seeding the welcome message) and clears the gate.
    pub fn reset(&mut self) {
        debug!(dropped = self.transcript.len(), "session reset");
        self.transcript.clear();
        self.pending = false;
        self.turn = self.turn.wrapping_add(1);
        self.seed_welcome();
        self.touch();
    }

    pub fn set_pending(&mut self, pending: bool) {
        if self.pending != pending {
            self.pending = pending;
            self.touch();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.transcript
    }

    pub fn len(&self) -> usize {
        self.transcript.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transcript.is_empty()
    }

    /// Bumped on every mutation; the screen re-renders when it changes.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn has_user_turns(&self) -> bool {
        self.transcript.iter().any(|m| m.author == Author::User)
    }

    /// Messages forwarded to a backend as conversational context.
    pub fn context(&self) -> Vec<ChatMessage> {
        self.transcript
            .iter()
            .filter(|m| m.kind == MessageKind::Reply)
            .cloned()
            .collect()
    }

    /// Starts a turn: IDLE -> PENDING.
    ///
    /// Returns the trimmed query to dispatch, or `None` when the text is blank
    /// or a request is already outstanding.
    pub fn begin_turn(&mut self, text: &str, display_name: Option<&str>) -> Option<Turn> {
        let query = text.trim();
        if query.is_empty() || self.pending {
            return None;
        }

        let mut message = ChatMessage::user(query);
        if let Some(name) = display_name {
            message = message.with_display_name(name);
        }
        self.append(message);
        self.set_pending(true);
        self.turn = self.turn.wrapping_add(1);
        Some(Turn { id: self.turn, query: query.to_string() })
    }

    /// Ends a turn: PENDING -> IDLE, appending exactly one bot message.
    ///
    /// A reply for a turn other than the outstanding one (it was reset away)
    /// is dropped and `None` returned.
    pub fn finish_turn(
        &mut self,
        turn_id: u64,
        outcome: Result<RawResponse, ChatError>,
        display_name: Option<&str>,
    ) -> Option<&ChatMessage> {
        if !self.pending || turn_id != self.turn {
            info!(turn_id, current = self.turn, "dropping stale reply");
            return None;
        }

        let mut reply = reply_for(outcome);
        if let Some(name) = display_name {
            reply = reply.with_display_name(name);
        }
        self.append(reply);
        self.set_pending(false);
        self.transcript.last()
    }
}
