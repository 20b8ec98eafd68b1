//! Conversation transcript with a two-phase message exchange.
//!
//! A user message is first recorded as *pending* so front-ends can render it
//! while the external call is in flight. The exchange then either commits
//! (user message and assistant reply appended, in that order) or rolls back
//! (pending message dropped, committed history untouched).

use serde::Serialize;

use crate::models::Message;

#[derive(Debug, Clone, Default, Serialize)]
pub struct Transcript {
    messages: Vec<Message>,
    pending: Option<Message>,
}

/// Returned by [`Transcript::begin`] when an exchange is already in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeInFlight;

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn pending(&self) -> Option<&Message> {
        self.pending.as_ref()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.pending.is_none()
    }

    /// Record `text` as the pending user message.
    pub fn begin(&mut self, text: &str) -> Result<(), ExchangeInFlight> {
        if self.pending.is_some() {
            return Err(ExchangeInFlight);
        }
        self.pending = Some(Message::user(text));
        Ok(())
    }

    /// Commit the pending user message followed by the assistant reply.
    ///
    /// Without a pending message only the reply is appended.
    pub fn commit(&mut self, reply: &str) {
        if let Some(user) = self.pending.take() {
            self.messages.push(user);
        }
        self.messages.push(Message::assistant(reply));
    }

    /// Drop the pending message, returning its text for a manual retry.
    pub fn rollback(&mut self) -> Option<String> {
        self.pending.take().map(|m| m.content)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.pending = None;
    }

    /// Like [`Transcript::begin`], but the returned [`Exchange`] rolls the
    /// pending message back when dropped without being committed.
    pub fn begin_exchange(&mut self, text: &str) -> Result<Exchange<'_>, ExchangeInFlight> {
        self.begin(text)?;
        Ok(Exchange {
            transcript: self,
            settled: false,
        })
    }
}

/// An in-flight exchange. Dropping it unsettled (an error path, or the
/// owning future being cancelled) rolls the pending message back.
pub struct Exchange<'a> {
    transcript: &'a mut Transcript,
    settled: bool,
}

impl Exchange<'_> {
    pub fn commit(mut self, reply: &str) {
        self.transcript.commit(reply);
        self.settled = true;
    }

    pub fn rollback(mut self) -> Option<String> {
        self.settled = true;
        self.transcript.rollback()
    }
}

impl Drop for Exchange<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.transcript.rollback();
        }
    }
}
