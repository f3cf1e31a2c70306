//! Toolkit-independent chat session: the messenger plus the transcript a front end renders.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::mpsc::{self, Receiver, TryRecvError},
};

use chim_core::ChatMessage;
use chim_net::{GroupMessenger, MessengerConfig, MessengerError};
use tracing::{info, warn};

pub const MAX_TRANSCRIPT_LINES: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatLine {
    Own { text: String, time: String },
    Peer { sender: String, text: String, time: String },
    System(String),
}

/// Bounded list of rendered lines; the oldest line goes first.
#[derive(Debug, Clone)]
pub struct Transcript {
    lines: VecDeque<ChatLine>,
    capacity: usize,
}

impl Transcript {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, line: ChatLine) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn push_own(&mut self, text: impl Into<String>) {
        self.push(ChatLine::Own {
            text: text.into(),
            time: clock_label(),
        });
    }

    pub fn push_peer(&mut self, message: ChatMessage) {
        self.push(ChatLine::Peer {
            sender: message.sender,
            text: message.text,
            time: clock_label(),
        });
    }

    pub fn push_system(&mut self, text: impl Into<String>) {
        self.push(ChatLine::System(text.into()));
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChatLine> {
        self.lines.iter()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl Default for Transcript {
    fn default() -> Self {
        Self::with_capacity(MAX_TRANSCRIPT_LINES)
    }
}

pub struct ChatSession {
    messenger: GroupMessenger,
    incoming: Receiver<ChatMessage>,
    transcript: Transcript,
}

impl ChatSession {
    /// Joins the group and starts listening. `wake` runs on the listener thread
    /// after each queued message so the front end can schedule a drain.
    pub fn connect<W>(config: MessengerConfig, wake: W) -> Result<Self, MessengerError>
    where
        W: Fn() + Send + 'static,
    {
        let mut messenger = GroupMessenger::join(config)?;
        let (incoming_tx, incoming) = mpsc::channel::<ChatMessage>();
        messenger.spawn_listener(move |message| {
            if incoming_tx.send(message).is_ok() {
                wake();
            }
        })?;

        let mut transcript = Transcript::default();
        transcript.push_system(format!(
            "You joined the chat as {} on {}",
            messenger.identity(),
            messenger.group_addr()
        ));

        Ok(Self {
            messenger,
            incoming,
            transcript,
        })
    }

    pub fn identity(&self) -> &str {
        self.messenger.identity()
    }

    pub fn group_addr(&self) -> SocketAddr {
        self.messenger.group_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.messenger.is_closed()
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn push_system(&mut self, text: impl Into<String>) {
        self.transcript.push_system(text);
    }

    /// Sends one line of user input. Blank input is ignored and returns `Ok(false)`.
    ///
    /// The group never echoes our own datagrams back, so a sent line is added
    /// to the transcript here. Failures become a system line as well as the
    /// returned error.
    pub fn send_text(&mut self, input: &str) -> Result<bool, MessengerError> {
        let text = input.trim();
        if text.is_empty() {
            return Ok(false);
        }

        match self.messenger.send(text) {
            Ok(()) => {
                self.transcript.push_own(text);
                Ok(true)
            }
            Err(err) => {
                warn!("send failed: {err}");
                self.transcript.push_system(format!("Send failed: {err}"));
                Err(err)
            }
        }
    }

    /// Moves every queued message into the transcript. Returns how many arrived.
    pub fn drain_incoming(&mut self) -> usize {
        let mut drained = 0;
        loop {
            match self.incoming.try_recv() {
                Ok(message) => {
                    self.transcript.push_peer(message);
                    drained += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if !self.messenger.is_closed() {
                        warn!("listener stopped unexpectedly");
                        self.transcript.push_system("Stopped receiving messages");
                        self.messenger.close();
                    }
                    break;
                }
            }
        }
        drained
    }

    pub fn close(&mut self) {
        if self.messenger.is_closed() {
            return;
        }
        self.messenger.close();
        info!("chat session closed");
    }
}

fn clock_label() -> String {
    chrono::Local::now().format("%H:%M").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_drops_oldest_line_when_full() {
        let mut transcript = Transcript::with_capacity(3);
        for index in 0..5 {
            transcript.push_system(format!("line {index}"));
        }

        let lines: Vec<_> = transcript.iter().cloned().collect();
        assert_eq!(
            lines,
            vec![
                ChatLine::System("line 2".to_owned()),
                ChatLine::System("line 3".to_owned()),
                ChatLine::System("line 4".to_owned()),
            ]
        );
    }

    #[test]
    fn peer_lines_keep_sender_and_text() {
        let mut transcript = Transcript::default();
        transcript.push_peer(ChatMessage::new("bob", "hi: there"));

        match transcript.iter().next() {
            Some(ChatLine::Peer { sender, text, time }) => {
                assert_eq!(sender, "bob");
                assert_eq!(text, "hi: there");
                assert_eq!(time.len(), 5, "expected HH:MM, got {time}");
            }
            other => panic!("unexpected line {other:?}"),
        }
    }
}
