//! One connected realtime client.
//!
//! [`SubscriberSession`] is the protocol state machine and knows nothing
//! about sockets. [`serve_socket`] drives it over a WebSocket with a reader
//! loop and a writer task; whichever side stops first takes the other down.

use super::bus::EventBus;
use super::events::Room;
use super::registry::{CloseReason, Mailbox, SubscriberId};
use crate::auth::Identity;
use crate::types::{Principal, TaskId, UserId};
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How long the writer gets to flush a final reply after the reader stops.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Authentication state of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated(Principal),
    Closed,
}

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Authenticate {
        token: String,
    },
    JoinTask {
        #[serde(deserialize_with = "task_id_from_str_or_number")]
        task_id: TaskId,
    },
    LeaveTask {
        #[serde(deserialize_with = "task_id_from_str_or_number")]
        task_id: TaskId,
    },
}

fn task_id_from_str_or_number<'de, D>(deserializer: D) -> Result<TaskId, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(TaskId),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(id) => Ok(id),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Session-level replies, sent alongside change events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SessionReply {
    Connected { message: String },
    Authenticated { user_id: UserId, message: String },
    AuthError(String),
}

impl SessionReply {
    pub fn connected() -> Self {
        SessionReply::Connected {
            message: "Connected to WebSocket server".to_string(),
        }
    }

    pub fn authenticated(user_id: UserId) -> Self {
        SessionReply::Authenticated {
            user_id,
            message: "Successfully authenticated".to_string(),
        }
    }

    pub fn auth_error() -> Self {
        SessionReply::AuthError("Invalid token".to_string())
    }
}

/// Result of handling one inbound frame.
#[derive(Debug, Default, PartialEq)]
pub struct Step {
    pub reply: Option<SessionReply>,
    /// The session must close after sending `reply`.
    pub close: bool,
}

impl Step {
    fn none() -> Self {
        Self::default()
    }

    fn reply(reply: SessionReply) -> Self {
        Self {
            reply: Some(reply),
            close: false,
        }
    }
}

/// Protocol state for one subscriber.
pub struct SubscriberSession {
    id: SubscriberId,
    state: SessionState,
    bus: EventBus,
    identity: Arc<dyn Identity>,
    tasks: HashSet<TaskId>,
}

impl SubscriberSession {
    pub fn new(id: SubscriberId, bus: EventBus, identity: Arc<dyn Identity>) -> Self {
        Self {
            id,
            state: SessionState::Unauthenticated,
            bus,
            identity,
            tasks: HashSet::new(),
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn joined_tasks(&self) -> &HashSet<TaskId> {
        &self.tasks
    }

    /// Handle one text frame from the client.
    ///
    /// Frames that are not valid messages are ignored.
    pub fn handle_text(&mut self, text: &str) -> Step {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => self.handle(message),
            Err(e) => {
                debug!(subscriber = self.id, error = %e, "ignoring unrecognized frame");
                Step::none()
            }
        }
    }

    pub fn handle(&mut self, message: ClientMessage) -> Step {
        let current = match &self.state {
            SessionState::Closed => return Step::none(),
            SessionState::Unauthenticated => None,
            SessionState::Authenticated(principal) => Some(principal.user_id),
        };

        match (current, message) {
            (None, ClientMessage::Authenticate { token }) => self.authenticate(&token),
            (None, _) => {
                debug!(subscriber = self.id, "ignoring message before authentication");
                Step::none()
            }
            (Some(user_id), ClientMessage::Authenticate { token }) => {
                // A second authenticate may only confirm the same user.
                match self.identity.resolve(&token) {
                    Ok(principal) if principal.user_id == user_id => {
                        Step::reply(SessionReply::authenticated(user_id))
                    }
                    _ => {
                        warn!(
                            subscriber = self.id,
                            user_id, "ignoring re-authentication as a different principal"
                        );
                        Step::none()
                    }
                }
            }
            (Some(_), ClientMessage::JoinTask { task_id }) => {
                self.bus.join(self.id, Room::Task(task_id));
                self.tasks.insert(task_id);
                Step::none()
            }
            (Some(_), ClientMessage::LeaveTask { task_id }) => {
                self.bus.leave(self.id, Room::Task(task_id));
                self.tasks.remove(&task_id);
                Step::none()
            }
        }
    }

    fn authenticate(&mut self, token: &str) -> Step {
        match self.identity.resolve(token) {
            Ok(principal) => {
                let user_id = principal.user_id;
                self.bus.join(self.id, Room::User(user_id));
                info!(subscriber = self.id, user_id, "realtime client authenticated");
                self.state = SessionState::Authenticated(principal);
                Step::reply(SessionReply::authenticated(user_id))
            }
            Err(e) => {
                info!(subscriber = self.id, error = %e, "realtime authentication failed");
                self.state = SessionState::Closed;
                Step {
                    reply: Some(SessionReply::auth_error()),
                    close: true,
                }
            }
        }
    }

    /// Mark the session closed and release its registry entry.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
        self.tasks.clear();
        self.bus.unsubscribe(self.id);
    }
}

/// Serve one upgraded WebSocket until either side goes away.
pub async fn serve_socket(socket: WebSocket, bus: EventBus, identity: Arc<dyn Identity>) {
    let mailbox = match bus.subscribe() {
        Ok(mailbox) => mailbox,
        Err(e) => {
            debug!(error = %e, "refusing realtime connection");
            let mut socket = socket;
            let _ = socket.send(close_message(close_code::AWAY, "shutting down")).await;
            return;
        }
    };
    let mut session = SubscriberSession::new(mailbox.id(), bus, identity);
    debug!(subscriber = session.id(), "realtime client connected");

    let (sink, mut stream) = socket.split();
    let (reply_tx, reply_rx) = mpsc::channel::<SessionReply>(16);
    // Welcome goes out before anything the mailbox may already hold.
    let _ = reply_tx.send(SessionReply::connected()).await;

    let mut writer = tokio::spawn(write_loop(sink, mailbox, reply_rx));

    let reader = async {
        while let Some(frame) = stream.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!(subscriber = session.id(), error = %e, "realtime read error");
                    break;
                }
            };
            let step = session.handle_text(text.as_str());
            if let Some(reply) = step.reply {
                if reply_tx.send(reply).await.is_err() {
                    break;
                }
            }
            if step.close {
                break;
            }
        }
        // Dropping the sender tells the writer to finish up.
        drop(reply_tx);
    };

    tokio::select! {
        _ = reader => {
            if tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
                writer.abort();
            }
        }
        _ = &mut writer => {}
    }

    session.close();
    debug!(subscriber = session.id(), "realtime client disconnected");
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut mailbox: Mailbox,
    mut replies: mpsc::Receiver<SessionReply>,
) {
    let subscriber = mailbox.id();
    loop {
        let message = tokio::select! {
            biased;
            reply = replies.recv() => match reply {
                Some(reply) => encode(&reply),
                None => {
                    let _ = sink.send(close_message(close_code::NORMAL, "")).await;
                    break;
                }
            },
            event = mailbox.recv() => match event {
                Some(event) => encode(event.as_ref()),
                None => {
                    let frame = match mailbox.close_reason() {
                        CloseReason::Overrun => {
                            close_message(close_code::POLICY, "mailbox overrun")
                        }
                        CloseReason::Shutdown => close_message(close_code::AWAY, "shutting down"),
                        _ => close_message(close_code::NORMAL, ""),
                    };
                    let _ = sink.send(frame).await;
                    break;
                }
            },
        };

        let Some(message) = message else {
            continue;
        };
        if sink.send(message).await.is_err() {
            debug!(subscriber, "realtime write failed");
            break;
        }
    }
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Option<Message> {
    match serde_json::to_string(value) {
        Ok(json) => Some(Message::text(json)),
        Err(e) => {
            warn!(error = %e, "failed to encode realtime frame");
            None
        }
    }
}

fn close_message(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}
