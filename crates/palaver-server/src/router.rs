//! Event router: turns validated commands into store calls, authorization
//! checks and outbound fan-out.
//!
//! Fan-out targets:
//! - the pairing channel of the two participants (`room_for`),
//! - every live connection of the recipient (`messageNotification`),
//! - all connections (`onlineUsers`),
//! - a user's personal channel (social notices).
//!
//! A handler failure is reported to the initiating connection only, as at
//! most one `errorMessage`.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use palaver_shared::gate::can_exchange;
use palaver_shared::models::{Message, User};
use palaver_shared::protocol::{Command, ServerEvent, SocialNotice};
use palaver_shared::rooms::{personal_channel, room_for};
use palaver_shared::{ChatError, UserId};
use palaver_store::StoreError;

use crate::db::Db;
use crate::hub::{ConnectionId, EventSender, Hub};
use crate::presence::PresenceRegistry;

const SEND_FAILED: &str = "Failed to send message";
const EDIT_FAILED: &str = "Failed to edit message";
const UNSEND_FAILED: &str = "Failed to unsend message";
const REACT_FAILED: &str = "Failed to react";
const COMMUNICATION_RESTRICTED: &str = "Communication restricted";
const MESSAGE_UNAVAILABLE: &str = "Message not found";

/// Identity of the connection an event arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionCtx {
    pub conn: ConnectionId,
    pub user: UserId,
}

#[derive(Clone)]
pub struct EventRouter {
    db: Db,
    hub: Arc<Hub>,
    presence: Arc<PresenceRegistry>,
}

impl EventRouter {
    pub fn new(db: Db, hub: Arc<Hub>, presence: Arc<PresenceRegistry>) -> Self {
        Self { db, hub, presence }
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Bring an authenticated connection into service.
    pub fn connect(&self, ctx: ConnectionCtx, tx: EventSender) {
        self.hub.attach(ctx.conn, ctx.user, tx);
        self.hub.join(ctx.conn, &personal_channel(&ctx.user));

        if self.presence.register(ctx.user, ctx.conn) {
            info!(user = %ctx.user, conn = %ctx.conn, "user online");
            self.publish_presence(&ctx.user);
        } else {
            debug!(user = %ctx.user, conn = %ctx.conn, "additional connection");
            self.hub.emit_to_connection(
                ctx.conn,
                ServerEvent::OnlineUsers(self.presence.online_users()),
            );
        }
    }

    /// Tear down a connection. Idempotent.
    pub fn disconnect(&self, ctx: ConnectionCtx) {
        self.hub.detach(ctx.conn);
        if self.presence.unregister(ctx.user, ctx.conn) {
            info!(user = %ctx.user, conn = %ctx.conn, "user offline");
            self.publish_presence(&ctx.user);
        }
    }

    /// Persist the registry's current answer for `user` and broadcast the
    /// online set. Both happen under the store lock, so the last caller to
    /// publish leaves the current state in the flag and in the last
    /// `onlineUsers` every connection receives.
    fn publish_presence(&self, user: &UserId) {
        let stored = self.db.with(|db| {
            let online = self.presence.is_online(user);
            let stored = db.set_online(user, online);
            self.hub
                .broadcast(&ServerEvent::OnlineUsers(self.presence.online_users()));
            stored
        });
        if let Err(e) = stored {
            warn!(user = %user, error = %e, "failed to persist presence");
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Run one command. Never fails: errors become at most one
    /// `errorMessage` to the initiating connection.
    pub fn dispatch(&self, ctx: ConnectionCtx, command: Command) {
        let event = command.name();
        trace!(user = %ctx.user, conn = %ctx.conn, event, "dispatch");
        if let Err(e) = self.handle(ctx, command) {
            debug!(user = %ctx.user, event, error = %e, "event rejected");
            self.report(ctx, e);
        }
    }

    /// Surface a failure to the initiating connection, if it is reportable.
    pub fn report(&self, ctx: ConnectionCtx, error: ChatError) {
        if let Some(message) = error.client_message() {
            self.hub
                .emit_to_connection(ctx.conn, ServerEvent::error(message));
        }
    }

    fn handle(&self, ctx: ConnectionCtx, command: Command) -> Result<(), ChatError> {
        match command {
            Command::Authenticate { .. } => {
                Err(ChatError::Validation("Already authenticated".into()))
            }
            Command::JoinChat { other } => {
                let room = room_for(&ctx.user, &other);
                self.hub.join(ctx.conn, &room);
                self.hub
                    .emit_to_connection(ctx.conn, ServerEvent::JoinedChat { room });
                Ok(())
            }
            Command::Typing { other } => {
                self.relay_to_room(ctx, &other, ServerEvent::Typing { from: ctx.user });
                Ok(())
            }
            Command::StopTyping { other } => {
                self.relay_to_room(ctx, &other, ServerEvent::StopTyping { from: ctx.user });
                Ok(())
            }
            Command::SendMessage {
                to,
                content,
                temp_id,
            } => {
                let sender = self.load_user(&ctx.user, SEND_FAILED)?;
                let recipient = match self.db.with(|db| db.get_user(&to)) {
                    Ok(user) => user,
                    Err(StoreError::NotFound) => return Err(ChatError::InvalidReference("to")),
                    Err(e) => return Err(persistence(e, SEND_FAILED)),
                };
                can_exchange(&sender, &recipient).require(COMMUNICATION_RESTRICTED)?;

                let (text, image) = content.into_parts();
                let message = Message::new(ctx.user, to, text, image);
                self.db
                    .with(|db| db.insert_message(&message))
                    .map_err(|e| persistence(e, SEND_FAILED))?;

                debug!(msg = %message.id, from = %ctx.user, to = %to, "message sent");
                self.deliver(message, temp_id);
                Ok(())
            }
            Command::EditMessage {
                message_id,
                new_text,
            } => {
                let message = self
                    .db
                    .with(|db| db.edit_message(&message_id, &ctx.user, &new_text))
                    .map_err(|e| owned_or(e, EDIT_FAILED))?;
                self.hub.emit_to_channel(
                    &message.room(),
                    &ServerEvent::MessageUpdate { message },
                    None,
                );
                Ok(())
            }
            Command::UnsendMessage { message_id } => {
                let message = self
                    .db
                    .with(|db| db.delete_message(&message_id, &ctx.user))
                    .map_err(|e| owned_or(e, UNSEND_FAILED))?;
                self.hub.emit_to_channel(
                    &message.room(),
                    &ServerEvent::MessageDelete { message_id },
                    None,
                );
                Ok(())
            }
            Command::React { message_id, emoji } => {
                let (outcome, message) = self
                    .db
                    .with(|db| {
                        let message = db.get_message(&message_id)?;
                        if !message.involves(&ctx.user) {
                            return Err(StoreError::NotFound);
                        }
                        db.toggle_reaction(&message_id, &ctx.user, &emoji)
                    })
                    .map_err(|e| owned_or(e, REACT_FAILED))?;
                trace!(msg = %message_id, ?outcome, "reaction");
                self.hub.emit_to_channel(
                    &message.room(),
                    &ServerEvent::MessageUpdate { message },
                    None,
                );
                Ok(())
            }
            Command::MarkSeen { other } => {
                match self.db.with(|db| db.mark_seen(&ctx.user, &other)) {
                    Ok(0) => {}
                    Ok(changed) => {
                        trace!(reader = %ctx.user, other = %other, changed, "marked seen");
                        self.hub.emit_to_channel(
                            &room_for(&ctx.user, &other),
                            &ServerEvent::SeenUpdate {
                                by: ctx.user,
                                other_user_id: other,
                            },
                            None,
                        );
                    }
                    Err(e) => warn!(user = %ctx.user, error = %e, "markSeen failed"),
                }
                Ok(())
            }
        }
    }

    fn relay_to_room(&self, ctx: ConnectionCtx, other: &UserId, event: ServerEvent) {
        self.hub
            .emit_to_channel(&room_for(&ctx.user, other), &event, Some(ctx.conn));
    }

    /// `message` to the pairing channel, `messageNotification` to every live
    /// connection of the recipient.
    fn deliver(&self, message: Message, temp_id: serde_json::Value) {
        let recipient = message.receiver_id;
        self.hub.emit_to_channel(
            &message.room(),
            &ServerEvent::Message {
                message: message.clone(),
                temp_id: temp_id.clone(),
            },
            None,
        );
        let notification = ServerEvent::MessageNotification { message, temp_id };
        for conn in self.presence.connections_for(&recipient) {
            self.hub.emit_to_connection(conn, notification.clone());
        }
    }

    fn load_user(&self, id: &UserId, failure: &str) -> Result<User, ChatError> {
        self.db
            .with(|db| db.get_user(id))
            .map_err(|e| persistence(e, failure))
    }

    // ------------------------------------------------------------------
    // Side-channel notifications
    // ------------------------------------------------------------------

    /// Push a social-graph notice to every connection of `to`.
    pub fn notify(&self, to: &UserId, notice: SocialNotice, from: UserId) {
        let reached = self.hub.emit_to_channel(
            &personal_channel(to),
            &notice.into_event(from),
            None,
        );
        trace!(to = %to, from = %from, ?notice, reached, "notice");
    }
}

fn persistence(e: StoreError, client_text: &str) -> ChatError {
    warn!(error = %e, "{client_text}");
    ChatError::persistence(client_text)
}

/// Missing messages and messages the actor may not touch look the same to
/// the client.
fn owned_or(e: StoreError, client_text: &str) -> ChatError {
    match e {
        StoreError::NotFound => ChatError::forbidden(MESSAGE_UNAVAILABLE),
        other => persistence(other, client_text),
    }
}
