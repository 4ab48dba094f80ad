use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;
use warp::ws::{Message, WebSocket};

use crate::error::LobbyError;
use crate::history::{ChatHistory, ChatRecord};
use crate::messages::{ClientEnvelope, ClientEvent, ServerEvent};
use crate::presence::{ConnectionId, Presence};
use crate::room::{RoomStore, LOBBY_ROOM_ID};

type Connections = RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<Message>>>;

/// Per-connection state threaded through the event loop. One connection is
/// bound to at most one username at a time.
pub(crate) struct ConnCtx {
    conn_id: ConnectionId,
    username: Option<String>,
}

pub struct Server {
    presence: Presence,
    rooms: RoomStore,
    history: Arc<dyn ChatHistory>,
    connections: Connections,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
        })
}

impl Server {
    pub fn new(history: Arc<dyn ChatHistory>) -> Self {
        Server {
            presence: Presence::new(),
            rooms: RoomStore::new(),
            history,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Runs the read loop for one WebSocket. Events from this connection are
    /// handled strictly in order; outbound traffic goes through an unbounded
    /// channel drained by a writer task.
    pub async fn handle_connection(&self, ws: WebSocket) {
        let conn_id = Uuid::new_v4().to_string();
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel();

        {
            let mut connections = self.connections.write().await;
            connections.insert(conn_id.clone(), tx);
        }
        debug!("connection {conn_id} opened");

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = ws_tx.send(message).await {
                    debug!("websocket send failed: {e}");
                    break;
                }
            }
        });

        let mut ctx = ConnCtx {
            conn_id,
            username: None,
        };

        while let Some(result) = ws_rx.next().await {
            match result {
                Ok(msg) => {
                    let Ok(text) = msg.to_str() else { continue };
                    match serde_json::from_str::<ClientEnvelope>(text) {
                        Ok(envelope) => self.handle_event(&mut ctx, envelope).await,
                        Err(e) => {
                            debug!("undecodable frame on {}: {e}", ctx.conn_id);
                            self.reply(
                                &ctx,
                                ServerEvent::Error {
                                    message: "Unrecognized event.".to_string(),
                                },
                            )
                            .await;
                        }
                    }
                }
                Err(e) => {
                    debug!("websocket error on {}: {e}", ctx.conn_id);
                    break;
                }
            }
        }

        self.handle_disconnect(&ctx).await;
    }

    /// Central dispatch. Every arm resolves to a reply, a broadcast, or a
    /// logged no-op; errors stop at this boundary as failure acks.
    pub(crate) async fn handle_event(&self, ctx: &mut ConnCtx, envelope: ClientEnvelope) {
        let tag = envelope.tag;
        match envelope.event {
            ClientEvent::Login {
                username,
                colour: _,
            } => {
                if let Some(displaced) = self.presence.login(&username, &ctx.conn_id).await {
                    debug!("{username} logged in again, displacing connection {displaced}");
                }
                info!("{username} logged in on {}", ctx.conn_id);
                ctx.username = Some(username.clone());
                self.reply(
                    ctx,
                    ServerEvent::ConnectionStatus {
                        message: format!("Logged in as {username}."),
                        username,
                    },
                )
                .await;
            }

            ClientEvent::Logout { username } => {
                self.presence.logout(&username).await;
                if ctx.username.as_deref() == Some(username.as_str()) {
                    ctx.username = None;
                }
                info!("{username} logged out");
            }

            ClientEvent::RequestUserList => {
                let users = self
                    .presence
                    .list_all()
                    .await
                    .into_keys()
                    .map(|username| (username, true))
                    .collect();
                self.reply(ctx, ServerEvent::UserList { tag, users }).await;
            }

            ClientEvent::CreateRoom { username } => {
                let room = self.rooms.create_room(&username).await;
                info!("{username} created room {}", room.id);
                self.reply(
                    ctx,
                    ServerEvent::RoomCreated {
                        tag,
                        room_id: room.id.clone(),
                        room,
                    },
                )
                .await;
            }

            ClientEvent::Invite {
                room_id,
                target_user,
                by_user,
            } => {
                // Offline target: report failure without touching the room.
                let Some(target_conn) = self.presence.lookup(&target_user).await else {
                    let message = LobbyError::UserOffline(target_user).to_string();
                    self.ack(ctx, tag, false, message).await;
                    return;
                };
                match self.rooms.invite(&room_id, &target_user, &by_user).await {
                    Ok(room_name) => {
                        self.send_to_connection(
                            &target_conn,
                            &ServerEvent::Invitation {
                                room_id,
                                room_name,
                                invited_user: target_user.clone(),
                                by_user,
                            },
                        )
                        .await;
                        self.ack(ctx, tag, true, format!("Invitation sent to {target_user}"))
                            .await;
                    }
                    Err(e) => self.ack(ctx, tag, false, e.to_string()).await,
                }
            }

            ClientEvent::JoinRoom { room_id, username } => {
                match self.rooms.join(&room_id, &username).await {
                    Ok(outcome) => {
                        self.ack(ctx, tag, true, format!("Joined game lobby: {room_id}"))
                            .await;
                        if outcome.first_join {
                            self.broadcast_room(
                                &room_id,
                                &ServerEvent::GameMessage {
                                    room_id: room_id.clone(),
                                    body: format!(
                                        "<green>Game Lobby: </green>{username} has joined the game lobby!"
                                    ),
                                },
                            )
                            .await;
                        }
                    }
                    Err(e) => self.ack(ctx, tag, false, e.to_string()).await,
                }
            }

            ClientEvent::RequestJoin { username, room_id } => {
                match self.rooms.request_join(&room_id, &username).await {
                    Ok(request) if request.invited => {
                        self.reply(
                            ctx,
                            ServerEvent::JoinResult {
                                tag,
                                room_exists: true,
                                invitation: true,
                                message: format!(
                                    "You are invited to {}. Join when ready.",
                                    request.room_name
                                ),
                            },
                        )
                        .await;
                    }
                    Ok(request) => {
                        self.broadcast_room(
                            &room_id,
                            &ServerEvent::GameMessage {
                                room_id: room_id.clone(),
                                body: format!(
                                    "<green>Game Lobby: </green>{username} wants to join the game lobby."
                                ),
                            },
                        )
                        .await;
                        self.send_to_user(
                            &request.host,
                            &ServerEvent::JoinRequested {
                                room_id: room_id.clone(),
                                username: username.clone(),
                            },
                        )
                        .await;
                        self.reply(
                            ctx,
                            ServerEvent::JoinResult {
                                tag,
                                room_exists: true,
                                invitation: false,
                                message: format!(
                                    "{}: waiting for the host to let you in.",
                                    request.room_name
                                ),
                            },
                        )
                        .await;
                    }
                    Err(e) => {
                        self.reply(
                            ctx,
                            ServerEvent::JoinResult {
                                tag,
                                room_exists: false,
                                invitation: false,
                                message: e.to_string(),
                            },
                        )
                        .await;
                    }
                }
            }

            ClientEvent::LetUserJoin {
                room_id,
                username,
                by_host,
            } => match self.rooms.let_user_join(&room_id, &username, &by_host).await {
                Ok(room_name) => {
                    let delivered = self
                        .send_to_user(
                            &username,
                            &ServerEvent::Invitation {
                                room_id: room_id.clone(),
                                room_name,
                                invited_user: username.clone(),
                                by_user: by_host,
                            },
                        )
                        .await;
                    if !delivered {
                        debug!("{username} approved for {room_id} while offline");
                    }
                }
                Err(e) => self.ack(ctx, tag, false, e.to_string()).await,
            },

            ClientEvent::LeaveRoom { username, room_id } => {
                match self.rooms.leave(&room_id, &username).await {
                    Ok(true) => {
                        self.broadcast_room(
                            &room_id,
                            &ServerEvent::GameMessage {
                                room_id: room_id.clone(),
                                body: format!(
                                    "<green>Game Lobby:</green> {username} has left the game lobby."
                                ),
                            },
                        )
                        .await;
                    }
                    Ok(false) => {
                        self.ack(ctx, tag, false, format!("{username} is not in room {room_id}."))
                            .await;
                    }
                    Err(e) => self.ack(ctx, tag, false, e.to_string()).await,
                }
            }

            ClientEvent::RenameRoom {
                room_id,
                new_name,
                by_user,
            } => match self.rooms.rename(&room_id, &new_name, &by_user).await {
                Ok(()) => {
                    self.ack(ctx, tag, true, format!("Game name changed to {new_name}"))
                        .await;
                    self.broadcast_room(
                        &room_id,
                        &ServerEvent::RoomRenamed {
                            room_id: room_id.clone(),
                            name: new_name,
                        },
                    )
                    .await;
                }
                Err(e) => self.ack(ctx, tag, false, e.to_string()).await,
            },

            ClientEvent::CloseRoom { room_id, by_user } => {
                match self.rooms.close(&room_id, &by_user).await {
                    Ok(members) => {
                        // The room is already gone from the store; evict every
                        // former member before anything else runs for them.
                        let notice = ServerEvent::RoomClosed {
                            room_id: room_id.clone(),
                            message: "The host has closed the game lobby.".to_string(),
                        };
                        for member in members {
                            self.send_to_user(&member, &notice).await;
                        }
                        if let Err(e) = self.history.delete_all(&room_id).await {
                            warn!("failed to delete chat history for {room_id}: {e}");
                        }
                        self.ack(ctx, tag, true, format!("Room {room_id} closed."))
                            .await;
                    }
                    Err(e) => self.ack(ctx, tag, false, e.to_string()).await,
                }
            }

            ClientEvent::ChatMessage {
                username,
                colour,
                room_id,
                body,
            } => {
                let room_id = room_id.unwrap_or_else(|| LOBBY_ROOM_ID.to_string());
                if room_id != LOBBY_ROOM_ID && self.rooms.get(&room_id).await.is_none() {
                    let message = LobbyError::RoomNotFound(room_id).to_string();
                    self.ack(ctx, tag, false, message).await;
                    return;
                }

                let record = ChatRecord {
                    message_id: Uuid::new_v4().to_string(),
                    room_id: room_id.clone(),
                    user_id: username.clone(),
                    body: body.clone(),
                    timestamp_ms: now_ms(),
                };
                let timestamp_ms = record.timestamp_ms;

                // Best-effort durability: a failed append never holds up the
                // broadcast.
                if let Err(e) = self.history.append(record).await {
                    warn!("chat append failed for room {room_id}: {e}");
                } else if room_id == LOBBY_ROOM_ID {
                    if let Err(e) = self.history.trim(&room_id).await {
                        warn!("chat trim failed for room {room_id}: {e}");
                    }
                }

                let is_lobby = room_id == LOBBY_ROOM_ID;
                let outbound = ServerEvent::ChatMessage {
                    room_id: (!is_lobby).then(|| room_id.clone()),
                    username,
                    colour,
                    body,
                    timestamp_ms,
                };
                if is_lobby {
                    self.broadcast_all(&outbound).await;
                } else {
                    self.broadcast_room(&room_id, &outbound).await;
                }
            }

            ClientEvent::Whisper {
                from_user,
                to_user,
                body,
            } => {
                let delivered = self
                    .send_to_user(&to_user, &ServerEvent::Whisper { from_user, body })
                    .await;
                if delivered {
                    self.ack(ctx, tag, true, format!("Whisper sent to {to_user}."))
                        .await;
                } else {
                    let message = LobbyError::UserOffline(to_user).to_string();
                    self.ack(ctx, tag, false, message).await;
                }
            }

            ClientEvent::RequestChatHistory { room_id } => {
                match self.history.retrieve(&room_id).await {
                    Ok(messages) => {
                        self.reply(
                            ctx,
                            ServerEvent::ChatHistory {
                                tag,
                                room_id,
                                messages,
                            },
                        )
                        .await;
                    }
                    Err(e) => {
                        warn!("chat history retrieval failed for {room_id}: {e}");
                        self.ack(ctx, tag, false, "Chat history is unavailable.".to_string())
                            .await;
                    }
                }
            }

            ClientEvent::GetRoomUsers { room_id } => match self.rooms.members(&room_id).await {
                Ok(members) => {
                    self.reply(
                        ctx,
                        ServerEvent::RoomUsers {
                            tag,
                            room_id,
                            users: members.into_iter().collect(),
                        },
                    )
                    .await;
                }
                Err(e) => self.ack(ctx, tag, false, e.to_string()).await,
            },

            ClientEvent::GetRoomData { room_id } => match self.rooms.get(&room_id).await {
                Some(room) => self.reply(ctx, ServerEvent::RoomData { tag, room }).await,
                None => {
                    let message = LobbyError::RoomNotFound(room_id).to_string();
                    self.ack(ctx, tag, false, message).await;
                }
            },

            ClientEvent::GetRoomList => {
                let rooms = self.rooms.list().await.into_iter().collect();
                self.reply(ctx, ServerEvent::RoomList { tag, rooms }).await;
            }

            ClientEvent::StartGame { room_id, by_user } => {
                match self.rooms.set_started(&room_id, true, &by_user).await {
                    Ok(()) => {
                        self.ack(ctx, tag, true, "The game has started.".to_string())
                            .await;
                        self.broadcast_room(
                            &room_id,
                            &ServerEvent::GameMessage {
                                room_id: room_id.clone(),
                                body: "<green>Game Lobby:</green> The game has started!"
                                    .to_string(),
                            },
                        )
                        .await;
                    }
                    Err(e) => self.ack(ctx, tag, false, e.to_string()).await,
                }
            }

            ClientEvent::EndGame { room_id, by_user } => {
                match self.rooms.set_started(&room_id, false, &by_user).await {
                    Ok(()) => {
                        self.ack(ctx, tag, true, "The game has ended.".to_string())
                            .await;
                        self.broadcast_room(
                            &room_id,
                            &ServerEvent::GameMessage {
                                room_id: room_id.clone(),
                                body: "<green>Game Lobby:</green> The game has ended.".to_string(),
                            },
                        )
                        .await;
                    }
                    Err(e) => self.ack(ctx, tag, false, e.to_string()).await,
                }
            }

            ClientEvent::KickUser {
                room_id,
                target_user,
                by_user,
            } => match self.rooms.kick(&room_id, &target_user, &by_user).await {
                Ok(true) => {
                    self.send_to_user(
                        &target_user,
                        &ServerEvent::RoomClosed {
                            room_id: room_id.clone(),
                            message: "You have been kicked from the game lobby.".to_string(),
                        },
                    )
                    .await;
                    self.broadcast_room(
                        &room_id,
                        &ServerEvent::GameMessage {
                            room_id: room_id.clone(),
                            body: format!(
                                "<green>Game Lobby:</green> {target_user} was kicked from the game lobby."
                            ),
                        },
                    )
                    .await;
                    self.ack(ctx, tag, true, format!("{target_user} was kicked."))
                        .await;
                }
                Ok(false) => {
                    self.ack(ctx, tag, false, format!("{target_user} is not in room {room_id}."))
                        .await;
                }
                Err(e) => self.ack(ctx, tag, false, e.to_string()).await,
            },

            ClientEvent::SetGuestInvite {
                room_id,
                enabled,
                by_user,
            } => match self.rooms.set_guest_invite(&room_id, enabled, &by_user).await {
                Ok(()) => {
                    let state = if enabled { "enabled" } else { "disabled" };
                    self.ack(ctx, tag, true, format!("Guest invites {state}."))
                        .await;
                }
                Err(e) => self.ack(ctx, tag, false, e.to_string()).await,
            },
        }
    }

    /// Transport-level disconnect counts as logout, unless a newer login
    /// already owns the presence entry; then this socket is a stale orphan
    /// and must not disturb room state.
    async fn handle_disconnect(&self, ctx: &ConnCtx) {
        if let Some(username) = &ctx.username {
            if self.presence.logout_connection(username, &ctx.conn_id).await {
                info!("{username} disconnected, treating as logout");
                for room_id in self.rooms.leave_all(username).await {
                    self.broadcast_room(
                        &room_id,
                        &ServerEvent::GameMessage {
                            room_id: room_id.clone(),
                            body: format!(
                                "<green>Game Lobby:</green> {username} has left the game lobby."
                            ),
                        },
                    )
                    .await;
                }
            }
        }
        let mut connections = self.connections.write().await;
        connections.remove(&ctx.conn_id);
        debug!("connection {} closed", ctx.conn_id);
    }

    async fn reply(&self, ctx: &ConnCtx, event: ServerEvent) {
        self.send_to_connection(&ctx.conn_id, &event).await;
    }

    async fn ack(&self, ctx: &ConnCtx, tag: Option<u64>, ok: bool, message: String) {
        self.reply(ctx, ServerEvent::Ack { tag, ok, message }).await;
    }

    async fn send_to_connection(&self, conn_id: &str, event: &ServerEvent) {
        match serde_json::to_string(event) {
            Ok(text) => {
                let connections = self.connections.read().await;
                if let Some(sender) = connections.get(conn_id) {
                    let _ = sender.send(Message::text(text));
                }
            }
            Err(e) => error!("failed to encode server event: {e}"),
        }
    }

    /// Routes through the presence registry; false means offline/unknown.
    async fn send_to_user(&self, username: &str, event: &ServerEvent) -> bool {
        match self.presence.lookup(username).await {
            Some(conn_id) => {
                self.send_to_connection(&conn_id, event).await;
                true
            }
            None => false,
        }
    }

    async fn broadcast_room(&self, room_id: &str, event: &ServerEvent) {
        let Ok(members) = self.rooms.members(room_id).await else {
            return;
        };
        let Ok(text) = serde_json::to_string(event) else {
            error!("failed to encode room broadcast");
            return;
        };
        let connections = self.connections.read().await;
        for username in members.keys() {
            if let Some(conn_id) = self.presence.lookup(username).await {
                if let Some(sender) = connections.get(&conn_id) {
                    let _ = sender.send(Message::text(text.clone()));
                }
            }
        }
    }

    async fn broadcast_all(&self, event: &ServerEvent) {
        let Ok(text) = serde_json::to_string(event) else {
            error!("failed to encode broadcast");
            return;
        };
        let connections = self.connections.read().await;
        for sender in connections.values() {
            let _ = sender.send(Message::text(text.clone()));
        }
    }
}
