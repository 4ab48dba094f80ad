use thiserror::Error;

/// Failures surfaced to the requesting client as a human-readable message.
/// Handlers never let these escape the event boundary.
#[derive(Debug, Error)]
pub enum LobbyError {
    #[error("Room {0} does not exist.")]
    RoomNotFound(String),
    #[error("{0} is offline or does not exist.")]
    UserOffline(String),
    #[error("{user} is not the host of room {room}.")]
    NotHost { user: String, room: String },
    #[error("{0} does not have invite privileges in this room.")]
    InviteForbidden(String),
}
