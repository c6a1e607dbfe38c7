//! Key and channel naming for the coordination store.

use shared::domain::{CallId, RoomId, UserId};

pub const ONLINE_USERS: &str = "presence:online";

pub fn user_sessions(user_id: UserId) -> String {
    format!("presence:user:{user_id}:sessions")
}

pub fn busy_marker(user_id: UserId) -> String {
    format!("presence:busy:{user_id}")
}

pub fn typing_room(room_id: RoomId) -> String {
    format!("typing:room:{room_id}")
}

pub fn rate_limit(scope: &str, key: &str) -> String {
    format!("ratelimit:{scope}:{key}")
}

pub fn call_session(call_id: &CallId) -> String {
    format!("call:{call_id}")
}

pub fn room_channel(room_id: RoomId) -> String {
    format!("room:{room_id}")
}

pub fn user_channel(user_id: UserId) -> String {
    format!("user:{user_id}")
}
