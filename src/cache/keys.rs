//! Key builders for the common cached lookups, so every call site spells
//! the same key the same way.

pub fn user(user_id: &str) -> String {
    format!("user:{}", user_id)
}

pub fn chat(chat_id: &str) -> String {
    format!("chat:{}", chat_id)
}

pub fn channel(channel_id: &str) -> String {
    format!("channel:{}", channel_id)
}

pub fn chat_members(channel_id: &str, limit: usize) -> String {
    format!("chat_members:{}:{}", channel_id, limit)
}

pub fn dialogs(limit: usize) -> String {
    format!("dialogs:{}", limit)
}
