use regex::Regex;
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

/// Closed enumeration of remote error signatures this layer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    AuthKeyUnregistered,
    AuthKeyDuplicated,
    SessionRevoked,
    SessionExpired,
    PhoneCodeInvalid,
    PhoneCodeExpired,
    SessionPasswordNeeded,
    UserDeactivatedBan,
    ChatWriteForbidden,
    UserBannedInChannel,
    UserPrivacyRestricted,
    InputUserDeactivated,
    ChannelPrivate,
    UsernameNotOccupied,
    UsernameInvalid,
    UsernameOccupied,
    InviteHashInvalid,
    InviteHashExpired,
    ChatAdminRequired,
    ChatForwardsRestricted,
    MessageIdInvalid,
    PeerIdInvalid,
    PeerFlood,
    FloodWait,
    NetworkTimeout,
    Unknown,
}

/// How the retry executor treats a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// The remote named a wait duration; honor it and retry.
    ServerDirected,
    /// Abuse protection without a precise duration; fixed wait, then retry.
    FixedWait,
    /// Network-level failure; bounded exponential backoff.
    Transient,
    /// Unclassified failure; same bounded backoff as transient.
    Generic,
    /// Never retried.
    Fatal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthKeyUnregistered => "AUTH_KEY_UNREGISTERED",
            ErrorCode::AuthKeyDuplicated => "AUTH_KEY_DUPLICATED",
            ErrorCode::SessionRevoked => "SESSION_REVOKED",
            ErrorCode::SessionExpired => "SESSION_EXPIRED",
            ErrorCode::PhoneCodeInvalid => "PHONE_CODE_INVALID",
            ErrorCode::PhoneCodeExpired => "PHONE_CODE_EXPIRED",
            ErrorCode::SessionPasswordNeeded => "SESSION_PASSWORD_NEEDED",
            ErrorCode::UserDeactivatedBan => "USER_DEACTIVATED_BAN",
            ErrorCode::ChatWriteForbidden => "CHAT_WRITE_FORBIDDEN",
            ErrorCode::UserBannedInChannel => "USER_BANNED_IN_CHANNEL",
            ErrorCode::UserPrivacyRestricted => "USER_PRIVACY_RESTRICTED",
            ErrorCode::InputUserDeactivated => "INPUT_USER_DEACTIVATED",
            ErrorCode::ChannelPrivate => "CHANNEL_PRIVATE",
            ErrorCode::UsernameNotOccupied => "USERNAME_NOT_OCCUPIED",
            ErrorCode::UsernameInvalid => "USERNAME_INVALID",
            ErrorCode::UsernameOccupied => "USERNAME_OCCUPIED",
            ErrorCode::InviteHashInvalid => "INVITE_HASH_INVALID",
            ErrorCode::InviteHashExpired => "INVITE_HASH_EXPIRED",
            ErrorCode::ChatAdminRequired => "CHAT_ADMIN_REQUIRED",
            ErrorCode::ChatForwardsRestricted => "CHAT_FORWARDS_RESTRICTED",
            ErrorCode::MessageIdInvalid => "MESSAGE_ID_INVALID",
            ErrorCode::PeerIdInvalid => "PEER_ID_INVALID",
            ErrorCode::PeerFlood => "PEER_FLOOD",
            ErrorCode::FloodWait => "FLOOD_WAIT",
            ErrorCode::NetworkTimeout => "NETWORK_TIMEOUT",
            ErrorCode::Unknown => "UNKNOWN",
        }
    }

    pub fn retry_class(&self) -> RetryClass {
        match self {
            ErrorCode::FloodWait => RetryClass::ServerDirected,
            ErrorCode::PeerFlood => RetryClass::FixedWait,
            ErrorCode::NetworkTimeout => RetryClass::Transient,
            ErrorCode::Unknown => RetryClass::Generic,
            _ => RetryClass::Fatal,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured classification of one raw remote failure.
#[derive(Debug, Clone)]
pub struct ErrorClassification {
    pub code: ErrorCode,
    /// The remote error string, verbatim.
    pub raw_message: String,
    /// Caller-facing message, decoupled from the raw remote string.
    pub message: String,
    pub retryable: bool,
    /// Server-directed wait, when the remote named one.
    pub retry_after: Option<Duration>,
}

impl ErrorClassification {
    pub fn retry_class(&self) -> RetryClass {
        self.code.retry_class()
    }
}

/// Wait applied when a rate-limit signal carries no parseable duration.
pub const DEFAULT_FLOOD_WAIT_SECS: u64 = 60;

/// Ordered signature table. First matching needle wins, so more specific
/// signatures must precede the ones they embed.
const SIGNATURES: &[(&[&str], ErrorCode)] = &[
    (&["AUTH_KEY_UNREGISTERED"], ErrorCode::AuthKeyUnregistered),
    (&["AUTH_KEY_DUPLICATED"], ErrorCode::AuthKeyDuplicated),
    (&["SESSION_REVOKED"], ErrorCode::SessionRevoked),
    (&["SESSION_EXPIRED"], ErrorCode::SessionExpired),
    (&["PHONE_CODE_INVALID"], ErrorCode::PhoneCodeInvalid),
    (&["PHONE_CODE_EXPIRED"], ErrorCode::PhoneCodeExpired),
    (&["SESSION_PASSWORD_NEEDED"], ErrorCode::SessionPasswordNeeded),
    (&["USER_DEACTIVATED_BAN"], ErrorCode::UserDeactivatedBan),
    (&["CHAT_WRITE_FORBIDDEN"], ErrorCode::ChatWriteForbidden),
    (&["USER_BANNED_IN_CHANNEL"], ErrorCode::UserBannedInChannel),
    (&["USER_PRIVACY_RESTRICTED"], ErrorCode::UserPrivacyRestricted),
    (&["INPUT_USER_DEACTIVATED"], ErrorCode::InputUserDeactivated),
    (&["CHANNEL_PRIVATE"], ErrorCode::ChannelPrivate),
    (&["USERNAME_NOT_OCCUPIED"], ErrorCode::UsernameNotOccupied),
    (&["USERNAME_INVALID"], ErrorCode::UsernameInvalid),
    (&["USERNAME_OCCUPIED"], ErrorCode::UsernameOccupied),
    (&["INVITE_HASH_INVALID"], ErrorCode::InviteHashInvalid),
    (&["INVITE_HASH_EXPIRED"], ErrorCode::InviteHashExpired),
    (&["CHAT_ADMIN_REQUIRED"], ErrorCode::ChatAdminRequired),
    (&["CHAT_FORWARDS_RESTRICTED"], ErrorCode::ChatForwardsRestricted),
    (&["MESSAGE_ID_INVALID"], ErrorCode::MessageIdInvalid),
    (&["PEER_ID_INVALID"], ErrorCode::PeerIdInvalid),
    (&["PEER_FLOOD"], ErrorCode::PeerFlood),
    (&["FLOOD_WAIT"], ErrorCode::FloodWait),
    (&["NETWORK_TIMEOUT", "ETIMEDOUT"], ErrorCode::NetworkTimeout),
];

/// Classify a raw remote error string.
///
/// Pure function: matching is a case-insensitive substring walk over the
/// ordered signature table; anything unmatched maps to [`ErrorCode::Unknown`]
/// with the raw message passed through.
pub fn classify(raw: &str) -> ErrorClassification {
    let normalized = raw.to_uppercase();

    for (needles, code) in SIGNATURES {
        if needles.iter().any(|needle| normalized.contains(needle)) {
            return classification_for(*code, raw);
        }
    }

    let message = if raw.trim().is_empty() {
        "Unexpected Telegram error occurred.".to_string()
    } else {
        raw.to_string()
    };
    ErrorClassification {
        code: ErrorCode::Unknown,
        raw_message: raw.to_string(),
        message,
        retryable: false,
        retry_after: None,
    }
}

fn classification_for(code: ErrorCode, raw: &str) -> ErrorClassification {
    let (message, retryable, retry_after) = match code {
        ErrorCode::FloodWait => {
            let secs = flood_wait_seconds(raw).unwrap_or(DEFAULT_FLOOD_WAIT_SECS);
            (
                format!("Telegram rate limit reached. Retry after {} seconds.", secs),
                true,
                Some(Duration::from_secs(secs)),
            )
        }
        ErrorCode::PeerFlood => (
            "Telegram temporarily rate-limited this account (PEER_FLOOD). Wait and retry later."
                .to_string(),
            true,
            Some(Duration::from_secs(DEFAULT_FLOOD_WAIT_SECS)),
        ),
        ErrorCode::NetworkTimeout => (
            "Network timeout while connecting to Telegram. Please retry.".to_string(),
            true,
            None,
        ),
        _ => (fatal_message(code).to_string(), false, None),
    };

    ErrorClassification {
        code,
        raw_message: raw.to_string(),
        message,
        retryable,
        retry_after,
    }
}

fn fatal_message(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::AuthKeyUnregistered => {
            "Session is invalid or expired. Please generate a new session and log in again."
        }
        ErrorCode::AuthKeyDuplicated => {
            "Session is already in use from another connection. Disconnect other client(s) or use a fresh session."
        }
        ErrorCode::SessionRevoked => {
            "Telegram revoked this session. Re-authenticate and update your session string."
        }
        ErrorCode::SessionExpired => {
            "Session has expired. Please log in again and save the new session string."
        }
        ErrorCode::PhoneCodeInvalid => {
            "Verification code is invalid. Request a new code and try again."
        }
        ErrorCode::PhoneCodeExpired => {
            "Verification code has expired. Request a new code and retry."
        }
        ErrorCode::SessionPasswordNeeded => {
            "Two-step verification is enabled. Provide your 2FA password."
        }
        ErrorCode::UserDeactivatedBan => "This Telegram account is banned or deactivated.",
        ErrorCode::ChatWriteForbidden => "You do not have permission to write in this chat.",
        ErrorCode::UserBannedInChannel => "You are banned from this channel/group.",
        ErrorCode::UserPrivacyRestricted => "Action blocked by user privacy settings.",
        ErrorCode::InputUserDeactivated => "The target user account is deactivated.",
        ErrorCode::ChannelPrivate => {
            "This channel/group is private or inaccessible to the current account."
        }
        ErrorCode::UsernameNotOccupied => {
            "Username does not exist. Check the @username and try again."
        }
        ErrorCode::UsernameInvalid => {
            "Username format is invalid. Use a valid Telegram @username."
        }
        ErrorCode::UsernameOccupied => "Username is already taken.",
        ErrorCode::InviteHashInvalid => "Invite link is invalid.",
        ErrorCode::InviteHashExpired => "Invite link has expired.",
        ErrorCode::ChatAdminRequired => {
            "This action requires admin rights in the target chat/channel."
        }
        ErrorCode::ChatForwardsRestricted => "Forwarding is restricted in this chat.",
        ErrorCode::MessageIdInvalid => {
            "Message ID is invalid or not found in the specified chat."
        }
        ErrorCode::PeerIdInvalid => {
            "Chat/User reference is invalid. Verify chat ID, username, or invite link."
        }
        // Retryable codes build their messages in classification_for.
        _ => "Unexpected Telegram error occurred.",
    }
}

/// Extract the wait duration from a rate-limit error string.
///
/// Prefers the integer glued to the FLOOD_WAIT marker; falls back to the
/// first standalone integer anywhere in the message (the remote also phrases
/// this as "A wait of N seconds is required").
fn flood_wait_seconds(raw: &str) -> Option<u64> {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    static FALLBACK: OnceLock<Regex> = OnceLock::new();

    let marker =
        MARKER.get_or_init(|| Regex::new(r"(?i)FLOOD_WAIT[_\s]*(\d+)").expect("valid pattern"));
    let fallback = FALLBACK.get_or_init(|| Regex::new(r"\b(\d+)\b").expect("valid pattern"));

    let captures = marker.captures(raw).or_else(|| fallback.captures(raw))?;
    captures[1].parse::<u64>().ok().filter(|&secs| secs > 0)
}
