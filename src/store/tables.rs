//! redb table definitions for the portal store.
//!
//! Buckets hold packed records keyed by integer id. Indexes are term -> target
//! multimaps paired with a target -> term table so a target can be moved to a
//! new term in one step.

use super::Index;
use redb::TableDefinition;

pub const IMAGES: TableDefinition<u64, &[u8]> = TableDefinition::new("images");

pub const CHAT_MESSAGES: TableDefinition<u64, &[u8]> = TableDefinition::new("chat_messages");

pub const PUSH_DEVICE_TOKENS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("push_device_tokens");

pub const USERS: TableDefinition<u64, &[u8]> = TableDefinition::new("users");

/// Per-bucket id counters keyed by bucket name.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

/// Device token string -> device token id. Enforces token uniqueness.
pub const DEVICE_TOKEN_BY_TOKEN: TableDefinition<&str, u64> =
    TableDefinition::new("push_device_token_by_token");

/// Session token -> user id, populated by the account system.
pub const SESSIONS: TableDefinition<&str, u64> = TableDefinition::new("sessions");

pub const CHAT_MESSAGES_BY_FAMILY: Index = Index::new(
    "chat_messages_by_family",
    "chat_messages_by_family.owner",
);

pub const CHAT_MESSAGES_BY_USER: Index =
    Index::new("chat_messages_by_user", "chat_messages_by_user.owner");

pub const IMAGE_BY_FAMILY: Index = Index::new("image_by_family", "image_by_family.owner");

pub const IMAGE_BY_PERSON: Index = Index::new("image_by_person", "image_by_person.owner");

pub const DEVICE_TOKEN_BY_USER: Index = Index::new(
    "push_device_token_by_user",
    "push_device_token_by_user.owner",
);

pub const USERS_BY_FAMILY: Index = Index::new("users_by_family", "users_by_family.owner");

pub const ALL_INDEXES: [Index; 6] = [
    CHAT_MESSAGES_BY_FAMILY,
    CHAT_MESSAGES_BY_USER,
    IMAGE_BY_FAMILY,
    IMAGE_BY_PERSON,
    DEVICE_TOKEN_BY_USER,
    USERS_BY_FAMILY,
];

pub const ALL_BUCKETS: [TableDefinition<'static, u64, &'static [u8]>; 4] =
    [IMAGES, CHAT_MESSAGES, PUSH_DEVICE_TOKENS, USERS];

pub const ALL_LOOKUPS: [TableDefinition<'static, &'static str, u64>; 3] =
    [SEQUENCES, DEVICE_TOKEN_BY_TOKEN, SESSIONS];
