/// Family Portal - media and messaging pipelines
///
/// Photo uploads are transcoded into size and format variants by a
/// background worker, chat messages fan out to live WebSocket connections,
/// and family members without a live connection get a push notification.

pub mod account;
pub mod api;
pub mod chat;
pub mod config;
pub mod context;
pub mod error;
pub mod jobs;
pub mod media;
pub mod metrics;
pub mod push;
pub mod server;
pub mod store;
