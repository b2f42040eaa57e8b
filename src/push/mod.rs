/// Push notifications for offline family members
///
/// Message ingress enqueues one `PushJob` per chat message whose family has
/// members without a live connection. A single worker resolves the
/// recipients' active device tokens and posts one notification per device
/// to APNs. Tokens the provider rejects are deactivated.

pub mod apns;
pub mod queue;
pub mod tokens;

pub use apns::ApnsClient;
pub use queue::{DeliveryReport, PushQueue, PushWorker};
pub use tokens::{
    DeviceToken, DeviceTokenRegistry, Environment, NewDevice, Platform, Registration,
    TransferPolicy,
};

/// One chat message to announce to offline members
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushJob {
    pub message_id: u64,
    pub family_id: u64,
    pub sender_id: u64,
    pub sender_name: String,
    pub content: String,
    /// Never contains the sender or users online at enqueue time
    pub recipient_user_ids: Vec<u64>,
}
