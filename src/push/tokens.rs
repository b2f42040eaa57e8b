/// Device token registry
///
/// One record per provider token string. Tokens are soft-deleted: a
/// deactivated record stays in the bucket and is revived if the device
/// registers the same token again.
use crate::error::{AppError, AppResult};
use crate::store::codec::{self, CodecError, Packer, Unpacker};
use crate::store::{tables, ReadTx, Record, Store, Window, WriteTx};
use chrono::{DateTime, Utc};
use redb::TableDefinition;
use serde::{Deserialize, Serialize};

/// Longest token string accepted
const MAX_TOKEN_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Sandbox,
    Production,
}

/// A registered push device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceToken {
    pub id: u64,
    pub user_id: u64,
    pub token: String,
    pub platform: Platform,
    pub environment: Environment,
    pub bundle_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub active: bool,
}

impl Record for DeviceToken {
    const BUCKET: TableDefinition<'static, u64, &'static [u8]> = tables::PUSH_DEVICE_TOKENS;

    fn id(&self) -> u64 {
        self.id
    }

    fn pack(&self) -> Vec<u8> {
        let platform = match self.platform {
            Platform::Ios => 0,
            Platform::Android => 1,
        };
        let environment = match self.environment {
            Environment::Sandbox => 0,
            Environment::Production => 1,
        };

        let mut p = Packer::new(1);
        p.u64(self.id)
            .u64(self.user_id)
            .str(&self.token)
            .u8(platform)
            .u8(environment)
            .str(&self.bundle_id)
            .time(self.created_at)
            .time(self.updated_at)
            .bool(self.active);
        p.finish()
    }

    fn unpack(buf: &[u8]) -> Result<Self, CodecError> {
        let (mut u, _) = Unpacker::new("device_token", buf, &[1])?;

        let id = u.u64()?;
        let user_id = u.u64()?;
        let token = u.str()?;
        let platform = match u.u8()? {
            0 => Platform::Ios,
            1 => Platform::Android,
            other => return Err(u.invalid("platform", other as u64)),
        };
        let environment = match u.u8()? {
            0 => Environment::Sandbox,
            1 => Environment::Production,
            other => return Err(u.invalid("environment", other as u64)),
        };

        Ok(Self {
            id,
            user_id,
            token,
            platform,
            environment,
            bundle_id: u.str()?,
            created_at: u.time()?,
            updated_at: u.time()?,
            active: u.bool()?,
        })
    }
}

/// APNs tokens are hex; other providers' tokens stay within a URL-safe set
fn valid_token(platform: Platform, token: &str) -> bool {
    if token.is_empty() || token.len() > MAX_TOKEN_LEN {
        return false;
    }
    match platform {
        Platform::Ios => hex::decode(token).is_ok(),
        Platform::Android => token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b':' | b'-' | b'_')),
    }
}

/// What to do when a token registered by one user is presented by another
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPolicy {
    /// Move the token to the new user
    Allow,
    /// Refuse with `Forbidden`
    Reject,
}

/// Result of a registration
#[derive(Debug, Clone)]
pub struct Registration {
    pub token: DeviceToken,
    /// True when a new record was created
    pub created: bool,
    /// Previous owner when the token moved between users
    pub previous_owner: Option<u64>,
}

/// Registration request fields
#[derive(Debug, Clone)]
pub struct NewDevice {
    pub token: String,
    pub platform: Platform,
    pub environment: Environment,
    pub bundle_id: String,
}

/// Device tokens keyed by provider token string, indexed by user
#[derive(Clone)]
pub struct DeviceTokenRegistry {
    store: Store,
}

impl DeviceTokenRegistry {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Insert a token, or revive and update the record that already holds it
    pub async fn register(
        &self,
        user_id: u64,
        device: NewDevice,
        policy: TransferPolicy,
    ) -> AppResult<Registration> {
        let token = device.token.trim().to_string();
        if !valid_token(device.platform, &token) {
            return Err(AppError::Validation("Invalid device token".to_string()));
        }
        let device = NewDevice { token, ..device };

        let registration = self
            .store
            .update_blocking(move |tx| register_in(tx, user_id, device, policy))
            .await?;

        if let Some(previous) = registration.previous_owner {
            tracing::warn!(
                token_id = registration.token.id,
                previous_owner = previous,
                user_id,
                "Device token moved to a new user"
            );
        }
        Ok(registration)
    }

    /// Deactivate by token string
    pub async fn deactivate(&self, token: &str) -> AppResult<DeviceToken> {
        let token = token.to_string();
        self.store
            .update_blocking(move |tx| {
                let id = tx
                    .lookup(tables::DEVICE_TOKEN_BY_TOKEN, &token)?
                    .ok_or_else(|| AppError::NotFound("Device token not found".to_string()))?;
                deactivate_in(tx, id)
            })
            .await
    }

    /// Deactivate a token the caller owns. Tokens owned by others read as missing.
    pub async fn deactivate_for_user(&self, user_id: u64, token: &str) -> AppResult<DeviceToken> {
        let token = token.to_string();
        self.store
            .update_blocking(move |tx| {
                let record = tx
                    .lookup(tables::DEVICE_TOKEN_BY_TOKEN, &token)?
                    .map(|id| tx.get::<DeviceToken>(id))
                    .transpose()?
                    .flatten()
                    .filter(|record| record.user_id == user_id)
                    .ok_or_else(|| AppError::NotFound("Device token not found".to_string()))?;
                deactivate_in(tx, record.id)
            })
            .await
    }

    /// Deactivate by primary key
    pub async fn deactivate_by_id(&self, id: u64) -> AppResult<DeviceToken> {
        self.store
            .update_blocking(move |tx| deactivate_in(tx, id))
            .await
    }

    /// Active tokens of one user
    pub async fn tokens_for_user(&self, user_id: u64) -> AppResult<Vec<DeviceToken>> {
        self.store
            .view_blocking(move |tx| tokens_for_user_in(tx, user_id))
            .await
    }
}

fn register_in(
    tx: &WriteTx,
    user_id: u64,
    device: NewDevice,
    policy: TransferPolicy,
) -> AppResult<Registration> {
    let now = codec::now();

    let existing = match tx.lookup(tables::DEVICE_TOKEN_BY_TOKEN, &device.token)? {
        Some(id) => tx.get::<DeviceToken>(id)?,
        None => None,
    };

    let registration = match existing {
        Some(mut record) => {
            let previous_owner = (record.user_id != user_id).then_some(record.user_id);
            if previous_owner.is_some() && policy == TransferPolicy::Reject {
                return Err(AppError::Forbidden(
                    "Device token is registered to another user".to_string(),
                ));
            }

            record.user_id = user_id;
            record.platform = device.platform;
            record.environment = device.environment;
            record.bundle_id = device.bundle_id;
            record.active = true;
            record.updated_at = now;

            Registration {
                token: record,
                created: false,
                previous_owner,
            }
        }
        None => {
            let record = DeviceToken {
                id: tx.next_id::<DeviceToken>()?,
                user_id,
                token: device.token,
                platform: device.platform,
                environment: device.environment,
                bundle_id: device.bundle_id,
                created_at: now,
                updated_at: now,
                active: true,
            };
            tx.set_lookup(tables::DEVICE_TOKEN_BY_TOKEN, &record.token, record.id)?;

            Registration {
                token: record,
                created: true,
                previous_owner: None,
            }
        }
    };

    tx.put(&registration.token)?;
    tx.set_term(tables::DEVICE_TOKEN_BY_USER, registration.token.id, user_id)?;
    Ok(registration)
}

fn deactivate_in(tx: &WriteTx, id: u64) -> AppResult<DeviceToken> {
    let mut record = tx
        .get::<DeviceToken>(id)?
        .ok_or_else(|| AppError::NotFound("Device token not found".to_string()))?;

    record.active = false;
    record.updated_at = codec::now();
    tx.put(&record)?;
    Ok(record)
}

/// Active tokens of one user inside an open read transaction
pub fn tokens_for_user_in(tx: &ReadTx, user_id: u64) -> AppResult<Vec<DeviceToken>> {
    let records: Vec<DeviceToken> =
        tx.records_for(tables::DEVICE_TOKEN_BY_USER, user_id, Window::all())?;
    Ok(records.into_iter().filter(|t| t.active).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;

    fn device(token: &str) -> NewDevice {
        NewDevice {
            token: token.to_string(),
            platform: Platform::Ios,
            environment: Environment::Sandbox,
            bundle_id: "com.example.family".to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_is_unique_per_token() {
        let (_dir, store) = test_store();
        let registry = DeviceTokenRegistry::new(store);

        let first = registry
            .register(11, device("abcd"), TransferPolicy::Allow)
            .await
            .unwrap();
        let again = registry
            .register(11, device("abcd"), TransferPolicy::Allow)
            .await
            .unwrap();

        assert!(first.created);
        assert!(!again.created);
        assert_eq!(first.token.id, again.token.id);
        assert_eq!(registry.tokens_for_user(11).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transfer_moves_token_between_users() {
        let (_dir, store) = test_store();
        let registry = DeviceTokenRegistry::new(store);

        registry
            .register(11, device("abcd"), TransferPolicy::Allow)
            .await
            .unwrap();
        let moved = registry
            .register(12, device("abcd"), TransferPolicy::Allow)
            .await
            .unwrap();

        assert_eq!(moved.previous_owner, Some(11));
        assert!(registry.tokens_for_user(11).await.unwrap().is_empty());
        assert_eq!(registry.tokens_for_user(12).await.unwrap()[0].token, "abcd");
    }

    #[tokio::test]
    async fn test_reject_policy_refuses_transfer() {
        let (_dir, store) = test_store();
        let registry = DeviceTokenRegistry::new(store);

        registry
            .register(11, device("abcd"), TransferPolicy::Reject)
            .await
            .unwrap();
        let err = registry
            .register(12, device("abcd"), TransferPolicy::Reject)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Forbidden(_)));
        assert_eq!(registry.tokens_for_user(11).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_deactivated_token_hidden_then_revived() {
        let (_dir, store) = test_store();
        let registry = DeviceTokenRegistry::new(store);

        let registered = registry
            .register(11, device("abcd"), TransferPolicy::Allow)
            .await
            .unwrap();
        let deactivated = registry.deactivate("abcd").await.unwrap();

        assert!(!deactivated.active);
        assert!(deactivated.updated_at >= registered.token.updated_at);
        assert!(registry.tokens_for_user(11).await.unwrap().is_empty());

        let revived = registry
            .register(11, device("abcd"), TransferPolicy::Allow)
            .await
            .unwrap();
        assert!(revived.token.active);
        assert_eq!(revived.token.id, registered.token.id);
    }

    #[tokio::test]
    async fn test_deactivate_missing_is_not_found() {
        let (_dir, store) = test_store();
        let registry = DeviceTokenRegistry::new(store);

        assert!(matches!(
            registry.deactivate("nope").await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            registry.deactivate_by_id(99).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_deactivate_for_user_checks_owner() {
        let (_dir, store) = test_store();
        let registry = DeviceTokenRegistry::new(store);
        registry
            .register(11, device("abcd"), TransferPolicy::Allow)
            .await
            .unwrap();

        assert!(matches!(
            registry.deactivate_for_user(12, "abcd").await,
            Err(AppError::NotFound(_))
        ));
        assert!(!registry.deactivate_for_user(11, "abcd").await.unwrap().active);
    }

    #[tokio::test]
    async fn test_blank_token_rejected() {
        let (_dir, store) = test_store();
        let registry = DeviceTokenRegistry::new(store);

        assert!(matches!(
            registry.register(11, device("  "), TransferPolicy::Allow).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_ios_token_must_be_hex() {
        let (_dir, store) = test_store();
        let registry = DeviceTokenRegistry::new(store);

        for bad in ["x/../../foo", "abc", "abcg", "ab cd"] {
            assert!(
                matches!(
                    registry.register(11, device(bad), TransferPolicy::Allow).await,
                    Err(AppError::Validation(_))
                ),
                "{bad} accepted"
            );
        }
        assert!(registry.tokens_for_user(11).await.unwrap().is_empty());

        let android = NewDevice {
            platform: Platform::Android,
            ..device("fcm:APA91b-x_y")
        };
        assert!(registry.register(11, android, TransferPolicy::Allow).await.is_ok());
    }

    #[tokio::test]
    async fn test_registration_matches_stored_record() {
        let (_dir, store) = test_store();
        let registry = DeviceTokenRegistry::new(store);

        let registered = registry
            .register(11, device("abcd"), TransferPolicy::Allow)
            .await
            .unwrap();
        let stored = registry.tokens_for_user(11).await.unwrap();
        assert_eq!(stored, vec![registered.token]);
    }
}
