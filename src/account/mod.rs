/// Account directory
///
/// Accounts, families and sessions are owned by the external account system.
/// The pipelines only resolve a session to a user and a family to its members,
/// through the `AccountDirectory` trait.

mod directory;

pub use directory::KvAccountDirectory;

use crate::error::AppResult;
use crate::store::codec::{CodecError, Packer, Unpacker};
use crate::store::{tables, Record};
use async_trait::async_trait;
use redb::TableDefinition;
use serde::{Deserialize, Serialize};

/// A family member as seen by the pipelines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub family_id: u64,
    pub name: String,
}

impl Record for User {
    const BUCKET: TableDefinition<'static, u64, &'static [u8]> = tables::USERS;

    fn id(&self) -> u64 {
        self.id
    }

    fn pack(&self) -> Vec<u8> {
        let mut p = Packer::new(1);
        p.u64(self.id).u64(self.family_id).str(&self.name);
        p.finish()
    }

    fn unpack(buf: &[u8]) -> Result<Self, CodecError> {
        let (mut u, _) = Unpacker::new("user", buf, &[1])?;
        Ok(Self {
            id: u.u64()?,
            family_id: u.u64()?,
            name: u.str()?,
        })
    }
}

/// Resolves sessions and family membership
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// User owning a session token, if the session exists
    async fn session_user(&self, token: &str) -> AppResult<Option<User>>;

    /// Ids of every user in the family
    async fn family_members(&self, family_id: u64) -> AppResult<Vec<u64>>;
}
