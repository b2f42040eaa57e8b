/// KV-backed account directory
use super::{AccountDirectory, User};
use crate::error::AppResult;
use crate::store::{tables, Store, Window};
use async_trait::async_trait;

/// Account directory over the `users` bucket and `sessions` lookup
#[derive(Clone)]
pub struct KvAccountDirectory {
    store: Store,
}

impl KvAccountDirectory {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Insert or replace a user and move it to its family
    pub async fn put_user(&self, user: User) -> AppResult<()> {
        self.store
            .update_blocking(move |tx| {
                tx.put(&user)?;
                tx.set_term(tables::USERS_BY_FAMILY, user.id, user.family_id)
            })
            .await
    }

    /// Bind a session token to a user
    pub async fn put_session(&self, token: &str, user_id: u64) -> AppResult<()> {
        let token = token.to_string();
        self.store
            .update_blocking(move |tx| tx.set_lookup(tables::SESSIONS, &token, user_id))
            .await
    }

    pub async fn remove_session(&self, token: &str) -> AppResult<bool> {
        let token = token.to_string();
        self.store
            .update_blocking(move |tx| tx.remove_lookup(tables::SESSIONS, &token))
            .await
    }
}

#[async_trait]
impl AccountDirectory for KvAccountDirectory {
    async fn session_user(&self, token: &str) -> AppResult<Option<User>> {
        let token = token.to_string();
        self.store
            .view_blocking(move |tx| match tx.lookup(tables::SESSIONS, &token)? {
                Some(user_id) => tx.get::<User>(user_id),
                None => Ok(None),
            })
            .await
    }

    async fn family_members(&self, family_id: u64) -> AppResult<Vec<u64>> {
        self.store
            .view_blocking(move |tx| tx.targets(tables::USERS_BY_FAMILY, family_id, Window::all()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;

    fn user(id: u64, family_id: u64, name: &str) -> User {
        User {
            id,
            family_id,
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_session_resolves_user() {
        let (_dir, store) = test_store();
        let directory = KvAccountDirectory::new(store);

        directory.put_user(user(10, 7, "Ada")).await.unwrap();
        directory.put_session("tok-10", 10).await.unwrap();

        let found = directory.session_user("tok-10").await.unwrap().unwrap();
        assert_eq!(found.name, "Ada");
        assert!(directory.session_user("missing").await.unwrap().is_none());

        assert!(directory.remove_session("tok-10").await.unwrap());
        assert!(directory.session_user("tok-10").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_family_members_follow_moves() {
        let (_dir, store) = test_store();
        let directory = KvAccountDirectory::new(store);

        for id in [10, 11, 12] {
            directory.put_user(user(id, 7, "member")).await.unwrap();
        }
        directory.put_user(user(12, 8, "moved")).await.unwrap();

        assert_eq!(directory.family_members(7).await.unwrap(), vec![10, 11]);
        assert_eq!(directory.family_members(8).await.unwrap(), vec![12]);
    }
}
