/// Message ingress and deletion
use super::{validate_content, ChatMessage, Frame, FrameKind, Hub};
use crate::account::{AccountDirectory, User};
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::push::{PushJob, PushQueue};
use crate::store::{codec, tables, Store, Window};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Persists chat messages, fans them out and hands offline members to push
#[derive(Clone)]
pub struct ChatService {
    store: Store,
    hub: Hub,
    accounts: Arc<dyn AccountDirectory>,
    push: PushQueue,
}

impl ChatService {
    pub fn new(
        store: Store,
        hub: Hub,
        accounts: Arc<dyn AccountDirectory>,
        push: PushQueue,
    ) -> Self {
        Self {
            store,
            hub,
            accounts,
            push,
        }
    }

    /// Persist a message from `author` and deliver it
    pub async fn submit_message(
        &self,
        author: &User,
        content: &str,
        client_id: Option<String>,
    ) -> AppResult<ChatMessage> {
        let content = validate_content(content)?;

        let family_id = author.family_id;
        let user_id = author.id;
        let user_name = author.name.clone();
        let client_id = client_id.unwrap_or_default();

        let message = self
            .store
            .update_blocking(move |tx| {
                let message = ChatMessage {
                    id: tx.next_id::<ChatMessage>()?,
                    family_id,
                    user_id,
                    user_name,
                    content,
                    created_at: codec::now(),
                    client_id,
                };
                tx.put(&message)?;
                tx.set_term(tables::CHAT_MESSAGES_BY_FAMILY, message.id, family_id)?;
                tx.set_term(tables::CHAT_MESSAGES_BY_USER, message.id, user_id)?;
                Ok(message)
            })
            .await?;

        metrics::record_chat_message("created");
        debug!(message_id = message.id, family_id, user_id, "Chat message stored");

        self.hub
            .broadcast(
                family_id,
                &Frame::new(FrameKind::NewMessage {
                    message: message.clone(),
                }),
            )
            .await;

        self.notify_offline(&message).await;

        Ok(message)
    }

    /// Enqueue a push job for family members without a live connection.
    /// Failures are logged; the message is already committed.
    async fn notify_offline(&self, message: &ChatMessage) {
        if !self.push.is_enabled() {
            return;
        }

        let members = match self.accounts.family_members(message.family_id).await {
            Ok(members) => members,
            Err(e) => {
                warn!(message_id = message.id, error = %e, "Failed to resolve family members");
                return;
            }
        };

        let online = self.hub.online_users(message.family_id);
        let recipients = offline_recipients(&members, &online, message.user_id);
        if recipients.is_empty() {
            return;
        }

        let job = PushJob {
            message_id: message.id,
            family_id: message.family_id,
            sender_id: message.user_id,
            sender_name: message.user_name.clone(),
            content: message.content.clone(),
            recipient_user_ids: recipients,
        };

        if let Err(e) = self.push.enqueue(job) {
            warn!(message_id = message.id, error = %e, "Push job not enqueued");
        }
    }

    /// Delete a message authored by `user`
    pub async fn delete_message(&self, user: &User, message_id: u64) -> AppResult<()> {
        let family_id = user.family_id;
        let user_id = user.id;

        self.store
            .update_blocking(move |tx| {
                let message = tx
                    .get::<ChatMessage>(message_id)?
                    .filter(|m| m.family_id == family_id)
                    .ok_or_else(|| AppError::NotFound("Message not found".to_string()))?;

                if message.user_id != user_id {
                    return Err(AppError::Forbidden(
                        "Only the author can delete a message".to_string(),
                    ));
                }

                tx.delete::<ChatMessage>(message_id)?;
                tx.clear_target(tables::CHAT_MESSAGES_BY_FAMILY, message_id)?;
                tx.clear_target(tables::CHAT_MESSAGES_BY_USER, message_id)
            })
            .await?;

        metrics::record_chat_message("deleted");
        info!(message_id, family_id, user_id, "Chat message deleted");

        self.hub
            .broadcast(
                family_id,
                &Frame::new(FrameKind::DeleteMessage {
                    message_id,
                    user_id,
                }),
            )
            .await;

        Ok(())
    }

    /// Newest-first page of the user's family messages
    pub async fn list_messages(
        &self,
        user: &User,
        limit: usize,
        offset: usize,
    ) -> AppResult<Vec<ChatMessage>> {
        let family_id = user.family_id;
        self.store
            .view_blocking(move |tx| {
                tx.records_for::<ChatMessage>(
                    tables::CHAT_MESSAGES_BY_FAMILY,
                    family_id,
                    Window::newest(limit, offset),
                )
            })
            .await
    }
}

/// Family members minus online users minus the author, in member order
pub fn offline_recipients(members: &[u64], online: &HashSet<u64>, author_id: u64) -> Vec<u64> {
    let mut seen = HashSet::new();
    members
        .iter()
        .copied()
        .filter(|id| *id != author_id && !online.contains(id) && seen.insert(*id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::KvAccountDirectory;
    use crate::jobs::queue::JobQueue;

    fn user(id: u64) -> User {
        User {
            id,
            family_id: 7,
            name: format!("user-{}", id),
        }
    }

    async fn setup() -> (tempfile::TempDir, Store, Hub, KvAccountDirectory) {
        let (dir, store) = crate::store::test_store();
        let accounts = KvAccountDirectory::new(store.clone());
        for id in [10, 11, 12] {
            accounts.put_user(user(id)).await.unwrap();
        }
        (dir, store, Hub::start(), accounts)
    }

    #[test]
    fn test_offline_recipients() {
        let online: HashSet<u64> = [10, 12].into_iter().collect();
        assert_eq!(offline_recipients(&[10, 11, 12, 13], &online, 10), vec![11, 13]);
        assert_eq!(offline_recipients(&[10, 11, 11], &HashSet::new(), 10), vec![11]);
        assert!(offline_recipients(&[10], &HashSet::new(), 10).is_empty());
    }

    #[tokio::test]
    async fn test_submit_persists_broadcasts_and_enqueues_push() {
        let (_dir, store, hub, accounts) = setup().await;
        let (queue, mut push_rx) = JobQueue::bounded("push", 8);
        let service = ChatService::new(
            store.clone(),
            hub.clone(),
            Arc::new(accounts),
            PushQueue::from_queue(queue),
        );

        let (client, mut channels) = hub.connect(&user(10));
        hub.register(client).await;
        // Drain our own presence frame
        let _ = channels.outbound.recv().await.unwrap();

        let message = service
            .submit_message(&user(10), "  hello family  ", Some("c-1".into()))
            .await
            .unwrap();
        assert_eq!(message.content, "hello family");
        assert_eq!(message.client_id, "c-1");

        let stored: ChatMessage = store.view(|tx| tx.get(message.id)).unwrap().unwrap();
        assert_eq!(stored, message);

        let frame = channels.outbound.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "new_message");
        assert_eq!(value["payload"]["message"]["content"], "hello family");
        assert_eq!(value["payload"]["message"]["user_id"], 10);

        let job = push_rx.next().await.unwrap();
        let mut recipients = job.recipient_user_ids.clone();
        recipients.sort();
        assert_eq!(recipients, vec![11, 12]);
        assert_eq!(job.sender_id, 10);
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_content() {
        let (_dir, store, hub, accounts) = setup().await;
        let service = ChatService::new(store, hub, Arc::new(accounts), PushQueue::disabled());

        assert!(matches!(
            service.submit_message(&user(10), "   ", None).await,
            Err(AppError::Validation(_))
        ));
        let long = "x".repeat(1001);
        assert!(matches!(
            service.submit_message(&user(10), &long, None).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_full_push_queue_does_not_fail_submit() {
        let (_dir, store, hub, accounts) = setup().await;
        let (queue, _push_rx) = JobQueue::bounded("push", 1);
        let service = ChatService::new(store, hub, Arc::new(accounts), PushQueue::from_queue(queue));

        service.submit_message(&user(10), "one", None).await.unwrap();
        service.submit_message(&user(10), "two", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_requires_author() {
        let (_dir, store, hub, accounts) = setup().await;
        let service = ChatService::new(store.clone(), hub.clone(), Arc::new(accounts), PushQueue::disabled());

        let message = service.submit_message(&user(10), "mine", None).await.unwrap();

        let (client, mut channels) = hub.connect(&user(12));
        hub.register(client).await;
        let _ = channels.outbound.recv().await.unwrap();

        let result = service.delete_message(&user(11), message.id).await;
        assert!(matches!(result, Err(AppError::Forbidden(_))));
        assert!(store.view(|tx| tx.get::<ChatMessage>(message.id)).unwrap().is_some());
        assert!(channels.outbound.try_recv().is_err());

        service.delete_message(&user(10), message.id).await.unwrap();
        assert!(store.view(|tx| tx.get::<ChatMessage>(message.id)).unwrap().is_none());
        let frame = channels.outbound.recv().await.unwrap();
        assert!(frame.contains("delete_message"));
        assert!(service.list_messages(&user(10), 50, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_other_family_is_not_found() {
        let (_dir, store, hub, accounts) = setup().await;
        let service = ChatService::new(store, hub, Arc::new(accounts), PushQueue::disabled());

        let message = service.submit_message(&user(10), "hi", None).await.unwrap();
        let stranger = User {
            id: 10,
            family_id: 8,
            name: "other".into(),
        };
        assert!(matches!(
            service.delete_message(&stranger, message.id).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            service.delete_message(&user(10), 999).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_is_newest_first() {
        let (_dir, store, hub, accounts) = setup().await;
        let service = ChatService::new(store, hub, Arc::new(accounts), PushQueue::disabled());

        for text in ["first", "second", "third"] {
            service.submit_message(&user(10), text, None).await.unwrap();
        }

        let page = service.list_messages(&user(11), 2, 0).await.unwrap();
        let contents: Vec<_> = page.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["third", "second"]);

        let rest = service.list_messages(&user(11), 2, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].content, "first");
    }
}
