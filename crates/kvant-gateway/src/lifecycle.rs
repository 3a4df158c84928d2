use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use tracing::debug;
use uuid::Uuid;

use kvant_db::{MessageStore, VisibilityChange};
use kvant_types::api::{MessageResponse, ReactionGroup};
use kvant_types::events::ServerEvent;
use kvant_types::models::{ConversationPair, Message, MessageType, RecentChat, RepliedMessage, UserId};

use crate::error::LifecycleError;
use crate::hub::Hub;

pub const DEFAULT_HISTORY_LIMIT: u32 = 100;
pub const MAX_HISTORY_LIMIT: u32 = 200;
pub const RECENT_CHATS_LIMIT: u32 = 50;

const MAX_EMOJI_CHARS: usize = 10;
const UNKNOWN_SENDER: &str = "unknown";

type Result<T> = std::result::Result<T, LifecycleError>;

/// An outgoing message as submitted by a client.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub receiver_id: UserId,
    pub text: String,
    pub reply_to_id: Option<Uuid>,
}

/// Applies message operations against the store and fans the resulting
/// events out through the hub.
///
/// Every operation persists first and notifies only after the write
/// succeeded. Operations that change nothing notify nobody.
#[derive(Clone)]
pub struct MessageEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    store: Arc<dyn MessageStore>,
    hub: Hub,
}

impl MessageEngine {
    pub fn new(store: Arc<dyn MessageStore>, hub: Hub) -> Self {
        Self {
            inner: Arc::new(EngineInner { store, hub }),
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.inner.hub
    }

    pub async fn send_message(&self, actor: &str, req: SendRequest) -> Result<Message> {
        let receiver_id = req.receiver_id.trim().to_string();
        if receiver_id.is_empty() {
            return Err(LifecycleError::Validation("receiver_id is required"));
        }
        let (text, message_type, file_url) = parse_attachment(req.text);
        if file_url.as_deref() == Some("") {
            return Err(LifecycleError::Validation("attachment url is empty"));
        }
        if text.trim().is_empty() && file_url.is_none() {
            return Err(LifecycleError::Validation("message text is empty"));
        }

        let pair = ConversationPair::new(actor, &receiver_id);
        let reply_to_id = req.reply_to_id;
        let sender_id = actor.to_string();
        let (profile, reply_target) = self
            .with_store(move |store| {
                let profile = store.get_user_profile(&sender_id)?;
                let target = match reply_to_id {
                    Some(id) => store.get_message(id)?,
                    None => None,
                };
                Ok((profile, target))
            })
            .await?;

        let replied = match (reply_to_id, reply_target) {
            (None, _) => None,
            (Some(_), Some(target)) if target.pair() == pair => Some(RepliedMessage::from(&target)),
            (Some(_), _) => {
                return Err(LifecycleError::Validation("reply target is not in this conversation"));
            }
        };

        let msg = Message {
            id: Uuid::new_v4(),
            sender_id: actor.to_string(),
            receiver_id,
            text,
            message_type,
            file_url,
            reply_to_id,
            is_read: false,
            read_at: None,
            edited_at: None,
            deleted_at: None,
            deleted_for_sender: false,
            deleted_for_receiver: false,
            pinned_at: None,
            created_at: now(),
        };
        let stored = msg.clone();
        self.with_store(move |store| store.insert_message(&stored)).await?;

        debug!(id = %msg.id, sender = %msg.sender_id, receiver = %msg.receiver_id, "Message sent");

        let (sender_name, sender_avatar_url) = match profile {
            Some(profile) => (profile.username, profile.avatar_url),
            None => (UNKNOWN_SENDER.to_string(), None),
        };
        self.inner.hub.send_to_user(
            &msg.receiver_id,
            &ServerEvent::new_message(&msg, sender_name, sender_avatar_url, replied),
        );
        Ok(msg)
    }

    pub async fn edit_message(&self, actor: &str, id: Uuid, text: String) -> Result<Message> {
        if text.trim().is_empty() {
            return Err(LifecycleError::Validation("message text is empty"));
        }
        let msg = self.load_for(actor, id).await?;
        if msg.sender_id != actor {
            return Err(LifecycleError::Authorization("only the sender can edit a message"));
        }
        if msg.is_deleted() {
            return Err(LifecycleError::Validation("message was deleted"));
        }

        let edited_at = now();
        let new_text = text.clone();
        let changed = self
            .with_store(move |store| store.update_message_text(id, &new_text, edited_at))
            .await?;
        if !changed {
            // Deleted for everyone between the load and the update.
            return Err(LifecycleError::Validation("message was deleted"));
        }

        let updated = Message {
            text,
            edited_at: Some(edited_at),
            ..msg
        };
        self.notify_pair(&updated, &ServerEvent::MessageEdited(updated.clone()));
        Ok(updated)
    }

    /// Returns whether anything changed.
    pub async fn delete_message(&self, actor: &str, id: Uuid, for_everyone: bool) -> Result<bool> {
        let msg = self.load_for(actor, id).await?;

        if for_everyone {
            if msg.sender_id != actor {
                return Err(LifecycleError::Authorization(
                    "only the sender can delete a message for everyone",
                ));
            }
            if msg.is_deleted() {
                return Ok(false);
            }
            let change = VisibilityChange::Everyone { at: now() };
            let changed = self
                .with_store(move |store| store.set_message_visibility(id, change))
                .await?;
            if changed {
                self.notify_pair(
                    &msg,
                    &ServerEvent::MessageDeleted {
                        id,
                        deleted_for_everyone: true,
                        deleted_for: None,
                    },
                );
            }
            return Ok(changed);
        }

        // In a conversation with oneself the actor holds both roles.
        let mut changes = Vec::with_capacity(2);
        if msg.sender_id == actor && !msg.deleted_for_sender {
            changes.push(VisibilityChange::ForSender);
        }
        if msg.receiver_id == actor && !msg.deleted_for_receiver {
            changes.push(VisibilityChange::ForReceiver);
        }
        if changes.is_empty() {
            return Ok(false);
        }

        let changed = self
            .with_store(move |store| {
                let mut changed = false;
                for change in changes {
                    changed |= store.set_message_visibility(id, change)?;
                }
                Ok(changed)
            })
            .await?;
        if changed {
            self.inner.hub.send_to_user(
                actor,
                &ServerEvent::MessageDeleted {
                    id,
                    deleted_for_everyone: false,
                    deleted_for: Some(actor.to_string()),
                },
            );
        }
        Ok(changed)
    }

    /// Returns false if the reaction already existed. Both parties are
    /// notified either way.
    pub async fn add_reaction(&self, actor: &str, id: Uuid, emoji: &str) -> Result<bool> {
        let emoji = validate_emoji(emoji)?;
        let msg = self.load_for(actor, id).await?;

        let (user_id, stored_emoji) = (actor.to_string(), emoji.clone());
        let inserted = self
            .with_store(move |store| store.add_reaction(id, &user_id, &stored_emoji))
            .await?;

        self.notify_pair(
            &msg,
            &ServerEvent::ReactionAdded {
                message_id: id,
                user_id: actor.to_string(),
                emoji,
            },
        );
        Ok(inserted)
    }

    pub async fn remove_reaction(&self, actor: &str, id: Uuid, emoji: &str) -> Result<bool> {
        let emoji = validate_emoji(emoji)?;
        let msg = self.load_for(actor, id).await?;

        let (user_id, stored_emoji) = (actor.to_string(), emoji.clone());
        let removed = self
            .with_store(move |store| store.remove_reaction(id, &user_id, &stored_emoji))
            .await?;

        self.notify_pair(
            &msg,
            &ServerEvent::ReactionRemoved {
                message_id: id,
                user_id: actor.to_string(),
                emoji,
            },
        );
        Ok(removed)
    }

    /// Pins `id` and unpins whatever was pinned in the conversation before.
    pub async fn pin_message(&self, actor: &str, id: Uuid) -> Result<DateTime<Utc>> {
        let msg = self.load_for(actor, id).await?;
        if msg.is_deleted() {
            return Err(LifecycleError::Validation("message was deleted"));
        }

        let pinned_at = now();
        let pair = msg.pair();
        let pinned = self
            .with_store(move |store| store.set_pinned(&pair, id, pinned_at))
            .await?;
        // The message was deleted for everyone after it was loaded.
        if !pinned {
            return Err(LifecycleError::Validation("message was deleted"));
        }

        self.notify_pair(
            &msg,
            &ServerEvent::MessagePinned {
                message_id: id,
                pinned_at,
                pinner_id: actor.to_string(),
            },
        );
        Ok(pinned_at)
    }

    pub async fn unpin_message(&self, actor: &str, id: Uuid) -> Result<bool> {
        let msg = self.load_for(actor, id).await?;
        let cleared = self.with_store(move |store| store.clear_pinned(id)).await?;
        if cleared {
            self.notify_pair(&msg, &ServerEvent::MessageUnpinned { message_id: id });
        }
        Ok(cleared)
    }

    /// Marks everything `counterpart` sent to `actor` as read. Returns the
    /// number of messages that were unread.
    pub async fn mark_read(&self, actor: &str, counterpart: &str) -> Result<usize> {
        let counterpart = counterpart.trim();
        if counterpart.is_empty() {
            return Err(LifecycleError::Validation("sender_id is required"));
        }

        let read_at = now();
        let (from, to) = (counterpart.to_string(), actor.to_string());
        let updated = self
            .with_store(move |store| store.mark_messages_read(&from, &to, read_at))
            .await?;

        if updated > 0 {
            self.inner.hub.send_to_user(
                counterpart,
                &ServerEvent::MessagesRead {
                    reader_id: actor.to_string(),
                    sender_id: counterpart.to_string(),
                    read_at,
                },
            );
        }
        Ok(updated)
    }

    pub fn typing(&self, actor: &str, receiver_id: &str, started: bool) -> Result<()> {
        let receiver_id = receiver_id.trim();
        if receiver_id.is_empty() {
            return Err(LifecycleError::Validation("receiver_id is required"));
        }
        if receiver_id == actor {
            return Ok(());
        }

        let user_id = actor.to_string();
        let event = if started {
            ServerEvent::TypingStart { user_id }
        } else {
            ServerEvent::TypingStop { user_id }
        };
        self.inner.hub.send_to_user(receiver_id, &event);
        Ok(())
    }

    /// The latest page of the conversation as `actor` sees it, oldest first.
    pub async fn conversation(
        &self,
        actor: &str,
        counterpart: &str,
        limit: Option<u32>,
    ) -> Result<Vec<MessageResponse>> {
        let counterpart = counterpart.trim();
        if counterpart.is_empty() {
            return Err(LifecycleError::Validation("user id is required"));
        }
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT);

        let pair = ConversationPair::new(actor, counterpart);
        let (viewer, other) = (actor.to_string(), counterpart.to_string());
        let (messages, reactions, profiles) = self
            .with_store(move |store| {
                let messages: Vec<Message> = store
                    .list_messages(&pair, &viewer, limit)?
                    .into_iter()
                    .filter(|msg| msg.visible_to(&viewer))
                    .collect();
                let ids: Vec<Uuid> = messages.iter().map(|msg| msg.id).collect();
                let reactions = store.list_reactions(&ids)?;
                let profiles = [store.get_user_profile(&viewer)?, store.get_user_profile(&other)?];
                Ok((messages, reactions, profiles))
            })
            .await?;

        let mut grouped: HashMap<Uuid, Vec<ReactionGroup>> = HashMap::new();
        for reaction in reactions {
            let groups = grouped.entry(reaction.message_id).or_default();
            match groups.iter_mut().find(|g| g.emoji == reaction.emoji) {
                Some(group) => {
                    group.count += 1;
                    group.user_ids.push(reaction.user_id);
                }
                None => groups.push(ReactionGroup {
                    emoji: reaction.emoji,
                    count: 1,
                    user_ids: vec![reaction.user_id],
                }),
            }
        }

        // Replies only resolve against the page itself.
        let summaries: HashMap<Uuid, RepliedMessage> = messages
            .iter()
            .map(|msg| (msg.id, RepliedMessage::from(msg)))
            .collect();

        let responses = messages
            .into_iter()
            .map(|message| {
                let profile = profiles.iter().flatten().find(|p| p.id == message.sender_id);
                let (sender_name, sender_avatar_url) = match profile {
                    Some(p) => (p.username.clone(), p.avatar_url.clone()),
                    None => (UNKNOWN_SENDER.to_string(), None),
                };
                MessageResponse {
                    sender_name,
                    sender_avatar_url,
                    replied_message: message.reply_to_id.and_then(|rid| summaries.get(&rid).cloned()),
                    reactions: grouped.remove(&message.id).unwrap_or_default(),
                    message,
                }
            })
            .collect();
        Ok(responses)
    }

    pub async fn recent_chats(&self, actor: &str) -> Result<Vec<RecentChat>> {
        let user_id = actor.to_string();
        self.with_store(move |store| store.recent_chats(&user_id, RECENT_CHATS_LIMIT))
            .await
    }

    async fn load_for(&self, actor: &str, id: Uuid) -> Result<Message> {
        let msg = self
            .with_store(move |store| store.get_message(id))
            .await?
            .ok_or(LifecycleError::NotFound(id))?;
        if !msg.is_party(actor) {
            return Err(LifecycleError::Authorization("not a participant of this conversation"));
        }
        Ok(msg)
    }

    fn notify_pair(&self, msg: &Message, event: &ServerEvent) {
        let hub = &self.inner.hub;
        hub.send_to_user(&msg.sender_id, event);
        if msg.receiver_id != msg.sender_id {
            hub.send_to_user(&msg.receiver_id, event);
        }
    }

    /// Runs a blocking store call off the async runtime.
    async fn with_store<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn MessageStore) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.inner.store);
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| anyhow::anyhow!("storage task failed: {}", e))?
            .map_err(LifecycleError::Storage)
    }
}

/// Millisecond precision, matching what the store keeps.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// `[image]<url>` and `[file]<url>` texts carry an attachment.
fn parse_attachment(text: String) -> (String, MessageType, Option<String>) {
    if let Some(url) = text.strip_prefix("[image]") {
        return (String::new(), MessageType::Image, Some(url.trim().to_string()));
    }
    if let Some(url) = text.strip_prefix("[file]") {
        let url = url.trim().to_string();
        return (text, MessageType::File, Some(url));
    }
    (text, MessageType::Text, None)
}

fn validate_emoji(emoji: &str) -> Result<String> {
    let emoji = emoji.trim();
    if emoji.is_empty() {
        return Err(LifecycleError::Validation("emoji is required"));
    }
    if emoji.chars().count() > MAX_EMOJI_CHARS {
        return Err(LifecycleError::Validation("emoji is too long"));
    }
    Ok(emoji.to_string())
}
