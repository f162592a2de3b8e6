//! # Conversation Store
//!
//! Conversations with user/assistant message history. Every read and write
//! is ownership-checked against the authenticated user. The assistant reply
//! comes from a pluggable generator seam; the built-in responder mirrors the
//! keyword behaviour of the upstream assistant.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ServiceError;
use crate::types::{Conversation, ConversationStatus, Message, MessageRole};

/// Synthesises the assistant's reply to a user message
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(&self, user_message: &str, history: &[Message]) -> Result<String, ServiceError>;
}

/// Keyword responder standing in for the AI executor
pub struct KeywordReplyGenerator;

#[async_trait]
impl ReplyGenerator for KeywordReplyGenerator {
    async fn generate(&self, user_message: &str, _history: &[Message]) -> Result<String, ServiceError> {
        let message = user_message.to_lowercase();

        let reply = if message.contains("борщ") {
            "Борщ - это традиционное украинское блюдо, которое готовится из свеклы, капусты, картофеля, моркови и говядины. Хотите, я расскажу подробный рецепт?"
        } else if message.contains("отель") || message.contains("путешествие") {
            "Я могу помочь вам найти подходящий отель или спланировать путешествие. Расскажите подробнее о ваших предпочтениях: бюджет, дата, направление?"
        } else if message.contains("рецепт") {
            "Я знаю множество рецептов! От простых салатов до сложных десертов. Какой рецепт вас интересует?"
        } else if message.contains("купить") || message.contains("магазин") {
            "Я могу помочь найти товары и услуги. Что именно вы ищете? Укажите категорию или конкретный товар."
        } else {
            "Я понимаю ваш запрос. Расскажите подробнее, и я постараюсь помочь вам найти нужную информацию или выполнить задачу."
        };

        Ok(reply.to_string())
    }
}

pub struct ConversationService {
    conversations: RwLock<HashMap<String, Conversation>>,
    messages: RwLock<HashMap<String, Vec<Message>>>,
    reply_generator: Arc<dyn ReplyGenerator>,
}

impl ConversationService {
    pub fn new(reply_generator: Arc<dyn ReplyGenerator>) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            messages: RwLock::new(HashMap::new()),
            reply_generator,
        }
    }

    /// Creates a conversation, optionally seeding the first message (which
    /// also produces the first assistant reply)
    pub async fn create_conversation(
        &self,
        user_id: &str,
        title: Option<String>,
        initial_message: Option<String>,
    ) -> Result<(Conversation, Option<Message>), ServiceError> {
        let now = Utc::now().timestamp();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title,
            status: ConversationStatus::Active,
            message_count: 0,
            created_at: now,
            updated_at: now,
            last_message: None,
        };

        info!(
            conversation_id = %conversation.id,
            user_id = %user_id,
            "Conversation created"
        );

        self.conversations
            .write()
            .await
            .insert(conversation.id.clone(), conversation.clone());
        self.messages
            .write()
            .await
            .insert(conversation.id.clone(), Vec::new());

        let mut first_message = None;
        if let Some(content) = initial_message.filter(|c| !c.is_empty()) {
            first_message = Some(self.send_message(&conversation.id, user_id, &content).await?);
        }

        let conversation = self
            .conversations
            .read()
            .await
            .get(&conversation.id)
            .cloned()
            .ok_or_else(|| ServiceError::internal("conversation vanished during creation"))?;

        Ok((conversation, first_message))
    }

    /// Persists the user message, synthesises and persists the assistant
    /// reply, and returns the reply. `message_count` grows by two.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        user_id: &str,
        content: &str,
    ) -> Result<Message, ServiceError> {
        if content.is_empty() {
            return Err(ServiceError::validation_field("content", "message content cannot be empty"));
        }

        self.check_ownership(conversation_id, user_id).await?;

        let user_message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role: MessageRole::User,
            content: content.to_string(),
            timestamp: Utc::now().timestamp(),
            token_count: estimate_token_count(content),
            metadata: None,
        };

        let history = self.history_snapshot(conversation_id).await;
        let reply_content = self.reply_generator.generate(content, &history).await?;

        let assistant_message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role: MessageRole::Assistant,
            token_count: estimate_token_count(&reply_content),
            content: reply_content,
            timestamp: Utc::now().timestamp(),
            metadata: None,
        };

        {
            let mut messages = self.messages.write().await;
            let list = messages.entry(conversation_id.to_string()).or_default();
            list.push(user_message);
            list.push(assistant_message.clone());
        }

        {
            let mut conversations = self.conversations.write().await;
            if let Some(conversation) = conversations.get_mut(conversation_id) {
                conversation.message_count += 2;
                conversation.updated_at = Utc::now().timestamp();
                conversation.last_message = Some(assistant_message.clone());
            } else {
                warn!(conversation_id = %conversation_id, "Conversation missing during message update");
            }
        }

        info!(
            conversation_id = %conversation_id,
            user_id = %user_id,
            message_length = %content.len(),
            "Message sent to conversation"
        );

        Ok(assistant_message)
    }

    pub async fn get_conversation(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Conversation, ServiceError> {
        self.check_ownership(conversation_id, user_id).await?;
        self.conversations
            .read()
            .await
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| ServiceError::not_found("conversation not found"))
    }

    /// Paged message history, oldest first
    pub async fn get_history(
        &self,
        conversation_id: &str,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, ServiceError> {
        self.check_ownership(conversation_id, user_id).await?;
        let messages = self.messages.read().await;
        let list = messages.get(conversation_id).cloned().unwrap_or_default();
        Ok(list.into_iter().skip(offset).take(limit).collect())
    }

    /// Flips the conversation to archived
    pub async fn archive_conversation(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Conversation, ServiceError> {
        self.check_ownership(conversation_id, user_id).await?;

        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| ServiceError::not_found("conversation not found"))?;
        conversation.status = ConversationStatus::Archived;
        conversation.updated_at = Utc::now().timestamp();

        info!(conversation_id = %conversation_id, user_id = %user_id, "Conversation archived");
        Ok(conversation.clone())
    }

    /// Lists the user's conversations, most recently updated first
    pub async fn list_conversations(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
        include_archived: bool,
    ) -> Vec<Conversation> {
        let conversations = self.conversations.read().await;
        let mut list: Vec<Conversation> = conversations
            .values()
            .filter(|c| {
                c.user_id == user_id
                    && (include_archived || c.status == ConversationStatus::Active)
            })
            .cloned()
            .collect();
        list.sort_by_key(|c| std::cmp::Reverse(c.updated_at));
        list.into_iter().skip(offset).take(limit).collect()
    }

    async fn check_ownership(&self, conversation_id: &str, user_id: &str) -> Result<(), ServiceError> {
        let conversations = self.conversations.read().await;
        let conversation = conversations
            .get(conversation_id)
            .ok_or_else(|| ServiceError::not_found("conversation not found"))?;
        if conversation.user_id != user_id {
            return Err(ServiceError::authorization(
                "conversation belongs to a different user",
            ));
        }
        Ok(())
    }

    async fn history_snapshot(&self, conversation_id: &str) -> Vec<Message> {
        let messages = self.messages.read().await;
        let list = messages.get(conversation_id).cloned().unwrap_or_default();
        // Last ten messages give the generator its context
        let skip = list.len().saturating_sub(10);
        list.into_iter().skip(skip).collect()
    }
}

/// Rough token estimate: ~2 chars/token for Cyrillic text, ~4 otherwise
pub fn estimate_token_count(content: &str) -> i32 {
    let divisor = if contains_cyrillic(content) { 2 } else { 4 };
    (content.chars().count() / divisor) as i32
}

fn contains_cyrillic(text: &str) -> bool {
    text.chars().any(|c| ('\u{0400}'..='\u{04FF}').contains(&c))
}
