//! Per-conversation configuration overrides.
//!
//! Stored as a JSON object under `conversation_config:{id}` (no TTL). Every
//! field is optional; absent fields fall back to the worker defaults. Updates
//! merge field-wise: a `null` field leaves the prior value intact.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bus::KeyValueStore;
use crate::config::KeysConfig;
use crate::error::{PlatformError, Result};

/// Overridable knobs for one conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConversationConfig {
    /// LLM model name.
    pub llm_model_name: Option<String>,
    /// LLM sampling temperature, 0.0..=2.0.
    pub llm_temperature: Option<f32>,
    /// LLM response token cap, > 0.
    pub llm_max_tokens: Option<u32>,
    /// TTS voice identifier.
    pub tts_voice_id: Option<String>,
    /// VAD aggressiveness level 0..=3 (maps onto the energy threshold).
    pub vad_aggressiveness: Option<u8>,
}

impl ConversationConfig {
    /// Validate field ranges.
    ///
    /// # Errors
    ///
    /// Returns a config error naming the first out-of-range field.
    pub fn validate(&self) -> Result<()> {
        if let Some(t) = self.llm_temperature
            && !(0.0..=2.0).contains(&t)
        {
            return Err(PlatformError::Config(format!(
                "llm_temperature {t} outside [0, 2]"
            )));
        }
        if let Some(m) = self.llm_max_tokens
            && m == 0
        {
            return Err(PlatformError::Config(
                "llm_max_tokens must be positive".to_owned(),
            ));
        }
        if let Some(a) = self.vad_aggressiveness
            && a > 3
        {
            return Err(PlatformError::Config(format!(
                "vad_aggressiveness {a} outside 0..=3"
            )));
        }
        Ok(())
    }

    /// Merge `update` into `self`: set fields win, `None` fields keep the
    /// prior value.
    pub fn merge(&mut self, update: &ConversationConfig) {
        if update.llm_model_name.is_some() {
            self.llm_model_name = update.llm_model_name.clone();
        }
        if update.llm_temperature.is_some() {
            self.llm_temperature = update.llm_temperature;
        }
        if update.llm_max_tokens.is_some() {
            self.llm_max_tokens = update.llm_max_tokens;
        }
        if update.tts_voice_id.is_some() {
            self.tts_voice_id = update.tts_voice_id.clone();
        }
        if update.vad_aggressiveness.is_some() {
            self.vad_aggressiveness = update.vad_aggressiveness;
        }
    }
}

/// Keystore access for conversation configs.
#[derive(Clone)]
pub struct ConversationConfigStore {
    kv: Arc<dyn KeyValueStore>,
    keys: KeysConfig,
}

impl ConversationConfigStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, keys: KeysConfig) -> Self {
        Self { kv, keys }
    }

    /// Load a conversation's overrides; defaults when none are stored or the
    /// blob is undecodable.
    pub async fn load(&self, conversation_id: Uuid) -> Result<ConversationConfig> {
        let key = self.keys.config_key(conversation_id);
        match self.kv.get(&key).await? {
            Some(blob) => match serde_json::from_slice(&blob) {
                Ok(config) => Ok(config),
                Err(e) => {
                    tracing::error!("undecodable config blob for {conversation_id}: {e}");
                    Ok(ConversationConfig::default())
                }
            },
            None => Ok(ConversationConfig::default()),
        }
    }

    /// Merge `update` into the stored config and return the merged view.
    pub async fn merge(
        &self,
        conversation_id: Uuid,
        update: &ConversationConfig,
    ) -> Result<ConversationConfig> {
        update.validate()?;
        let mut merged = self.load(conversation_id).await?;
        merged.merge(update);
        let key = self.keys.config_key(conversation_id);
        self.kv
            .set(&key, Bytes::from(serde_json::to_vec(&merged)?))
            .await?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBroker;

    #[test]
    fn merge_null_leaves_prior_value() {
        let mut base = ConversationConfig {
            llm_model_name: Some("gemma3".to_owned()),
            llm_temperature: Some(0.5),
            ..Default::default()
        };
        base.merge(&ConversationConfig {
            llm_temperature: Some(1.2),
            ..Default::default()
        });
        assert_eq!(base.llm_model_name.as_deref(), Some("gemma3"));
        assert_eq!(base.llm_temperature, Some(1.2));
    }

    #[test]
    fn validation_rejects_out_of_range() {
        assert!(
            ConversationConfig {
                llm_temperature: Some(2.5),
                ..Default::default()
            }
            .validate()
            .is_err()
        );
        assert!(
            ConversationConfig {
                llm_max_tokens: Some(0),
                ..Default::default()
            }
            .validate()
            .is_err()
        );
        assert!(
            ConversationConfig {
                vad_aggressiveness: Some(4),
                ..Default::default()
            }
            .validate()
            .is_err()
        );
        assert!(ConversationConfig::default().validate().is_ok());
    }

    #[tokio::test]
    async fn write_then_read_returns_merged_view() {
        let broker = Arc::new(MemoryBroker::new());
        let store = ConversationConfigStore::new(broker, KeysConfig::default());
        let id = Uuid::new_v4();

        let merged = store
            .merge(
                id,
                &ConversationConfig {
                    llm_model_name: Some("gemma3".to_owned()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(merged.llm_model_name.as_deref(), Some("gemma3"));

        let merged = store
            .merge(
                id,
                &ConversationConfig {
                    tts_voice_id: Some("siwis".to_owned()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(merged.llm_model_name.as_deref(), Some("gemma3"));
        assert_eq!(merged.tts_voice_id.as_deref(), Some("siwis"));

        assert_eq!(store.load(id).await.unwrap(), merged);
    }
}
