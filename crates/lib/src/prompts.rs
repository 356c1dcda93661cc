//! Library of saved system prompts.
//!
//! Prompts are only kept when they have a title. Saving with an id updates that entry;
//! saving without one creates a new entry.

use serde::{Deserialize, Serialize};

use crate::store::{self, KeyValueStore, StoreError, KEY_PROMPTS};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedPrompt {
    pub id: String,
    pub title: String,
    pub content: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptLibrary {
    prompts: Vec<SavedPrompt>,
}

impl PromptLibrary {
    pub fn load(store: &dyn KeyValueStore) -> Self {
        Self {
            prompts: store::load(store, KEY_PROMPTS).unwrap_or_default(),
        }
    }

    pub fn save_to(&self, store: &dyn KeyValueStore) -> Result<(), StoreError> {
        store::save(store, KEY_PROMPTS, &self.prompts)
    }

    pub fn all(&self) -> &[SavedPrompt] {
        &self.prompts
    }

    pub fn get(&self, id: &str) -> Option<&SavedPrompt> {
        self.prompts.iter().find(|p| p.id == id)
    }

    /// The saved prompt whose content equals the given instruction, if any.
    pub fn find_by_content(&self, content: &str) -> Option<&SavedPrompt> {
        self.prompts.iter().find(|p| p.content == content)
    }

    /// Create or update a prompt. Blank titles are not saved; returns the stored prompt's id.
    pub fn save(&mut self, id: Option<&str>, title: &str, content: &str) -> Option<String> {
        let title = title.trim();
        if title.is_empty() {
            return None;
        }
        if let Some(existing) = id.and_then(|id| self.prompts.iter_mut().find(|p| p.id == id)) {
            existing.title = title.to_string();
            existing.content = content.to_string();
            return Some(existing.id.clone());
        }
        let prompt = SavedPrompt {
            id: format!("prompt-{}", uuid::Uuid::new_v4()),
            title: title.to_string(),
            content: content.to_string(),
            created_at: crate::session::now_millis(),
        };
        let id = prompt.id.clone();
        self.prompts.insert(0, prompt);
        Some(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<SavedPrompt> {
        let idx = self.prompts.iter().position(|p| p.id == id)?;
        Some(self.prompts.remove(idx))
    }
}
