//! Registered remote agent configurations (Dify variant).
//!
//! A session references one agent by id. The registry supports create (optionally copying the
//! currently selected agent as a template), edit, delete and validation of required fields.

use serde::{Deserialize, Serialize};

use crate::store::{self, KeyValueStore, StoreError, KEY_AGENTS};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub access_key_id: String,
    pub access_key_secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub id: String,
    pub display_name: String,
    pub credentials: Credentials,
    pub agent_id: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("agent config is missing required field: {0}")]
    MissingField(&'static str),
    #[error("agent config not found: {0}")]
    NotFound(String),
}

impl AgentConfig {
    pub fn new(
        display_name: impl Into<String>,
        access_key_id: impl Into<String>,
        access_key_secret: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("agent-{}", uuid::Uuid::new_v4()),
            display_name: display_name.into(),
            credentials: Credentials {
                access_key_id: access_key_id.into(),
                access_key_secret: access_key_secret.into(),
            },
            agent_id: agent_id.into(),
        }
    }

    /// Name, access key id and agent id are required; the secret may be blank.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.display_name.trim().is_empty() {
            return Err(AgentError::MissingField("displayName"));
        }
        if self.credentials.access_key_id.trim().is_empty() {
            return Err(AgentError::MissingField("accessKeyId"));
        }
        if self.agent_id.trim().is_empty() {
            return Err(AgentError::MissingField("agentId"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentRegistry {
    agents: Vec<AgentConfig>,
}

impl AgentRegistry {
    pub fn new(agents: Vec<AgentConfig>) -> Self {
        Self { agents }
    }

    pub fn load(store: &dyn KeyValueStore) -> Self {
        Self::new(store::load(store, KEY_AGENTS).unwrap_or_default())
    }

    pub fn save(&self, store: &dyn KeyValueStore) -> Result<(), StoreError> {
        store::save(store, KEY_AGENTS, &self.agents)
    }

    pub fn all(&self) -> &[AgentConfig] {
        &self.agents
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.id == id)
    }

    /// First registered agent, used as the default for new sessions.
    pub fn first(&self) -> Option<&AgentConfig> {
        self.agents.first()
    }

    /// Draft for a new agent: a copy of `template_id` (or the last agent) under a new id,
    /// or a blank config when nothing is registered.
    pub fn draft_from(&self, template_id: Option<&str>) -> AgentConfig {
        let template = template_id
            .and_then(|id| self.get(id))
            .or_else(|| self.agents.last());
        match template {
            Some(t) => {
                let mut draft =
                    AgentConfig::new(format!("{} (副本)", t.display_name), "", "", &t.agent_id);
                draft.credentials = t.credentials.clone();
                draft
            }
            None => AgentConfig::new("新智能体配置", "", "", ""),
        }
    }

    /// Insert or replace by id after validation.
    pub fn upsert(&mut self, agent: AgentConfig) -> Result<(), AgentError> {
        agent.validate()?;
        match self.agents.iter_mut().find(|a| a.id == agent.id) {
            Some(existing) => *existing = agent,
            None => self.agents.push(agent),
        }
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Result<AgentConfig, AgentError> {
        let idx = self
            .agents
            .iter()
            .position(|a| a.id == id)
            .ok_or_else(|| AgentError::NotFound(id.to_string()))?;
        Ok(self.agents.remove(idx))
    }
}
