//! Zenava core library: chat sessions, the turn state machine, backend clients and persistence,
//! shared by the CLI and any other front-end.

pub mod agents;
pub mod chat;
pub mod config;
pub mod device;
pub mod llm;
pub mod prompts;
pub mod session;
pub mod store;
pub mod title;
