pub mod agents;
pub mod alerts;
pub mod broker;
pub mod config;
pub mod db;
pub mod embeddings;
pub mod error;
pub mod events;
pub mod matching;
pub mod notify;
pub mod observability;
pub mod packs;
pub mod playbooks;
pub mod publisher;
pub mod routes;
pub mod safety;
pub mod supervisor;
pub mod tools;
pub mod workers;

pub use events::{ActorType, CanonicalEvent};
