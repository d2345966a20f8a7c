//! Model registry: which configured provider serves which public model name,
//! and on which endpoints it is exposed.

pub mod endpoint;
mod kind;
mod snapshot;

pub use kind::{KindProfile, ProviderKind};
pub use snapshot::{
    model_key, ConfigRegistry, RegistrySnapshot, ReloadSummary, ResolvedProvider, UpstreamTarget,
};
