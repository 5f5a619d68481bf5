mod error_map;
mod facade;
mod provider;
mod providers_impl;
mod registry;

pub use error_map::{classify_http_error, classify_transport_error};
pub use facade::{estimate_tokens, generate_stream, GenerateChunk, DEFAULT_CALL_DEADLINE};
pub use provider::{
    AppConfig, ChatMessage, GenerateOptions, Provider, ProviderConfig, ProviderInfo,
    ProviderModelInfo, StreamChunk, TokenUsage,
};
pub use providers_impl::{build_providers, env_configured_providers, KNOWN_PROVIDER_IDS};
pub use registry::ProviderRegistry;
