use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use resume_core_orchestrator::Orchestrator;
use resume_core_types::{CoreError, ErrorKind};

mod http;

pub use http::serve;

/// Consumes `export_artifact` produced by Agent 5 and returns an opaque
/// DOCX binary (§6 "DOCX Renderer"). Out of scope beyond the call
/// signature: production wiring plugs in a sandboxed renderer.
#[async_trait]
pub trait DocxRenderer: Send + Sync {
    async fn render(&self, export_artifact: &serde_json::Value) -> Result<Vec<u8>, CoreError>;
}

pub struct UnconfiguredDocxRenderer;

#[async_trait]
impl DocxRenderer for UnconfiguredDocxRenderer {
    async fn render(&self, _export_artifact: &serde_json::Value) -> Result<Vec<u8>, CoreError> {
        Err(CoreError::new(
            ErrorKind::RendererSyntax,
            "no DOCX renderer is configured for this deployment",
        ))
    }
}

/// Thin glue state: C8 is a router over C3/C4/C7, nothing here owns data of
/// its own.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub renderer: Arc<dyn DocxRenderer>,
    pub max_manual_retries: u32,
}

impl Deref for AppState {
    type Target = Orchestrator;

    fn deref(&self) -> &Self::Target {
        &self.orchestrator
    }
}
