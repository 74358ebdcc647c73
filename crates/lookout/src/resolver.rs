use models::TemplateSpec;
use uuid::Uuid;

/// Read-only seam over the (external) template compilation pipeline.
/// Returns, per template id, its derived target alert type, UI
/// classification, and variable schema.
#[async_trait::async_trait]
pub trait TemplateResolver: Send + Sync {
    /// Resolve a template to its spec, or None if the id is unknown.
    async fn resolve(&self, id: Uuid) -> anyhow::Result<Option<TemplateSpec>>;
}
