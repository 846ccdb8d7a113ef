use async_trait::async_trait;
use converge::{CallContext, CollaboratorError, Config, ResourceCollaborator};
use serde_json::{Value, json};

/// Resource that provisions nothing
///
/// Its state is the resolved configuration plus a stable `id`, so other nodes
/// can reference any configured attribute.
pub struct NullResource;

impl NullResource {
    fn blob(ctx: &CallContext, config: &Config, id: Option<&Value>) -> Value {
        let mut blob = json!({ "id": id.cloned().unwrap_or_else(|| Value::String(new_id(ctx, config))) });
        if let Value::Object(fields) = &mut blob {
            for (k, v) in config {
                if k != "id" {
                    fields.insert(k.clone(), v.clone());
                }
            }
        }
        blob
    }
}

fn new_id(ctx: &CallContext, config: &Config) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(ctx.key.as_str().as_bytes());
    hasher.update(&serde_json::to_vec(config).unwrap_or_default());
    format!("{}-{}", ctx.resource_type, &hasher.finalize().to_hex()[..12])
}

#[async_trait]
impl ResourceCollaborator for NullResource {
    async fn create(&self, ctx: &CallContext, config: &Config) -> Result<Value, CollaboratorError> {
        log::debug!("{}: recording {} configuration", ctx.key, ctx.resource_type);
        Ok(Self::blob(ctx, config, None))
    }

    async fn update(&self, ctx: &CallContext, current: &Value, config: &Config) -> Result<Value, CollaboratorError> {
        Ok(Self::blob(ctx, config, current.get("id")))
    }

    async fn destroy(&self, ctx: &CallContext, _current: &Value) -> Result<(), CollaboratorError> {
        log::debug!("{}: nothing to destroy", ctx.key);
        Ok(())
    }
}
