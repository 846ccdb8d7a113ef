use async_trait::async_trait;
use converge::{CallContext, CollaboratorError, Config, ResourceCollaborator};
use serde_json::{Value, json};
use std::io::ErrorKind;
use std::path::PathBuf;

use super::{io_error, required_str};
use crate::config::expand_path;

/// A file on the local disk: `path` and `content`
///
/// State records the path and a content hash; refresh reports drift when the
/// file was edited or removed outside terrace.
pub struct LocalFile;

fn content_hash(content: &[u8]) -> String {
    blake3::hash(content).to_hex().to_string()
}

fn recorded_path(blob: &Value) -> Option<PathBuf> {
    blob.get("path").and_then(Value::as_str).map(PathBuf::from)
}

impl LocalFile {
    async fn write(ctx: &CallContext, config: &Config) -> Result<Value, CollaboratorError> {
        let path = expand_path(required_str(config, "path")?);
        let content = required_str(config, "content")?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(e, format!("Could not create {}", parent.display())))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| io_error(e, format!("Could not write {}", path.display())))?;
        log::info!("{}: wrote {}", ctx.key, path.display());

        let hash = content_hash(content.as_bytes());
        Ok(json!({
            "id": hash,
            "path": path.to_string_lossy(),
            "content_hash": hash,
        }))
    }
}

#[async_trait]
impl ResourceCollaborator for LocalFile {
    async fn create(&self, ctx: &CallContext, config: &Config) -> Result<Value, CollaboratorError> {
        Self::write(ctx, config).await
    }

    async fn update(&self, ctx: &CallContext, current: &Value, config: &Config) -> Result<Value, CollaboratorError> {
        let blob = Self::write(ctx, config).await?;
        if let Some(old) = recorded_path(current)
            && Some(&old) != recorded_path(&blob).as_ref()
        {
            self.destroy(ctx, current).await?;
        }
        Ok(blob)
    }

    async fn destroy(&self, ctx: &CallContext, current: &Value) -> Result<(), CollaboratorError> {
        let Some(path) = recorded_path(current) else {
            return Ok(());
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                log::info!("{}: removed {}", ctx.key, path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(e, format!("Could not remove {}", path.display()))),
        }
    }

    async fn read(&self, _ctx: &CallContext, current: &Value) -> Result<Option<Value>, CollaboratorError> {
        let Some(path) = recorded_path(current) else {
            return Ok(None);
        };
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(e, format!("Could not read {}", path.display()))),
        };

        let mut observed = current.clone();
        if let Value::Object(fields) = &mut observed {
            fields.insert("content_hash".to_string(), json!(content_hash(&content)));
        }
        Ok(Some(observed))
    }
}
