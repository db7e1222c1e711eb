use crate::item::EvidenceItem;
use crate::stream::SeekableStream;

use super::{ProcessingContext, ProcessingTask, TaskCapabilities, TaskError, TaskOutcome};

pub const ID: &str = "properties";

/// Per-entry filesystem/container properties. Runs for duplicates too.
pub struct PropertiesTask;

impl ProcessingTask for PropertiesTask {
    fn id(&self) -> &str {
        ID
    }

    fn capabilities(&self) -> TaskCapabilities {
        TaskCapabilities {
            reads_content: false,
            heavy: false,
        }
    }

    fn apply(
        &self,
        item: &EvidenceItem,
        stream: &mut dyn SeekableStream,
        ctx: &mut ProcessingContext,
    ) -> Result<TaskOutcome, TaskError> {
        let descriptor = &item.descriptor;
        ctx.insert("name", descriptor.name.as_str());
        ctx.insert("logical_path", descriptor.logical_path.as_str());
        ctx.insert("backing", descriptor.backing.kind());
        ctx.insert("size", stream.size()?);
        if let Some(ext) = item.extension() {
            ctx.insert("extension", ext);
        }
        if let Some(modified) = descriptor.modified {
            ctx.insert("modified", modified.to_rfc3339());
        }
        Ok(TaskOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::EvidenceStream;
    use crate::tasks::tests::{context, item_named};

    #[test]
    fn records_size_from_the_stream() {
        let item = item_named("Report.PDF", 0);
        let mut stream = EvidenceStream::from_bytes(vec![0u8; 42]);
        let mut ctx = context();
        PropertiesTask
            .apply(&item, &mut stream, &mut ctx)
            .expect("apply");
        assert_eq!(ctx.get("size"), Some(&serde_json::json!(42)));
        assert_eq!(ctx.get("extension"), Some(&serde_json::json!("pdf")));
        assert_eq!(ctx.get("backing"), Some(&serde_json::json!("memory")));
    }
}
