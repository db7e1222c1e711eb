use anyhow::{Result, bail};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::TaskOptions;
use crate::item::{ContentHash, EvidenceItem};
use crate::stream::SeekableStream;

use super::{
    ProcessingContext, ProcessingTask, TaskCapabilities, TaskError, TaskOutcome, option_strings,
    scan_content,
};

pub const ID: &str = "hash";

/// MD5 and/or SHA-256 over the full content.
///
/// The strongest configured digest becomes the item's content hash, which is
/// what the dedup cache is keyed on.
#[derive(Debug, Clone)]
pub struct HashTask {
    md5: bool,
    sha256: bool,
}

impl Default for HashTask {
    fn default() -> Self {
        Self {
            md5: true,
            sha256: true,
        }
    }
}

impl HashTask {
    pub fn from_options(options: &TaskOptions) -> Result<Self> {
        let Some(algorithms) = option_strings(options, "algorithms")? else {
            return Ok(Self::default());
        };
        let mut task = Self {
            md5: false,
            sha256: false,
        };
        for algorithm in &algorithms {
            match algorithm.to_ascii_lowercase().as_str() {
                "md5" => task.md5 = true,
                "sha256" | "sha-256" => task.sha256 = true,
                other => bail!("unsupported hash algorithm: {other}"),
            }
        }
        if !task.md5 && !task.sha256 {
            bail!("option algorithms must name at least one algorithm");
        }
        Ok(task)
    }
}

impl ProcessingTask for HashTask {
    fn id(&self) -> &str {
        ID
    }

    fn capabilities(&self) -> TaskCapabilities {
        TaskCapabilities {
            reads_content: true,
            heavy: false,
        }
    }

    fn apply(
        &self,
        item: &EvidenceItem,
        stream: &mut dyn SeekableStream,
        ctx: &mut ProcessingContext,
    ) -> Result<TaskOutcome, TaskError> {
        let mut md5 = self.md5.then(md5::Context::new);
        let mut sha256 = self.sha256.then(Sha256::new);
        let hashed = scan_content(stream, ctx, None, |_, block| {
            if let Some(digest) = md5.as_mut() {
                digest.consume(block);
            }
            if let Some(hasher) = sha256.as_mut() {
                hasher.update(block);
            }
            Ok(())
        })?;

        let md5 = md5.map(|c| format!("{:x}", c.compute()));
        let sha256 = sha256.map(|h| hex::encode(h.finalize()));
        if let Some(digest) = &md5 {
            ctx.insert("md5", digest.as_str());
        }
        if let Some(digest) = &sha256 {
            ctx.insert("sha256", digest.as_str());
        }
        ctx.insert("hashed_bytes", hashed);

        if let Some(digest) = sha256.or(md5) {
            debug!("item {} content hash {digest}", item.id());
            ctx.set_content_hash(ContentHash::new(digest));
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
    fn hashes_known_content() {
        let item = item_named("abc.txt", 3);
        let mut stream = EvidenceStream::from_bytes(b"abc".to_vec());
        let mut ctx = context();
        HashTask::default()
            .apply(&item, &mut stream, &mut ctx)
            .expect("hash");
        assert_eq!(
            ctx.get("md5"),
            Some(&serde_json::json!("900150983cd24fb0d6963f7d28e17f72"))
        );
        let sha = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        assert_eq!(ctx.content_hash().map(|h| h.as_str()), Some(sha));
    }

    #[test]
    fn md5_only_keys_on_md5() {
        let mut options = TaskOptions::new();
        options.insert("algorithms".into(), serde_json::json!(["MD5"]));
        let task = HashTask::from_options(&options).expect("options");
        let mut stream = EvidenceStream::from_bytes(Vec::new());
        let mut ctx = context();
        task.apply(&item_named("empty", 0), &mut stream, &mut ctx)
            .expect("hash");
        assert_eq!(
            ctx.content_hash().map(|h| h.as_str()),
            Some("d41d8cd98f00b204e9800998ecf8427e")
        );
        assert!(ctx.get("sha256").is_none());
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        let mut options = TaskOptions::new();
        options.insert("algorithms".into(), serde_json::json!(["crc32"]));
        assert!(HashTask::from_options(&options).is_err());
    }
}
