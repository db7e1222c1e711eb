use anyhow::Result;

use crate::config::TaskOptions;
use crate::item::EvidenceItem;
use crate::stream::SeekableStream;

use super::{
    ProcessingContext, ProcessingTask, TaskCapabilities, TaskError, TaskOutcome, option_u64,
    scan_content,
};

pub const ID: &str = "entropy";

const DEFAULT_MAX_BYTES: u64 = 64 * crate::constants::MIB;
/// Bits per byte above which content is reported as likely encrypted or compressed.
const HIGH_ENTROPY_THRESHOLD: f64 = 7.5;

pub struct EntropyTask {
    max_bytes: u64,
}

impl EntropyTask {
    pub fn from_options(options: &TaskOptions) -> Result<Self> {
        Ok(Self {
            max_bytes: option_u64(options, "max_bytes", DEFAULT_MAX_BYTES)?,
        })
    }
}

impl ProcessingTask for EntropyTask {
    fn id(&self) -> &str {
        ID
    }

    fn capabilities(&self) -> TaskCapabilities {
        TaskCapabilities {
            reads_content: true,
            heavy: true,
        }
    }

    fn apply(
        &self,
        _item: &EvidenceItem,
        stream: &mut dyn SeekableStream,
        ctx: &mut ProcessingContext,
    ) -> Result<TaskOutcome, TaskError> {
        let mut histogram = [0u64; 256];
        let sampled = scan_content(stream, ctx, Some(self.max_bytes), |_, block| {
            for &byte in block {
                histogram[byte as usize] += 1;
            }
            Ok(())
        })?;

        let entropy = shannon_entropy(&histogram, sampled);
        ctx.insert("entropy", (entropy * 10_000.0).round() / 10_000.0);
        ctx.insert("entropy_sampled_bytes", sampled);
        ctx.insert("high_entropy", entropy >= HIGH_ENTROPY_THRESHOLD);
        Ok(TaskOutcome::Continue)
    }
}

fn shannon_entropy(histogram: &[u64; 256], total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    histogram
        .iter()
        .filter(|&&count| count > 0)
        .map(|&count| {
            let p = count as f64 / total;
            -p * p.log2()
        })
        .sum()
}
