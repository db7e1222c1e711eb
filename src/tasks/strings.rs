use anyhow::{Result, bail};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::TaskOptions;
use crate::item::EvidenceItem;
use crate::stream::SeekableStream;

use super::{
    Artefact, ProcessingContext, ProcessingTask, TaskCapabilities, TaskError, TaskOutcome,
    option_u64, scan_content,
};

pub const ID: &str = "strings";

const DEFAULT_MIN_LEN: u64 = 6;
const DEFAULT_MAX_BYTES: u64 = 64 * crate::constants::MIB;
const DEFAULT_MAX_TEXT_BYTES: u64 = crate::constants::MIB;
/// Longer runs are split so a single run cannot grow without bound.
const MAX_RUN_LEN: usize = 4096;

static URL_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r#"(?i)\b(?:https?|ftp)://[^\s"'<>()\[\]{}]{3,}"#).ok());
static EMAIL_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]{1,64}@[A-Za-z0-9.-]{1,253}\.[A-Za-z]{2,24}\b").ok()
});

/// Printable ASCII and UTF-16LE text runs plus URL / e-mail artefacts.
#[derive(Debug, Clone)]
pub struct StringsTask {
    min_len: usize,
    max_bytes: u64,
    max_text_bytes: u64,
}

impl StringsTask {
    pub fn from_options(options: &TaskOptions) -> Result<Self> {
        let min_len = option_u64(options, "min_len", DEFAULT_MIN_LEN)?;
        if min_len == 0 || min_len as usize > MAX_RUN_LEN {
            bail!("option min_len must be between 1 and {MAX_RUN_LEN}");
        }
        Ok(Self {
            min_len: min_len as usize,
            max_bytes: option_u64(options, "max_bytes", DEFAULT_MAX_BYTES)?,
            max_text_bytes: option_u64(options, "max_text_bytes", DEFAULT_MAX_TEXT_BYTES)?,
        })
    }
}

impl ProcessingTask for StringsTask {
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
        let mut runs = RunExtractor::new(self.min_len);
        let scanned = scan_content(stream, ctx, Some(self.max_bytes), |offset, block| {
            runs.feed(offset, block);
            Ok(())
        })?;
        let runs = runs.finish();

        let mut artefacts = Vec::new();
        for run in &runs {
            collect_artefacts(run, &mut artefacts);
        }

        let mut text_bytes = 0u64;
        let mut kept = Vec::new();
        let mut truncated = false;
        for run in &runs {
            text_bytes += run.text.len() as u64;
            if text_bytes > self.max_text_bytes {
                truncated = true;
                break;
            }
            kept.push(run.text.clone());
        }

        ctx.insert("strings_count", runs.len());
        ctx.insert("strings_scanned_bytes", scanned);
        ctx.insert("artefact_count", artefacts.len());
        if truncated {
            ctx.insert("strings_truncated", true);
        }
        let derived = ctx.derived_mut();
        derived.text.extend(kept);
        derived.artefacts.extend(artefacts);
        Ok(TaskOutcome::Continue)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TextRun {
    offset: u64,
    text: String,
}

fn is_printable(byte: u8) -> bool {
    matches!(byte, b'\t' | 0x20..=0x7E)
}

/// Incremental run detection across block boundaries.
struct RunExtractor {
    min_len: usize,
    ascii: Vec<u8>,
    ascii_start: u64,
    wide: Vec<u8>,
    wide_start: u64,
    /// Low byte of a UTF-16 pair split across two blocks.
    pending: Option<(u64, u8)>,
    out: Vec<TextRun>,
}

impl RunExtractor {
    fn new(min_len: usize) -> Self {
        Self {
            min_len,
            ascii: Vec::new(),
            ascii_start: 0,
            wide: Vec::new(),
            wide_start: 0,
            pending: None,
            out: Vec::new(),
        }
    }

    fn feed(&mut self, offset: u64, block: &[u8]) {
        for (i, &byte) in block.iter().enumerate() {
            let pos = offset + i as u64;
            self.push_ascii(pos, byte);
            if pos % 2 == 0 {
                self.pending = Some((pos, byte));
            } else if let Some((lo_pos, lo)) = self.pending.take() {
                self.push_wide(lo_pos, lo, byte);
            }
        }
    }

    fn push_ascii(&mut self, pos: u64, byte: u8) {
        if is_printable(byte) {
            if self.ascii.is_empty() {
                self.ascii_start = pos;
            }
            self.ascii.push(byte);
            if self.ascii.len() >= MAX_RUN_LEN {
                self.flush_ascii();
            }
        } else {
            self.flush_ascii();
        }
    }

    fn push_wide(&mut self, pos: u64, lo: u8, hi: u8) {
        if hi == 0 && is_printable(lo) {
            if self.wide.is_empty() {
                self.wide_start = pos;
            }
            self.wide.push(lo);
            if self.wide.len() >= MAX_RUN_LEN {
                self.flush_wide();
            }
        } else {
            self.flush_wide();
        }
    }

    fn flush_ascii(&mut self) {
        let run = std::mem::take(&mut self.ascii);
        self.emit(self.ascii_start, run);
    }

    fn flush_wide(&mut self) {
        let run = std::mem::take(&mut self.wide);
        self.emit(self.wide_start, run);
    }

    fn emit(&mut self, offset: u64, run: Vec<u8>) {
        if run.len() >= self.min_len {
            self.out.push(TextRun {
                offset,
                text: String::from_utf8_lossy(&run).into_owned(),
            });
        }
    }

    fn finish(mut self) -> Vec<TextRun> {
        self.flush_ascii();
        self.flush_wide();
        self.out.sort_by_key(|run| run.offset);
        self.out
    }
}

fn collect_artefacts(run: &TextRun, out: &mut Vec<Artefact>) {
    let patterns = [("url", URL_RE.as_ref()), ("email", EMAIL_RE.as_ref())];
    for (kind, regex) in patterns {
        let Some(regex) = regex else {
            continue;
        };
        for found in regex.find_iter(&run.text) {
            out.push(Artefact {
                kind: kind.to_string(),
                value: found.as_str().trim_end_matches(['.', ',', ';']).to_string(),
                offset: run.offset + found.start() as u64,
            });
        }
    }
}
