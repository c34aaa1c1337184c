//! Block segmenter (§4.2). Turns a stream of classified lines into
//! tagged blocks ready for field extraction.

use crate::classify::{classify, LineKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Info,
    Error,
    ActiveThreads,
    PausedThreads,
    ResourcePressure,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub tag: BlockTag,
    /// Line number of the block's first content line.
    pub first_line_no: u64,
    pub lines: Vec<String>,
}

#[derive(Default)]
struct OpenBlock {
    tag: Option<BlockTag>,
    first_line_no: u64,
    lines: Vec<String>,
}

impl OpenBlock {
    fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    fn take(&mut self) -> Option<Block> {
        if self.is_empty() {
            return None;
        }
        let tag = self.tag?;
        Some(Block {
            tag,
            first_line_no: self.first_line_no,
            lines: std::mem::take(&mut self.lines),
        })
    }

    fn push(&mut self, line_no: u64, line: String, kind: LineKind) {
        if self.lines.is_empty() {
            self.first_line_no = line_no;
            self.tag = Some(match kind {
                LineKind::BlockStartInfo => BlockTag::Info,
                LineKind::BlockStartError => BlockTag::Error,
                LineKind::ActiveThreads => BlockTag::ActiveThreads,
                LineKind::PausedThreads => BlockTag::PausedThreads,
                LineKind::ResourcePressure => BlockTag::ResourcePressure,
                // Defensive: a stray content line opening a block with no
                // recognized header is filed as Error, per §4.2.
                LineKind::Content | LineKind::BlockEnd | LineKind::Ignorable => BlockTag::Error,
            });
        }
        self.lines.push(line);
    }
}

/// Feeds classified lines into a single open block, dispatching a
/// completed `Block` each time a block-end line arrives.
pub struct Segmenter {
    open: OpenBlock,
    line_no: u64,
}

impl Default for Segmenter {
    fn default() -> Self {
        Segmenter::new()
    }
}

impl Segmenter {
    pub fn new() -> Self {
        Segmenter {
            open: OpenBlock::default(),
            line_no: 0,
        }
    }

    /// Feeds one raw line, returning a completed block if this line
    /// closed one.
    pub fn feed(&mut self, line: &str) -> Option<Block> {
        self.line_no += 1;
        let kind = classify(line);
        let trimmed = line.trim_end_matches(['\r', '\n']).to_string();

        match kind {
            // Blank lines and the fixed ignorable-prefix set close the
            // open block and are dropped, never reseeding (§4.1, §4.2).
            LineKind::BlockEnd | LineKind::Ignorable => self.open.take(),
            // Block-start markers and server-event lines also close the
            // open block, but then seed the next one with themselves as
            // its first content line (§4.2).
            LineKind::BlockStartInfo
            | LineKind::BlockStartError
            | LineKind::ActiveThreads
            | LineKind::PausedThreads
            | LineKind::ResourcePressure => {
                let finished = self.open.take();
                self.open.push(self.line_no, trimmed, kind);
                finished
            }
            LineKind::Content => {
                self.open.push(self.line_no, trimmed, kind);
                None
            }
        }
    }

    /// Flushes any open block at end-of-input (used at shutdown).
    pub fn flush(&mut self) -> Option<Block> {
        self.open.take()
    }
}
