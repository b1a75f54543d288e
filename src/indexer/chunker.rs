use crate::error::{PipelineError, Result};
use crate::models::{Chunk, DrugFact};

/// Fixed-size sliding window over chars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    max_chars: usize,
    overlap: usize,
}

impl Chunker {
    pub fn new(max_chars: usize, overlap: usize) -> Result<Self> {
        if max_chars == 0 {
            return Err(PipelineError::InvalidInput(
                "chunk size must be greater than zero".to_string(),
            ));
        }
        if overlap >= max_chars {
            return Err(PipelineError::InvalidInput(format!(
                "chunk overlap ({}) must be smaller than chunk size ({})",
                overlap, max_chars
            )));
        }
        Ok(Self { max_chars, overlap })
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Chunks every fact in order. Indexes run across the whole call.
    pub fn split(&self, drug_name: &str, facts: &[DrugFact]) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        for fact in facts {
            for (start, end, text) in self.windows(&fact.text) {
                chunks.push(Chunk {
                    text,
                    drug_name: drug_name.to_string(),
                    section: fact.section.clone(),
                    index: chunks.len(),
                    start,
                    end,
                });
            }
        }
        chunks
    }

    /// Returns `(start, end, text)` for each window, offsets in chars.
    pub fn windows(&self, text: &str) -> Vec<(usize, usize, String)> {
        // byte offset of every char plus the end of the string
        let mut boundaries: Vec<usize> = text.char_indices().map(|(pos, _)| pos).collect();
        let char_len = boundaries.len();
        boundaries.push(text.len());

        if char_len == 0 {
            return Vec::new();
        }

        let step = self.max_chars - self.overlap;
        let mut windows = Vec::new();
        let mut start = 0;
        loop {
            let end = (start + self.max_chars).min(char_len);
            windows.push((
                start,
                end,
                text[boundaries[start]..boundaries[end]].to_string(),
            ));
            if end == char_len {
                break;
            }
            start += step;
        }
        windows
    }
}
