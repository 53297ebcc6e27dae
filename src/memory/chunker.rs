//! Hierarchical splitting of long content.
//!
//! Content below the threshold comes back as a single root chunk. Longer content
//! is cut into paragraphs (level 1). A paragraph longer than `max_chunk_size` is
//! additionally sliced on word boundaries (level 2), each slice after the first
//! starting with the tail of its predecessor. All sizes count `char`s.
//!
//! Paragraphs keep their trailing blank-line separator, so the level-1 texts
//! concatenate back to the input exactly. Level-2 slices do the same once each
//! slice's `overlap` prefix is dropped.

use serde::Serialize;

use crate::config::ChunkingConfig;
use crate::memory::types::ChunkLevel;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub text: String,
    pub level: ChunkLevel,
    /// Position among siblings. Level-1 chunks count paragraphs, level-2
    /// chunks restart at 0 under each paragraph.
    pub index: usize,
    /// For level-2 chunks, the `index` of the owning level-1 chunk.
    pub parent: Option<usize>,
    /// Leading chars copied from the previous sibling.
    pub overlap: usize,
}

impl Chunk {
    /// The text without the copied overlap prefix.
    pub fn body(&self) -> &str {
        match self.text.char_indices().nth(self.overlap) {
            Some((byte, _)) => &self.text[byte..],
            None if self.overlap == 0 => &self.text,
            None => "",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Chunker {
    max_chunk_size: usize,
    overlap: usize,
    min_chunk_size_threshold: usize,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(&ChunkingConfig::default())
    }
}

impl Chunker {
    pub fn new(config: &ChunkingConfig) -> Self {
        let max_chunk_size = config.max_chunk_size.max(1);
        Self {
            max_chunk_size,
            // Overlap must leave room for new text in every slice.
            overlap: config.overlap.min(max_chunk_size - 1),
            min_chunk_size_threshold: config.min_chunk_size_threshold,
        }
    }

    /// Split `content` into an ordered chunk sequence: each paragraph followed
    /// by its level-2 slices, if any.
    pub fn chunk(&self, content: &str) -> Vec<Chunk> {
        if content.chars().count() < self.min_chunk_size_threshold {
            return vec![Chunk {
                text: content.to_string(),
                level: ChunkLevel::Root,
                index: 0,
                parent: None,
                overlap: 0,
            }];
        }

        let mut chunks = Vec::new();
        for (p, paragraph) in split_paragraphs(content).into_iter().enumerate() {
            let oversized = paragraph.chars().count() > self.max_chunk_size;
            chunks.push(Chunk {
                text: paragraph.to_string(),
                level: ChunkLevel::Paragraph,
                index: p,
                parent: None,
                overlap: 0,
            });
            if oversized {
                chunks.extend(self.split_words(paragraph, p));
            }
        }
        chunks
    }

    /// Slice one oversized paragraph. Every slice, overlap included, stays
    /// within `max_chunk_size` unless a single word is longer than that.
    fn split_words(&self, paragraph: &str, parent: usize) -> Vec<Chunk> {
        let chars: Vec<char> = paragraph.chars().collect();
        let mut slices: Vec<Chunk> = Vec::new();
        let mut start = 0;

        while start < chars.len() {
            let carried: String = match slices.last() {
                Some(prev) => tail(&prev.text, self.overlap),
                None => String::new(),
            };
            let carried_len = carried.chars().count();
            let budget = self.max_chunk_size - carried_len;

            let end = if chars.len() - start <= budget {
                chars.len()
            } else {
                word_boundary(&chars, start, start + budget)
            };

            let mut text = carried;
            text.extend(&chars[start..end]);
            slices.push(Chunk {
                text,
                level: ChunkLevel::Atomic,
                index: slices.len(),
                parent: Some(parent),
                overlap: carried_len,
            });
            start = end;
        }
        slices
    }
}

/// Cut position in `(start, limit]`: just after the last whitespace inside the
/// window, or at `limit` if the window holds a single unbroken word.
fn word_boundary(chars: &[char], start: usize, limit: usize) -> usize {
    (start + 1..limit)
        .rev()
        .find(|&i| chars[i - 1].is_whitespace() && !chars[i].is_whitespace())
        .unwrap_or(limit)
}

fn tail(text: &str, n: usize) -> String {
    let len = text.chars().count();
    text.chars().skip(len.saturating_sub(n)).collect()
}

/// Split on blank lines (two or more newlines, `\r` allowed in between). The
/// separator stays attached to the paragraph before it; whitespace-only
/// fragments are folded into a neighbour so no paragraph is blank.
fn split_paragraphs(content: &str) -> Vec<&str> {
    let bytes = content.as_bytes();
    let mut cuts = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\n' || bytes[i] == b'\r' {
            let run_start = i;
            let mut newlines = 0;
            while i < bytes.len() && (bytes[i] == b'\n' || bytes[i] == b'\r') {
                if bytes[i] == b'\n' {
                    newlines += 1;
                }
                i += 1;
            }
            if newlines >= 2 && run_start > 0 && i < bytes.len() {
                cuts.push(i);
            }
        } else {
            i += 1;
        }
    }

    // (start, end) byte ranges; blank pieces widen a neighbour instead.
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    let mut from = 0;
    let mut pending_start: Option<usize> = None;
    for cut in cuts.into_iter().chain(std::iter::once(content.len())) {
        if content[from..cut].trim().is_empty() {
            match ranges.last_mut() {
                Some(last) => last.1 = cut,
                None => pending_start = Some(pending_start.unwrap_or(from)),
            }
        } else {
            ranges.push((pending_start.take().unwrap_or(from), cut));
        }
        from = cut;
    }

    if ranges.is_empty() {
        return vec![content];
    }
    ranges.into_iter().map(|(s, e)| &content[s..e]).collect()
}

/// Rebuild content from level-1 chunks.
pub fn reassemble(chunks: &[Chunk]) -> String {
    if let [only] = chunks {
        if only.level == ChunkLevel::Root {
            return only.text.clone();
        }
    }
    chunks
        .iter()
        .filter(|c| c.level == ChunkLevel::Paragraph)
        .map(|c| c.text.as_str())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(max: usize, overlap: usize, min: usize) -> Chunker {
        Chunker::new(&ChunkingConfig {
            max_chunk_size: max,
            overlap,
            min_chunk_size_threshold: min,
        })
    }

    fn words(n: usize) -> String {
        (0..n).map(|i| format!("word{i}")).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn short_content_is_a_single_root() {
        let text = "Go channels are typed conduits";
        let chunks = Chunker::default().chunk(text);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].level, ChunkLevel::Root);
        assert_eq!(chunks[0].text, text);
    }

    #[test]
    fn threshold_is_measured_in_chars_not_bytes() {
        // 1000 two-byte chars: 2000 bytes, still below the 1500-char threshold.
        let text = "é".repeat(1000);
        let chunks = Chunker::default().chunk(&text);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].level, ChunkLevel::Root);
    }

    #[test]
    fn paragraphs_become_level_one_chunks() {
        let text = format!("{}\n\n{}\n\n{}", words(60), words(60), words(60));
        let chunks = chunker(1000, 100, 100).chunk(&text);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.level == ChunkLevel::Paragraph));
        assert_eq!(
            chunks.iter().map(|c| c.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(reassemble(&chunks), text);
    }

    #[test]
    fn oversized_paragraph_gets_overlapping_slices() {
        let small = words(100);
        let big = words(700);
        let text = format!("{small}\n\n{big}");
        assert!(text.chars().count() >= 5000);

        let chunks = Chunker::default().chunk(&text);
        assert!(chunks.iter().all(|c| c.level != ChunkLevel::Root));

        let level_one: Vec<_> = chunks.iter().filter(|c| c.level == ChunkLevel::Paragraph).collect();
        let level_two: Vec<_> = chunks.iter().filter(|c| c.level == ChunkLevel::Atomic).collect();
        assert_eq!(level_one.len(), 2);
        assert!(level_two.len() >= 2);

        for (i, slice) in level_two.iter().enumerate() {
            assert_eq!(slice.index, i, "slice indices restart per paragraph");
            assert_eq!(slice.parent, Some(1));
            assert!(slice.text.chars().count() <= 1000);
        }
        assert_eq!(level_two[0].overlap, 0);
        assert_eq!(level_two[1].overlap, 100);

        let prev_tail = tail(&level_two[0].text, 100);
        assert!(level_two[1].text.starts_with(&prev_tail));

        let rebuilt: String = level_two.iter().map(|c| c.body()).collect();
        assert_eq!(rebuilt, level_one[1].text);
        assert_eq!(reassemble(&chunks), text);
    }

    #[test]
    fn slices_break_on_word_boundaries() {
        let text = words(400);
        let chunks = chunker(200, 20, 100).chunk(&text);
        let slices: Vec<_> = chunks.iter().filter(|c| c.level == ChunkLevel::Atomic).collect();
        for pair in slices.windows(2) {
            let body = pair[0].body();
            assert!(
                body.ends_with(' '),
                "slice should end after whitespace: {body:?}"
            );
        }
    }

    #[test]
    fn many_slices_keep_unbounded_indices() {
        let text = "x".repeat(5000);
        let chunks = chunker(3, 1, 10).chunk(&text);
        let max_index = chunks
            .iter()
            .filter(|c| c.level == ChunkLevel::Atomic)
            .map(|c| c.index)
            .max()
            .unwrap();
        assert!(max_index > 1000);
        let rebuilt: String = chunks
            .iter()
            .filter(|c| c.level == ChunkLevel::Atomic)
            .map(|c| c.body())
            .collect();
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn blank_runs_stay_with_preceding_paragraph() {
        let text = format!("\n\n{}\n\n\n\n{}\r\n\r\n", words(30), words(30));
        let chunks = chunker(1000, 10, 10).chunk(&text);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].text.starts_with("\n\nword0"));
        assert!(chunks[0].text.ends_with("\n\n\n\n"));
        assert_eq!(reassemble(&chunks), text);
    }

    #[test]
    fn reassembly_is_lossless_for_mixed_content() {
        let text = format!(
            "Intro line.\n\n{}\n\nA short one.\n\n\n{}",
            words(300),
            "ünïcödé ".repeat(200)
        );
        let chunks = chunker(500, 50, 200).chunk(&text);
        assert_eq!(reassemble(&chunks), text);
    }
}
