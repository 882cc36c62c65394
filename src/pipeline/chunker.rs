//! Chunking: group slides into bounded extraction work units.
//!
//! A chunk is a contiguous run of slides whose combined text stays under a
//! character ceiling and a slide-count ceiling. Chunks partition the slide
//! sequence with no gaps or overlaps; a failing chunk can later be
//! [`Chunk::split`] into two children that exactly cover it.

use crate::types::{ChunkRange, Slide};
use tracing::{debug, info};

/// A contiguous, ordered run of slides submitted in one extraction call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub start_slide: u32,
    pub end_slide: u32,
    pub text: String,
    pub slides: Vec<Slide>,
}

impl Chunk {
    /// Build a chunk from a non-empty, ordered slide run.
    ///
    /// Returns `None` for an empty slice.
    pub fn from_slides(slides: &[Slide]) -> Option<Self> {
        let first = slides.first()?;
        let last = slides.last()?;
        Some(Self {
            start_slide: first.number,
            end_slide: last.number,
            text: render_chunk_text(slides),
            slides: slides.to_vec(),
        })
    }

    pub fn range(&self) -> ChunkRange {
        ChunkRange::new(self.start_slide, self.end_slide)
    }

    pub fn slide_numbers(&self) -> Vec<u32> {
        self.slides.iter().map(|s| s.number).collect()
    }

    pub fn can_split(&self) -> bool {
        self.slides.len() >= 2
    }

    /// Split at the slide midpoint: the left child takes `ceil(n/2)` slides.
    ///
    /// The two children are disjoint and together cover exactly this
    /// chunk's range. Returns `None` for a single-slide chunk.
    pub fn split(&self) -> Option<(Chunk, Chunk)> {
        if !self.can_split() {
            return None;
        }
        let mid = self.slides.len().div_ceil(2);
        let left = Chunk::from_slides(&self.slides[..mid])?;
        let right = Chunk::from_slides(&self.slides[mid..])?;
        Some((left, right))
    }

    /// Rough token estimate for the chunk text (≈4 characters per token).
    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.text)
    }
}

/// Limits driving [`chunk_slides`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLimits {
    pub max_slides: usize,
    pub max_chars: usize,
    pub adaptive_token_threshold: usize,
}

/// Approximate token count of `text`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// The text block sent to the model for a run of slides.
pub fn render_chunk_text(slides: &[Slide]) -> String {
    slides
        .iter()
        .map(|s| format!("[[SLIDE {} | {}]]\n{}", s.number, s.page_label, s.body_text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Greedy chunking with one adaptive retry.
///
/// Pass 1 accumulates slides until adding the next would exceed either
/// limit. If any resulting chunk is estimated above the adaptive threshold,
/// the pass is redone once with `max_slides` halved (floor 1). There is no
/// further iteration.
pub fn chunk_slides(slides: &[Slide], limits: ChunkLimits) -> Vec<Chunk> {
    let first = greedy_pass(slides, limits.max_slides.max(1), limits.max_chars);

    let too_dense = first
        .iter()
        .any(|c| c.estimated_tokens() > limits.adaptive_token_threshold);

    if too_dense && limits.max_slides > 1 {
        let halved = (limits.max_slides / 2).max(1);
        info!(
            "Chunk density above {} tokens; re-chunking with {} slides per chunk",
            limits.adaptive_token_threshold, halved
        );
        return greedy_pass(slides, halved, limits.max_chars);
    }

    first
}

fn greedy_pass(slides: &[Slide], max_slides: usize, max_chars: usize) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut chars = 0usize;

    for (i, slide) in slides.iter().enumerate() {
        let slide_chars = slide.body_text.chars().count();
        let count = i - start;
        let would_overflow = count > 0 && (count + 1 > max_slides || chars + slide_chars > max_chars);
        if would_overflow {
            if let Some(chunk) = Chunk::from_slides(&slides[start..i]) {
                chunks.push(chunk);
            }
            start = i;
            chars = 0;
        }
        chars += slide_chars;
    }

    if let Some(chunk) = Chunk::from_slides(&slides[start..]) {
        chunks.push(chunk);
    }

    debug!(
        "Greedy pass: {} slides → {} chunks (max_slides={}, max_chars={})",
        slides.len(),
        chunks.len(),
        max_slides,
        max_chars
    );
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slides(n: u32, body_len: usize) -> Vec<Slide> {
        (1..=n)
            .map(|i| Slide {
                number: i,
                page_label: format!("Slide {i}"),
                body_text: "x".repeat(body_len),
            })
            .collect()
    }

    fn limits(max_slides: usize, max_chars: usize) -> ChunkLimits {
        ChunkLimits {
            max_slides,
            max_chars,
            adaptive_token_threshold: 10_000,
        }
    }

    #[test]
    fn forty_slides_six_per_chunk_gives_seven_chunks() {
        let chunks = chunk_slides(&slides(40, 200), limits(6, 12_000));
        assert_eq!(chunks.len(), 7);
        assert_eq!(chunks[0].range(), ChunkRange::new(1, 6));
        assert_eq!(chunks[6].range(), ChunkRange::new(37, 40));
    }

    #[test]
    fn chunks_partition_without_gaps_or_overlaps() {
        let input = slides(23, 900);
        let chunks = chunk_slides(&input, limits(5, 3_000));
        let covered: Vec<u32> = chunks.iter().flat_map(|c| c.slide_numbers()).collect();
        let expected: Vec<u32> = input.iter().map(|s| s.number).collect();
        assert_eq!(covered, expected);
        for c in &chunks {
            let chars: usize = c.slides.iter().map(|s| s.body_text.len()).sum();
            assert!(chars <= 3_000 || c.slides.len() == 1);
        }
    }

    #[test]
    fn char_limit_starts_new_chunk() {
        let chunks = chunk_slides(&slides(4, 5_000), limits(6, 12_000));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].range(), ChunkRange::new(1, 2));
    }

    #[test]
    fn oversized_single_slide_gets_its_own_chunk() {
        let chunks = chunk_slides(&slides(3, 20_000), limits(6, 12_000));
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn dense_chunks_trigger_one_halving_pass() {
        let l = ChunkLimits {
            max_slides: 6,
            max_chars: 100_000,
            adaptive_token_threshold: 2_000,
        };
        // 6 × 2000 chars ≈ 3000 tokens per chunk → halve to 3 slides.
        let chunks = chunk_slides(&slides(12, 2_000), l);
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.slides.len() == 3));
    }

    #[test]
    fn adaptive_pass_runs_at_most_once() {
        let l = ChunkLimits {
            max_slides: 8,
            max_chars: 1_000_000,
            adaptive_token_threshold: 10,
        };
        // Still dense after halving to 4, but no third pass happens.
        let chunks = chunk_slides(&slides(8, 400), l);
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn split_produces_exact_disjoint_cover() {
        let input: Vec<Slide> = slides(18, 10).into_iter().skip(12).collect();
        let chunk = Chunk::from_slides(&input).unwrap();
        assert_eq!(chunk.range(), ChunkRange::new(13, 18));
        let (l, r) = chunk.split().unwrap();
        assert_eq!(l.range(), ChunkRange::new(13, 15));
        assert_eq!(r.range(), ChunkRange::new(16, 18));
    }

    #[test]
    fn split_possible_for_every_multi_slide_chunk() {
        let all = slides(9, 10);
        for len in 2..=9 {
            let chunk = Chunk::from_slides(&all[..len]).unwrap();
            let (l, r) = chunk.split().expect("multi-slide chunk must split");
            assert_eq!(l.start_slide, chunk.start_slide);
            assert_eq!(r.end_slide, chunk.end_slide);
            assert_eq!(l.end_slide + 1, r.start_slide);
            assert_eq!(l.slides.len() + r.slides.len(), chunk.slides.len());
        }
        let single = Chunk::from_slides(&all[..1]).unwrap();
        assert!(single.split().is_none());
    }

    #[test]
    fn chunk_text_tags_each_slide() {
        let chunk = Chunk::from_slides(&slides(2, 3)).unwrap();
        assert!(chunk.text.contains("[[SLIDE 1 | Slide 1]]"));
        assert!(chunk.text.contains("[[SLIDE 2 | Slide 2]]"));
    }
}
