//! Document chunking.
//!
//! Splits a document body into [`Segment`]s under one of four strategies:
//! fixed-size character windows, sentence-boundary packing,
//! paragraph-boundary packing, or Markdown heading sections. Sentence and
//! paragraph units are packed up to `max_chars`; a single unit larger than
//! `max_chars` falls back to fixed-size splitting with the configured
//! overlap. Heading sections stay intact unless they exceed `max_chars`.
//!
//! Chunking is a pure function of (content, strategy, parameters): no
//! clocks, no random ids. Segment ids are `"{document_key}#{seq}"` and
//! every segment carries a SHA-256 hash of its text. Splitting preserves
//! the input exactly — concatenating segment texts, minus each segment's
//! leading overlap, reconstructs the document.

use crate::error::{Error, Result};
use crate::models::{content_hash, ChunkStrategy, Segment};

/// Split a document body into ordered segments.
///
/// Constraints: `max_chars > overlap >= 0`, else
/// [`Error::Configuration`]. An empty or whitespace-only body yields an
/// empty sequence, not an error.
pub fn chunk(
    document_key: &str,
    text: &str,
    strategy: ChunkStrategy,
    max_chars: usize,
    overlap: usize,
) -> Result<Vec<Segment>> {
    if max_chars == 0 {
        return Err(Error::Configuration("max_chars must be > 0".to_string()));
    }
    if overlap >= max_chars {
        return Err(Error::Configuration(format!(
            "overlap ({overlap}) must be smaller than max_chars ({max_chars})"
        )));
    }
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let pieces: Vec<Piece> = match strategy {
        ChunkStrategy::Fixed => split_fixed(text, max_chars, overlap)
            .into_iter()
            .map(|(text, lead)| Piece {
                text,
                overlap: lead,
                heading: None,
            })
            .collect(),
        ChunkStrategy::Sentence => pack_units(&split_sentences(text), max_chars, overlap),
        ChunkStrategy::Paragraph => pack_units(&split_paragraphs(text), max_chars, overlap),
        ChunkStrategy::Heading => chunk_sections(text, max_chars, overlap),
    };

    Ok(pieces
        .into_iter()
        .enumerate()
        .map(|(seq, piece)| make_segment(document_key, seq as i64, piece, strategy))
        .collect())
}

struct Piece {
    text: String,
    /// Leading chars repeated from the previous piece.
    overlap: usize,
    heading: Option<String>,
}

fn make_segment(document_key: &str, seq: i64, piece: Piece, strategy: ChunkStrategy) -> Segment {
    let hash = content_hash(&piece.text);
    Segment {
        id: format!("{document_key}#{seq}"),
        document_key: document_key.to_string(),
        seq,
        text: piece.text,
        overlap: piece.overlap,
        strategy,
        heading: piece.heading,
        hash,
    }
}

/// Fixed-size windows of `max_chars` characters advancing by
/// `max_chars - overlap`. Returns (text, leading overlap) pairs. Windows
/// are cut on char boundaries, never mid-codepoint.
fn split_fixed(text: &str, max_chars: usize, overlap: usize) -> Vec<(String, usize)> {
    let bounds: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    let n = bounds.len();
    let step = max_chars - overlap;

    let mut out = Vec::new();
    let mut start = 0usize;
    loop {
        let end = (start + max_chars).min(n);
        let byte_start = bounds[start];
        let byte_end = if end == n { text.len() } else { bounds[end] };
        let lead = if start == 0 { 0 } else { overlap };
        out.push((text[byte_start..byte_end].to_string(), lead));
        if end == n {
            break;
        }
        start += step;
    }
    out
}

/// Split into sentence units, each keeping its terminator run and trailing
/// whitespace. Honors ASCII and CJK sentence enders. Concatenating the
/// units reproduces the input exactly.
fn split_sentences(text: &str) -> Vec<&str> {
    fn is_ender(c: char) -> bool {
        matches!(c, '.' | '!' | '?' | '。' | '！' | '？')
    }

    let mut units = Vec::new();
    let mut start = 0usize;
    let mut after_ender = false;
    for (i, c) in text.char_indices() {
        if is_ender(c) || (after_ender && c.is_whitespace()) {
            after_ender = true;
        } else if after_ender {
            units.push(&text[start..i]);
            start = i;
            after_ender = false;
        }
    }
    if start < text.len() {
        units.push(&text[start..]);
    }
    units
}

/// Split into paragraph units, each keeping its `\n\n` separator.
fn split_paragraphs(text: &str) -> Vec<&str> {
    text.split_inclusive("\n\n").collect()
}

/// Pack units into pieces of at most `max_chars` characters. A unit that
/// alone exceeds `max_chars` is split fixed-size with the given overlap.
fn pack_units(units: &[&str], max_chars: usize, overlap: usize) -> Vec<Piece> {
    let mut pieces = Vec::new();
    let mut buf = String::new();
    let mut buf_chars = 0usize;

    for unit in units {
        let unit_chars = unit.chars().count();

        if unit_chars > max_chars {
            if !buf.is_empty() {
                pieces.push(Piece {
                    text: std::mem::take(&mut buf),
                    overlap: 0,
                    heading: None,
                });
                buf_chars = 0;
            }
            pieces.extend(
                split_fixed(unit, max_chars, overlap)
                    .into_iter()
                    .map(|(text, lead)| Piece {
                        text,
                        overlap: lead,
                        heading: None,
                    }),
            );
            continue;
        }

        if buf_chars + unit_chars > max_chars && !buf.is_empty() {
            pieces.push(Piece {
                text: std::mem::take(&mut buf),
                overlap: 0,
                heading: None,
            });
            buf_chars = 0;
        }
        buf.push_str(unit);
        buf_chars += unit_chars;
    }

    if !buf.is_empty() {
        pieces.push(Piece {
            text: buf,
            overlap: 0,
            heading: None,
        });
    }
    pieces
}

/// Parse an ATX heading line (`# ...` through `###### ...`), returning its
/// title text.
fn heading_text(line: &str) -> Option<String> {
    let stripped = line.trim_start_matches('#');
    let level = line.len() - stripped.len();
    if (1..=6).contains(&level) && stripped.starts_with(' ') {
        Some(stripped.trim().to_string())
    } else {
        None
    }
}

/// Split at Markdown heading lines. Each section keeps its heading line and
/// body verbatim; a section larger than `max_chars` is split fixed-size,
/// with every resulting piece tagged with the section's heading.
fn chunk_sections(text: &str, max_chars: usize, overlap: usize) -> Vec<Piece> {
    let mut starts: Vec<(Option<String>, usize)> = Vec::new();
    let mut pos = 0usize;
    for line in text.split_inclusive('\n') {
        match heading_text(line) {
            Some(h) => starts.push((Some(h), pos)),
            None if starts.is_empty() => starts.push((None, pos)),
            None => {}
        }
        pos += line.len();
    }

    let mut pieces = Vec::new();
    for (i, (heading, start)) in starts.iter().enumerate() {
        let end = starts.get(i + 1).map(|(_, s)| *s).unwrap_or(text.len());
        let section = &text[*start..end];
        if section.chars().count() <= max_chars {
            pieces.push(Piece {
                text: section.to_string(),
                overlap: 0,
                heading: heading.clone(),
            });
        } else {
            pieces.extend(
                split_fixed(section, max_chars, overlap)
                    .into_iter()
                    .map(|(text, lead)| Piece {
                        text,
                        overlap: lead,
                        heading: heading.clone(),
                    }),
            );
        }
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Rebuild a document from its segments by dropping each segment's
    /// leading overlap (counted in chars).
    fn reconstruct(segments: &[Segment]) -> String {
        let mut out = String::new();
        for seg in segments {
            let skip: usize = seg
                .text
                .char_indices()
                .nth(seg.overlap)
                .map(|(i, _)| i)
                .unwrap_or(seg.text.len());
            out.push_str(&seg.text[skip..]);
        }
        out
    }

    #[test]
    fn test_empty_text_yields_no_segments() {
        let segments = chunk("doc", "", ChunkStrategy::Paragraph, 100, 10).unwrap();
        assert!(segments.is_empty());
        let segments = chunk("doc", "   \n\n  ", ChunkStrategy::Fixed, 100, 10).unwrap();
        assert!(segments.is_empty());
    }

    #[test]
    fn test_overlap_must_be_smaller_than_max() {
        let err = chunk("doc", "hello", ChunkStrategy::Fixed, 10, 10).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        let err = chunk("doc", "hello", ChunkStrategy::Fixed, 0, 0).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_small_text_single_segment() {
        let segments = chunk("doc", "Hello, world!", ChunkStrategy::Fixed, 100, 10).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].seq, 0);
        assert_eq!(segments[0].id, "doc#0");
        assert_eq!(segments[0].text, "Hello, world!");
        assert_eq!(segments[0].overlap, 0);
    }

    #[test]
    fn test_fixed_windows_reconstruct_content() {
        let text = "abcdefghijklmnopqrstuvwxyz0123456789";
        let segments = chunk("doc", text, ChunkStrategy::Fixed, 10, 3).unwrap();
        assert!(segments.len() > 1);
        for seg in &segments[1..] {
            assert_eq!(seg.overlap, 3);
        }
        assert_eq!(reconstruct(&segments), text);
    }

    #[test]
    fn test_fixed_respects_char_boundaries() {
        let text = "héllo wörld — ünïcode ".repeat(8);
        let segments = chunk("doc", &text, ChunkStrategy::Fixed, 7, 2).unwrap();
        assert_eq!(reconstruct(&segments), text);
    }

    #[test]
    fn test_paragraphs_packed_under_limit() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let segments = chunk("doc", text, ChunkStrategy::Paragraph, 700, 50).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, text);
    }

    #[test]
    fn test_oversized_paragraph_falls_back_to_fixed() {
        // Three paragraphs, each larger than max_chars: the chunker must
        // fall back to fixed-size splitting inside each, producing more
        // than three segments with overlap between consecutive pieces.
        let text = format!(
            "{}\n\n{}\n\n{}",
            "alpha ".repeat(20),
            "bravo ".repeat(20),
            "charlie ".repeat(20)
        );
        let segments = chunk("doc", &text, ChunkStrategy::Paragraph, 40, 8).unwrap();
        assert!(segments.len() > 3, "got {} segments", segments.len());
        assert!(segments.iter().any(|s| s.overlap == 8));
        assert_eq!(reconstruct(&segments), text);
    }

    #[test]
    fn test_sentence_units_respect_enders() {
        let text = "One sentence. Another one! A third? 中文句子。Done.";
        let segments = chunk("doc", text, ChunkStrategy::Sentence, 20, 4).unwrap();
        assert!(segments.len() > 1);
        assert_eq!(reconstruct(&segments), text);
    }

    #[test]
    fn test_heading_sections_stay_intact() {
        let text = "# Intro\n\nShort intro.\n\n## Details\n\nSome details here.\n";
        let segments = chunk("doc", text, ChunkStrategy::Heading, 500, 50).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].heading.as_deref(), Some("Intro"));
        assert_eq!(segments[1].heading.as_deref(), Some("Details"));
        assert_eq!(reconstruct(&segments), text);
    }

    #[test]
    fn test_heading_preamble_without_heading() {
        let text = "Preamble text.\n\n# First\n\nBody.\n";
        let segments = chunk("doc", text, ChunkStrategy::Heading, 500, 0).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].heading, None);
        assert_eq!(segments[1].heading.as_deref(), Some("First"));
    }

    #[test]
    fn test_oversized_section_falls_back_to_fixed() {
        let text = format!("# Big\n\n{}", "filler text ".repeat(30));
        let segments = chunk("doc", &text, ChunkStrategy::Heading, 50, 10).unwrap();
        assert!(segments.len() > 1);
        assert!(segments.iter().all(|s| s.heading.as_deref() == Some("Big")));
        assert_eq!(reconstruct(&segments), text);
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha.\n\nBeta.\n\nGamma.\n\nDelta.";
        let a = chunk("doc", text, ChunkStrategy::Paragraph, 12, 3).unwrap();
        let b = chunk("doc", text, ChunkStrategy::Paragraph, 12, 3).unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.id, y.id);
            assert_eq!(x.text, y.text);
            assert_eq!(x.hash, y.hash);
        }
    }

    #[test]
    fn test_indices_contiguous() {
        let text = (0..40)
            .map(|i| format!("Paragraph number {i}."))
            .collect::<Vec<_>>()
            .join("\n\n");
        let segments = chunk("doc", &text, ChunkStrategy::Paragraph, 30, 5).unwrap();
        for (i, seg) in segments.iter().enumerate() {
            assert_eq!(seg.seq, i as i64, "index mismatch at position {i}");
        }
    }
}
