use std::sync::LazyLock;

use regex::Regex;

use crate::metadata::FileType;

/// Splitting parameters, taken from the application config.
#[derive(Debug, Clone, Copy)]
pub struct ChunkParams {
    /// Target chunk length in characters.
    pub chunk_size: usize,
    /// Overlap between adjacent chunks.
    pub chunk_overlap: usize,
    /// Chunks trimmed below this length are merged with their successor.
    pub min_chunk_size: usize,
}

/// One bounded slice of the preprocessed document text.
///
/// `start`/`end` are byte offsets into the preprocessed text (all cut
/// points land on char boundaries). For i > 0 the chunk begins no later
/// than `chunks[i-1].end - chunk_overlap`.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub content: String,
    pub start: usize,
    pub end: usize,
}

/// Separator lists per document type, applied in priority order. The empty
/// separator terminates every list and forces a hard cut.
const MARKDOWN_SEPARATORS: &[&str] = &[
    "\n---\n", "\n***\n", "\n___\n", "\n```", "\n\n", "\n# ", "\n## ", "\n### ", "\n#### ",
    "\n##### ", "\n###### ", "\n", ". ", "? ", "! ", ": ", "; ", ", ", " ", "",
];

const CODE_SEPARATORS: &[&str] = &[
    "\n\nclass ", "\n\nfunction ", "\n\ndef ", "\n\nexport ", "\n\nimport ", "\n\nconst ",
    "\n\nlet ", "\n\nvar ", "\n//", "\n#", "\n/*", "\n\n", "\n", "; ", " ", "",
];

const JSON_SEPARATORS: &[&str] = &["\n\n", "\n", ", ", " ", ""];

const DEFAULT_SEPARATORS: &[&str] = &["\n\n", "\n", ". ", "? ", "! ", "; ", ", ", " ", ""];

fn separators_for(file_type: FileType) -> &'static [&'static str] {
    match file_type {
        FileType::Markdown => MARKDOWN_SEPARATORS,
        FileType::Code => CODE_SEPARATORS,
        FileType::Json => JSON_SEPARATORS,
        _ => DEFAULT_SEPARATORS,
    }
}

static NEWLINE_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());
static SPACE_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t]{2,}").unwrap());
static SENTENCE_SPACING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([.!?])([A-Z])").unwrap());

/// Normalize a raw document string before splitting: newline and
/// whitespace runs are collapsed, curly quote glyphs replaced, and a space
/// is guaranteed after sentence-end punctuation preceding a capital.
pub fn preprocess(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let collapsed = NEWLINE_RUNS.replace_all(&unified, "\n\n");
    let collapsed = SPACE_RUNS.replace_all(&collapsed, " ");
    let dequoted = collapsed
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace(['\u{201C}', '\u{201D}'], "\"");
    SENTENCE_SPACING
        .replace_all(&dequoted, "${1} ${2}")
        .into_owned()
}

/// Split a document into ordered, overlap-linked chunks.
///
/// Chunks respect `content.len() <= chunk_size * 2`; split points follow
/// the type-aware separator priority; undersized chunks are merged with
/// their successor; indices are implied by vector order.
pub fn chunk(text: &str, file_type: FileType, params: &ChunkParams) -> Vec<TextChunk> {
    let pre = preprocess(text);
    if pre.trim().is_empty() {
        return Vec::new();
    }

    let mut spans = Vec::new();
    split_spans(&pre, 0, pre.len(), separators_for(file_type), params.chunk_size, &mut spans);

    let packed = pack_spans(&pre, &spans, params);
    let merged = merge_undersized(&pre, packed, params);

    merged
        .into_iter()
        .map(|(start, end)| TextChunk {
            content: pre[start..end].to_string(),
            start,
            end,
        })
        .collect()
}

/// Recursively decompose `[start, end)` into spans no longer than `max`,
/// trying each separator in priority order. A span with no usable
/// separator is hard-cut at char boundaries.
fn split_spans(
    text: &str,
    start: usize,
    end: usize,
    seps: &[&str],
    max: usize,
    out: &mut Vec<(usize, usize)>,
) {
    if end - start <= max {
        out.push((start, end));
        return;
    }

    for (rank, sep) in seps.iter().enumerate() {
        if sep.is_empty() {
            hard_cut(text, start, end, max, out);
            return;
        }
        if !text[start..end].contains(sep) {
            continue;
        }

        // Split at every occurrence; the separator stays attached to the
        // preceding piece so offsets stay contiguous.
        let remaining = &seps[rank + 1..];
        let mut piece_start = start;
        loop {
            match text[piece_start..end].find(sep) {
                Some(rel) => {
                    let piece_end = piece_start + rel + sep.len();
                    if piece_end - piece_start <= max {
                        out.push((piece_start, piece_end));
                    } else {
                        split_spans(text, piece_start, piece_end, remaining, max, out);
                    }
                    piece_start = piece_end;
                    if piece_start >= end {
                        return;
                    }
                }
                None => {
                    if end - piece_start <= max {
                        out.push((piece_start, end));
                    } else {
                        split_spans(text, piece_start, end, remaining, max, out);
                    }
                    return;
                }
            }
        }
    }

    // Separator lists always terminate with "", so this is unreachable for
    // well-formed tables; keep the span rather than lose text.
    out.push((start, end));
}

fn hard_cut(text: &str, start: usize, end: usize, max: usize, out: &mut Vec<(usize, usize)>) {
    let mut cursor = start;
    while cursor < end {
        let mut cut = (cursor + max).min(end);
        while cut < end && !text.is_char_boundary(cut) {
            cut += 1;
        }
        out.push((cursor, cut));
        cursor = cut;
    }
}

/// Greedily assemble atomic spans into chunks of at most `chunk_size`
/// characters, backing each new chunk's start up by `chunk_overlap` into
/// the previous one. The first span of a chunk is accepted unconditionally
/// (atomic spans are already bounded, so content stays under twice the
/// chunk size).
fn pack_spans(text: &str, spans: &[(usize, usize)], params: &ChunkParams) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut cur: Option<(usize, usize)> = None;

    for &(a, b) in spans {
        match cur {
            None => cur = Some((a, b)),
            Some((s, e)) => {
                if b - s <= params.chunk_size {
                    cur = Some((s, b));
                } else {
                    out.push((s, e));
                    let mut next_start = e.saturating_sub(params.chunk_overlap);
                    if next_start <= s {
                        next_start = s + 1;
                    }
                    while next_start < text.len() && !text.is_char_boundary(next_start) {
                        next_start += 1;
                    }
                    cur = Some((next_start, b));
                }
            }
        }
    }

    if let Some(span) = cur {
        out.push(span);
    }
    out
}

/// Merge chunks whose trimmed content falls below `min_chunk_size` into
/// their successor, skipping the merged successor. The last chunk may stay
/// undersized when no successor exists. A merge that would breach the
/// `2 * chunk_size` bound is skipped.
fn merge_undersized(
    text: &str,
    chunks: Vec<(usize, usize)>,
    params: &ChunkParams,
) -> Vec<(usize, usize)> {
    let mut out = Vec::with_capacity(chunks.len());
    let mut i = 0;
    while i < chunks.len() {
        let (s, e) = chunks[i];
        let undersized = text[s..e].trim().len() < params.min_chunk_size;
        if undersized && i + 1 < chunks.len() {
            let (_, succ_end) = chunks[i + 1];
            if succ_end - s <= params.chunk_size * 2 {
                out.push((s, succ_end));
                i += 2;
                continue;
            }
        }
        out.push((s, e));
        i += 1;
    }
    out
}
