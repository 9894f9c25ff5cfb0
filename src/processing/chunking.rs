//! Fixed-window character chunking.
//!
//! Windows are `chunk_size` characters wide and start every `chunk_size - overlap` characters, so
//! consecutive chunks share exactly `overlap` characters. The last window is cut at the end of the
//! text. Windows that contain only whitespace are dropped.

use super::types::ChunkingError;

/// Split `text` into overlapping windows.
pub fn chunk_text(
    text: &str,
    chunk_size: usize,
    overlap: usize,
) -> Result<Vec<String>, ChunkingError> {
    if chunk_size == 0 {
        return Err(ChunkingError::InvalidChunkSize);
    }
    if overlap >= chunk_size {
        return Err(ChunkingError::InvalidOverlap {
            overlap,
            chunk_size,
        });
    }
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    // Byte offset of every char boundary, plus the end of the text.
    let boundaries: Vec<usize> = text
        .char_indices()
        .map(|(offset, _)| offset)
        .chain(std::iter::once(text.len()))
        .collect();
    let char_count = boundaries.len() - 1;
    let step = chunk_size - overlap;

    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + chunk_size).min(char_count);
        let window = &text[boundaries[start]..boundaries[end]];
        if !window.trim().is_empty() {
            chunks.push(window.to_string());
        }
        if end == char_count {
            break;
        }
        start += step;
    }

    Ok(chunks)
}
