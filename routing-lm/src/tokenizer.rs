//! Byte-level vocabulary: one token per byte value.

/// Number of distinct tokens, one per byte value.
pub const VOCAB_SIZE: usize = 256;

/// Lowest code point emitted by [`decode_token`]; everything below is a
/// control character and is rendered as a space.
pub const MIN_PRINTABLE: i64 = 32;

/// Maps a token id to a printable character.
///
/// Ids below 32 (including negative ones) are clamped to a space. Ids that
/// are not Unicode scalar values decode to U+FFFD.
pub fn decode_token(token: i64) -> char {
    let code = token.max(MIN_PRINTABLE);
    u32::try_from(code)
        .ok()
        .and_then(char::from_u32)
        .unwrap_or(char::REPLACEMENT_CHARACTER)
}

pub fn decode_tokens<T: Copy + Into<i64>>(tokens: &[T]) -> String {
    tokens.iter().map(|&t| decode_token(t.into())).collect()
}
