//! Byte pattern matching used by the match/mask peek variants.

/// Returns true if `input` starts with `pattern` under `mask`.
///
/// Bytes are compared as `(input & mask) == (pattern & mask)` where a mask byte
/// exists. Pattern bytes past the end of the mask must be equal, and mask bytes
/// past the end of the pattern are ignored. An empty pattern or input never matches.
pub fn matches(input: &[u8], pattern: &[u8], mask: Option<&[u8]>) -> bool {
    if pattern.is_empty() || input.len() < pattern.len() {
        return false;
    }
    let mask = mask.unwrap_or(&[]);
    pattern.iter().zip(input).enumerate().all(|(i, (p, b))| {
        let m = mask.get(i).copied().unwrap_or(0xff);
        (p & m) == (b & m)
    })
}
