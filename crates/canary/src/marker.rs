//! Zero-width marker codec.
//!
//! Scheme `zw1` (locked — see the crate docs): a fixed three-character
//! preamble, 64 token bits encoded as ZWSP/ZWNJ, and a word-joiner
//! terminator. The preamble sequence of three distinct zero-width characters
//! in fixed order does not occur in natural text, keeping the benign
//! false-positive rate far below the 0.1% bound.

/// Scheme identifier mixed into stored marker hashes.
pub const SCHEME_ID: &str = "zw1";

/// U+2060 WORD JOINER.
const WJ: char = '\u{2060}';
/// U+200B ZERO WIDTH SPACE — bit 0.
const ZWSP: char = '\u{200B}';
/// U+200C ZERO WIDTH NON-JOINER — bit 1.
const ZWNJ: char = '\u{200C}';

const TOKEN_BITS: usize = 64;

/// Encode a 64-bit token as an invisible marker string.
pub fn encode_marker(token: u64) -> String {
    let mut marker = String::with_capacity((TOKEN_BITS + 4) * 3);
    marker.push(WJ);
    marker.push(ZWSP);
    marker.push(ZWNJ);
    for bit in (0..TOKEN_BITS).rev() {
        marker.push(if (token >> bit) & 1 == 1 { ZWNJ } else { ZWSP });
    }
    marker.push(WJ);
    marker
}

/// Scan `text` for the first well-formed marker and decode its token.
///
/// Every character of the candidate must come from the scheme's zero-width
/// set; any interruption rejects the candidate and the scan continues, so
/// stray zero-width characters in benign text cannot produce a token.
pub fn find_marker(text: &str) -> Option<u64> {
    let chars: Vec<char> = text.chars().collect();
    let total = TOKEN_BITS + 4;
    if chars.len() < total {
        return None;
    }
    for start in 0..=chars.len() - total {
        if chars[start] != WJ || chars[start + 1] != ZWSP || chars[start + 2] != ZWNJ {
            continue;
        }
        if chars[start + 3 + TOKEN_BITS] != WJ {
            continue;
        }
        let mut token = 0u64;
        let mut valid = true;
        for &c in &chars[start + 3..start + 3 + TOKEN_BITS] {
            token = match c {
                ZWSP => token << 1,
                ZWNJ => (token << 1) | 1,
                _ => {
                    valid = false;
                    break;
                }
            };
        }
        if valid {
            return Some(token);
        }
    }
    None
}
