//! Byte dump used when frame logging is enabled.

use std::fmt::Write as _;

/// Render bytes with printable ASCII (32–126) verbatim and everything
/// else as `<HH>`, preserving count and order.
pub fn dump_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        if (32..=126).contains(&b) {
            out.push(b as char);
        } else {
            let _ = write!(out, "<{b:02X}>");
        }
    }
    out
}
