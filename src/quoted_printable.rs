// webfist – email-verified WebFinger delegation
// Copyright © 2023 The webfist authors
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, either version 3 of the License, or (at your option) any later
// version.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.

//! Quoted-Printable body decoding.
//!
//! See RFC 2045, section 6.7. Mail clients routinely send plain-text bodies in
//! this encoding, turning `webfist=http://…` into `webfist=3Dhttp://…` and
//! soft-wrapping long lines with a trailing `=`.

/// Decodes a Quoted-Printable message body.
///
/// Decoding is lenient, as recommended in RFC 2045 for robust decoders: an
/// `=` not followed by two hex digits or a line break is kept as-is. Any body
/// can therefore be passed in, whether it is actually encoded or not; the
/// result is only meaningful for the encoded parts.
pub fn decode_body(body: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(body.len());
    let mut i = 0;

    while i < body.len() {
        let b = body[i];

        if b != b'=' {
            result.push(b);
            i += 1;
            continue;
        }

        let rest = &body[i + 1..];

        if let Some(n) = soft_line_break_len(rest) {
            i += 1 + n;
        } else if let [d1, d2, ..] = *rest {
            if d1.is_ascii_hexdigit() && d2.is_ascii_hexdigit() {
                result.push(u8_from_digits(d1, d2));
                i += 3;
            } else {
                result.push(b'=');
                i += 1;
            }
        } else {
            result.push(b'=');
            i += 1;
        }
    }

    result
}

// Length of a line break (plus any preceding transport padding) at the start
// of `s`. Padding at the very end of the input counts as a line break, too.
fn soft_line_break_len(s: &[u8]) -> Option<usize> {
    let wsp = s.iter().take_while(|&&b| b == b' ' || b == b'\t').count();
    match &s[wsp..] {
        [b'\r', b'\n', ..] => Some(wsp + 2),
        [b'\n', ..] => Some(wsp + 1),
        [] if wsp > 0 => Some(wsp),
        _ => None,
    }
}

fn u8_from_digits(c1: u8, c2: u8) -> u8 {
    // Strictly speaking, only uppercase hex digits are allowed in
    // Quoted-Printable, but there is no harm in accepting lowercase, too.
    fn to_u8(c: u8) -> u8 {
        match c {
            b'0'..=b'9' => c - b'0',
            b'A'..=b'F' => c - b'A' + 0xa,
            b'a'..=b'f' => c - b'a' + 0xa,
            _ => unreachable!(),
        }
    }

    debug_assert!(c1.is_ascii_hexdigit() && c2.is_ascii_hexdigit());

    to_u8(c1) * 0x10 + to_u8(c2)
}
