use thiserror::Error;

#[derive(Debug, Error)]
pub enum SplitError {
    #[error("record truncated inside an escape sequence")]
    TruncatedEscape,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Copy,
    // Copy variant entered right after a ':' separator, so a second ':'
    // yields an empty field instead of being swallowed.
    AfterSep,
    Esc,
    Hex,
    Uni,
}

/// Expand all escape sequences in a raw record body and split it into
/// `:`-separated fields.
///
/// Escapes: `\xHH` is the scalar U+00HH, `\uHHHH` is a UTF-16 code unit
/// (paired surrogates combine), and `\c` is `c` itself. A trailing `:`
/// produces a final empty field. A line ending mid-escape is a structural
/// error.
pub fn split_fields(line: &[u8]) -> Result<Vec<String>, SplitError> {
    let mut fields: Vec<String> = Vec::with_capacity(8);
    let mut cur: Vec<u8> = Vec::new();
    let mut digits: Vec<u8> = Vec::with_capacity(4);
    let mut pending_high: Option<u32> = None;

    let push_char = |cur: &mut Vec<u8>, code: u32| {
        let ch = char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER);
        let mut utf8 = [0u8; 4];
        cur.extend_from_slice(ch.encode_utf8(&mut utf8).as_bytes());
    };

    let mut state = State::Copy;
    for &b in line {
        match state {
            State::Copy => {
                if b == b'\\' {
                    state = State::Esc;
                } else if b == b':' {
                    fields.push(take_field(&mut cur));
                    state = State::AfterSep;
                } else {
                    cur.push(b);
                }
            }
            State::AfterSep => {
                if b == b'\\' {
                    state = State::Esc;
                } else if b == b':' {
                    fields.push(String::new());
                } else {
                    cur.push(b);
                    state = State::Copy;
                }
            }
            State::Esc => {
                if b == b'x' {
                    digits.clear();
                    state = State::Hex;
                } else if b == b'u' {
                    digits.clear();
                    state = State::Uni;
                } else {
                    cur.push(b);
                    state = State::Copy;
                }
            }
            State::Hex => {
                digits.push(b);
                if digits.len() == 2 {
                    let code = hex_value(&digits);
                    push_char(&mut cur, code);
                    state = State::Copy;
                }
            }
            State::Uni => {
                digits.push(b);
                if digits.len() == 4 {
                    let mut code = hex_value(&digits);
                    if let Some(high) = pending_high.take() {
                        code = code.wrapping_sub(0xdc00) + high + 0x10000;
                    }
                    if (0xd800..=0xdfff).contains(&code) {
                        pending_high = Some((code - 0xd800) * 0x400);
                    } else {
                        push_char(&mut cur, code);
                    }
                    state = State::Copy;
                }
            }
        }
    }

    match state {
        State::Copy if !cur.is_empty() => fields.push(take_field(&mut cur)),
        State::Copy => {}
        State::AfterSep => fields.push(String::new()),
        State::Esc | State::Hex | State::Uni => return Err(SplitError::TruncatedEscape),
    }

    Ok(fields)
}

fn take_field(cur: &mut Vec<u8>) -> String {
    let bytes = std::mem::take(cur);
    String::from_utf8_lossy(&bytes).into_owned()
}

fn hex_value(digits: &[u8]) -> u32 {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| u32::from_str_radix(s, 16).ok())
        .unwrap_or(0)
}
