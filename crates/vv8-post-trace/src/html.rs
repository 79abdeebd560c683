//! Minimal HTML fragment tokenizer for document.write streams.
//!
//! Covers what script-genesis sniffing needs: start/end tags with
//! attributes, raw text elements (script content is one text run), and
//! comment/doctype skipping. Not a conforming HTML parser.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HtmlToken {
    StartTag {
        name: String,
        attrs: Vec<(String, String)>,
        self_closing: bool,
    },
    EndTag {
        name: String,
    },
    Text(String),
}

#[derive(Debug, Clone)]
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn eof(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn consume(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn consume_while<F: Fn(u8) -> bool>(&mut self, f: F) -> &'a [u8] {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if !f(b) {
                break;
            }
            self.pos += 1;
        }
        &self.bytes[start..self.pos]
    }

    fn starts_with_ignore_case(&self, prefix: &[u8]) -> bool {
        self.bytes.len() >= self.pos + prefix.len()
            && self.bytes[self.pos..self.pos + prefix.len()].eq_ignore_ascii_case(prefix)
    }

    fn find_ignore_case(&self, needle: &[u8]) -> Option<usize> {
        let haystack = &self.bytes[self.pos.min(self.bytes.len())..];
        if needle.is_empty() || haystack.len() < needle.len() {
            return None;
        }
        (0..=haystack.len() - needle.len())
            .find(|&i| haystack[i..i + needle.len()].eq_ignore_ascii_case(needle))
            .map(|i| self.pos + i)
    }
}

fn is_ws(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r' | b'\x0c')
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b':'
}

pub struct HtmlTokenizer<'a> {
    cur: Cursor<'a>,
    // Set after a start tag of a raw-text element; the next token is its
    // entire body up to the matching close tag.
    raw_text_tag: Option<String>,
}

impl<'a> HtmlTokenizer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            cur: Cursor { bytes: input.as_bytes(), pos: 0 },
            raw_text_tag: None,
        }
    }

    pub fn next_token(&mut self) -> Option<HtmlToken> {
        if let Some(tag) = self.raw_text_tag.take() {
            return Some(self.raw_text(&tag));
        }
        loop {
            if self.cur.eof() {
                return None;
            }
            if self.cur.peek() == Some(b'<') {
                if self.cur.starts_with_ignore_case(b"<!--") {
                    self.skip_comment();
                    continue;
                }
                if self.cur.starts_with_ignore_case(b"<!") || self.cur.starts_with_ignore_case(b"<?")
                {
                    self.skip_until(b'>');
                    continue;
                }
                if self.cur.starts_with_ignore_case(b"</") {
                    return self.end_tag();
                }
                if self
                    .cur
                    .bytes
                    .get(self.cur.pos + 1)
                    .is_some_and(|b| b.is_ascii_alphabetic())
                {
                    return self.start_tag();
                }
                // Stray '<' is text.
                self.cur.consume();
                return Some(HtmlToken::Text("<".to_string()));
            }
            let text = self.cur.consume_while(|b| b != b'<');
            let text = String::from_utf8_lossy(text).into_owned();
            if !text.is_empty() {
                return Some(HtmlToken::Text(text));
            }
        }
    }

    fn raw_text(&mut self, tag: &str) -> HtmlToken {
        let close = format!("</{tag}");
        match self.cur.find_ignore_case(close.as_bytes()) {
            Some(end) => {
                let body = &self.cur.bytes[self.cur.pos..end];
                self.cur.pos = end;
                HtmlToken::Text(String::from_utf8_lossy(body).into_owned())
            }
            None => {
                let body = &self.cur.bytes[self.cur.pos..];
                self.cur.pos = self.cur.bytes.len();
                HtmlToken::Text(String::from_utf8_lossy(body).into_owned())
            }
        }
    }

    fn skip_comment(&mut self) {
        self.cur.pos += 4;
        match self.cur.find_ignore_case(b"-->") {
            Some(end) => self.cur.pos = end + 3,
            None => self.cur.pos = self.cur.bytes.len(),
        }
    }

    fn skip_until(&mut self, delim: u8) {
        while let Some(b) = self.cur.consume() {
            if b == delim {
                break;
            }
        }
    }

    fn end_tag(&mut self) -> Option<HtmlToken> {
        self.cur.pos += 2;
        let name = self.cur.consume_while(is_name_byte);
        let name = String::from_utf8_lossy(name).to_ascii_lowercase();
        self.skip_until(b'>');
        if name.is_empty() {
            return self.next_token();
        }
        Some(HtmlToken::EndTag { name })
    }

    fn start_tag(&mut self) -> Option<HtmlToken> {
        self.cur.pos += 1;
        let name = self.cur.consume_while(is_name_byte);
        let name = String::from_utf8_lossy(name).to_ascii_lowercase();
        let mut attrs = Vec::new();
        let mut self_closing = false;
        loop {
            self.cur.consume_while(is_ws);
            match self.cur.peek() {
                None => break,
                Some(b'>') => {
                    self.cur.consume();
                    break;
                }
                Some(b'/') => {
                    self.cur.consume();
                    if self.cur.peek() == Some(b'>') {
                        self.cur.consume();
                        self_closing = true;
                        break;
                    }
                }
                Some(_) => {
                    if let Some(attr) = self.attribute() {
                        attrs.push(attr);
                    }
                }
            }
        }
        if !self_closing && (name == "script" || name == "style") {
            self.raw_text_tag = Some(name.clone());
        }
        Some(HtmlToken::StartTag { name, attrs, self_closing })
    }

    fn attribute(&mut self) -> Option<(String, String)> {
        let key = self
            .cur
            .consume_while(|b| !is_ws(b) && b != b'=' && b != b'>' && b != b'/');
        if key.is_empty() {
            // Unparsable byte; skip it to guarantee progress.
            self.cur.consume();
            return None;
        }
        let key = String::from_utf8_lossy(key).to_ascii_lowercase();
        self.cur.consume_while(is_ws);
        if self.cur.peek() != Some(b'=') {
            return Some((key, String::new()));
        }
        self.cur.consume();
        self.cur.consume_while(is_ws);
        let value = match self.cur.peek() {
            Some(q @ (b'"' | b'\'')) => {
                self.cur.consume();
                let v = self.cur.consume_while(|b| b != q);
                self.cur.consume();
                v
            }
            _ => self.cur.consume_while(|b| !is_ws(b) && b != b'>'),
        };
        Some((key, String::from_utf8_lossy(value).into_owned()))
    }
}

impl<'a> Iterator for HtmlTokenizer<'a> {
    type Item = HtmlToken;

    fn next(&mut self) -> Option<HtmlToken> {
        self.next_token()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(input: &str) -> Vec<HtmlToken> {
        HtmlTokenizer::new(input).collect()
    }

    #[test]
    fn tokenizes_script_include() {
        let toks = tokens("<script src='http://c/r.js'></script>");
        assert_eq!(
            toks,
            vec![
                HtmlToken::StartTag {
                    name: "script".into(),
                    attrs: vec![("src".into(), "http://c/r.js".into())],
                    self_closing: false,
                },
                HtmlToken::Text(String::new()),
                HtmlToken::EndTag { name: "script".into() },
            ]
        );
    }

    #[test]
    fn script_body_is_one_raw_text_run() {
        let toks = tokens("<script>if (a < b) { x(); }</script>after");
        assert_eq!(toks[1], HtmlToken::Text("if (a < b) { x(); }".into()));
        assert_eq!(toks[3], HtmlToken::Text("after".into()));
    }

    #[test]
    fn event_handler_attributes_survive() {
        let toks = tokens("<img src=x onerror=\"alert(1)\">");
        match &toks[0] {
            HtmlToken::StartTag { name, attrs, .. } => {
                assert_eq!(name, "img");
                assert_eq!(
                    attrs,
                    &vec![
                        ("src".to_string(), "x".to_string()),
                        ("onerror".to_string(), "alert(1)".to_string()),
                    ]
                );
            }
            other => panic!("unexpected token {other:?}"),
        }
    }

    #[test]
    fn skips_comments_and_doctype() {
        let toks = tokens("<!doctype html><!-- hi --><p>x</p>");
        assert_eq!(
            toks,
            vec![
                HtmlToken::StartTag { name: "p".into(), attrs: vec![], self_closing: false },
                HtmlToken::Text("x".into()),
                HtmlToken::EndTag { name: "p".into() },
            ]
        );
    }

    #[test]
    fn unterminated_script_body_runs_to_eof() {
        let toks = tokens("<script>var a = 1;");
        assert_eq!(toks[1], HtmlToken::Text("var a = 1;".into()));
    }

    #[test]
    fn stray_angle_bracket_is_text() {
        let toks = tokens("a < b");
        assert_eq!(
            toks,
            vec![HtmlToken::Text("a ".into()), HtmlToken::Text("<".into()), HtmlToken::Text(" b".into())]
        );
    }
}
