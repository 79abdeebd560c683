use thiserror::Error;

/// The four data-record op codes. Context ops (`~ @ $ !`) are routed by the
/// ingest loop and never reach aggregators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordOp {
    Get,
    Set,
    Call,
    New,
}

impl RecordOp {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'g' => Some(RecordOp::Get),
            b's' => Some(RecordOp::Set),
            b'c' => Some(RecordOp::Call),
            b'n' => Some(RecordOp::New),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            RecordOp::Get => b'g',
            RecordOp::Set => b's',
            RecordOp::Call => b'c',
            RecordOp::New => b'n',
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordOp::Get => "g",
            RecordOp::Set => "s",
            RecordOp::Call => "c",
            RecordOp::New => "n",
        }
    }
}

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("record has {got} fields, expected at least {want}")]
    MissingFields { want: usize, got: usize },
    #[error("invalid script offset '{0}'")]
    BadOffset(String),
}

/// Remove one bracketing `{`/`}` pair if present.
pub fn strip_curlies(s: &str) -> Option<&str> {
    s.strip_prefix('{')?.strip_suffix('}')
}

/// Remove one bracketing `"` pair if present.
pub fn strip_quotes(s: &str) -> Option<&str> {
    if s.len() >= 2 {
        s.strip_prefix('"')?.strip_suffix('"')
    } else {
        None
    }
}

pub fn uncurlied(s: &str) -> &str {
    strip_curlies(s).unwrap_or(s)
}

pub fn unquoted(s: &str) -> &str {
    strip_quotes(s).unwrap_or(s)
}

/// A receiver with a `,` is a comma-separated type chain; the component
/// after the first comma names the concrete class.
pub fn receiver_class(s: &str) -> &str {
    if s.contains(',') {
        s.split(',').nth(1).unwrap_or(s)
    } else {
        s
    }
}

/// Member names that are never worth aggregating: V8 noise markers and
/// numeric (index) properties.
pub fn filter_name(name: &str) -> bool {
    name == "?" || name == "<anonymous>" || name.parse::<i64>().is_ok()
}

/// The uniform (offset, receiver, member, args) view of a data record,
/// cooked per the field layout of its op.
#[derive(Debug)]
pub struct ApiAccess<'f> {
    pub offset: i64,
    pub receiver: &'f str,
    pub member: &'f str,
    pub args: &'f [String],
}

impl<'f> ApiAccess<'f> {
    pub fn from_fields(op: RecordOp, fields: &'f [String]) -> Result<Self, AccessError> {
        let want = match op {
            RecordOp::New => 2,
            _ => 3,
        };
        if fields.len() < want {
            return Err(AccessError::MissingFields { want, got: fields.len() });
        }
        let offset = fields[0]
            .parse::<i64>()
            .map_err(|_| AccessError::BadOffset(fields[0].clone()))?;

        let (receiver, member, args) = match op {
            RecordOp::Get | RecordOp::Set => (
                uncurlied(&fields[1]),
                unquoted(&fields[2]),
                &fields[3..],
            ),
            RecordOp::Call => (
                uncurlied(&fields[2]),
                unquoted(&fields[1]).trim_start_matches('%'),
                &fields[3..],
            ),
            RecordOp::New => (
                uncurlied(&fields[1]).trim_start_matches('%'),
                "",
                &fields[2..],
            ),
        };

        Ok(ApiAccess {
            offset,
            receiver: receiver_class(receiver),
            member,
            args,
        })
    }

    /// `Receiver.member`, or just the receiver for constructor records.
    pub fn full_name(&self) -> String {
        if self.member.is_empty() {
            self.receiver.to_string()
        } else {
            format!("{}.{}", self.receiver, self.member)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn cooks_get_record() {
        let f = fields(&["27", "{Window}", "\"foo\""]);
        let a = ApiAccess::from_fields(RecordOp::Get, &f).unwrap();
        assert_eq!(a.offset, 27);
        assert_eq!(a.receiver, "Window");
        assert_eq!(a.member, "foo");
        assert!(a.args.is_empty());
    }

    #[test]
    fn cooks_call_record_with_intrinsic_prefix() {
        let f = fields(&["3", "\"%getElementById\"", "{HTMLDocument}", "\"x\""]);
        let a = ApiAccess::from_fields(RecordOp::Call, &f).unwrap();
        assert_eq!(a.member, "getElementById");
        assert_eq!(a.receiver, "HTMLDocument");
        assert_eq!(a.args, ["\"x\""]);
    }

    #[test]
    fn receiver_chain_uses_second_component() {
        let f = fields(&["0", "{Node,HTMLScriptElement}", "\"src\"", "\"http://x/\""]);
        let a = ApiAccess::from_fields(RecordOp::Set, &f).unwrap();
        assert_eq!(a.receiver, "HTMLScriptElement");
        assert_eq!(a.args, ["\"http://x/\""]);
    }

    #[test]
    fn constructor_record_has_no_member() {
        let f = fields(&["12", "{%Promise}"]);
        let a = ApiAccess::from_fields(RecordOp::New, &f).unwrap();
        assert_eq!(a.receiver, "Promise");
        assert_eq!(a.full_name(), "Promise");
    }

    #[test]
    fn rejects_short_and_non_numeric_records() {
        let f = fields(&["1", "{Window}"]);
        assert!(ApiAccess::from_fields(RecordOp::Get, &f).is_err());
        let f = fields(&["x", "{Window}", "\"foo\""]);
        assert!(matches!(
            ApiAccess::from_fields(RecordOp::Get, &f),
            Err(AccessError::BadOffset(_))
        ));
    }

    #[test]
    fn filters_useless_names() {
        assert!(filter_name("?"));
        assert!(filter_name("<anonymous>"));
        assert!(filter_name("42"));
        assert!(filter_name("-1"));
        assert!(!filter_name("length"));
        assert!(!filter_name(""));
    }
}
