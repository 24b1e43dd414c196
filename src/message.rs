use std::collections::BTreeMap;

/// Mail headers with case-insensitive names.
///
/// Names are folded to ASCII lowercase on insert.
/// Every value is kept in arrival order;
/// [`HeaderMap::get`] returns the first one,
/// the same way a mail reader treats a repeated header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: BTreeMap<String, Vec<String>>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value for the named header.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.entries
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    /// Get the first value of the named header.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).first().map(String::as_str)
    }

    /// Get every value of the named header, in arrival order.
    pub fn get_all(&self, name: &str) -> &[String] {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    /// The folded names of all headers present.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = HeaderMap::new();
        for (name, value) in iter {
            map.insert(name.as_ref(), value);
        }
        map
    }
}

/// A message as received in the `DATA` command,
/// split into its header block and body.
#[derive(Clone, Debug)]
pub struct Message {
    headers: HeaderMap,
    body: String,
}

impl Message {
    /// Parse the raw bytes of a message.
    ///
    /// The header block runs up to the first blank line,
    /// everything after it is the body.
    /// Every line of the header block must be a `Name: value` field
    /// or the continuation of one.
    /// Input without any blank line that does not start with a field
    /// has no header block and is all body.
    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Err(ParseError::Empty);
        }
        let (header_end, body_start) = split_header_block(raw)?;
        let headers = if header_end == 0 {
            HeaderMap::new()
        } else {
            let (parsed, _) = mailparse::parse_headers(&raw[..header_end])?;
            parsed
                .iter()
                .map(|header| (header.get_key(), header.get_value()))
                .collect()
        };
        Ok(Message {
            headers,
            body: String::from_utf8_lossy(&raw[body_start..]).into_owned(),
        })
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &str {
        &self.body
    }
}

/// Find where the header block ends and where the body starts.
fn split_header_block(raw: &[u8]) -> Result<(usize, usize), ParseError> {
    let mut offset = 0;
    for (index, line) in raw.split_inclusive(|&b| b == b'\n').enumerate() {
        let text = trim_eol(line);
        if text.is_empty() {
            return Ok((offset, offset + line.len()));
        }
        let continuation = text.starts_with(b" ") || text.starts_with(b"\t");
        let valid = if continuation { index > 0 } else { is_field(text) };
        if !valid {
            if index == 0 && !has_blank_line(raw) {
                return Ok((0, 0));
            }
            let line = String::from_utf8_lossy(text).into_owned();
            return Err(ParseError::HeaderLine(line));
        }
        offset += line.len();
    }
    Ok((raw.len(), raw.len()))
}

fn trim_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn has_blank_line(raw: &[u8]) -> bool {
    raw.split_inclusive(|&b| b == b'\n')
        .any(|line| trim_eol(line).is_empty())
}

/// A field line starts with a non-empty name of printable ASCII
/// other than `:`, followed by a colon.
fn is_field(line: &[u8]) -> bool {
    match line.iter().position(|&b| b == b':') {
        Some(colon) if colon > 0 => {
            line[..colon].iter().all(|b| (33..=126).contains(b))
        }
        _ => false,
    }
}

/// An error while parsing a received message.
#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("empty message")]
    Empty,
    #[error("malformed header line {0:?}")]
    HeaderLine(String),
    #[error(transparent)]
    Malformed(#[from] mailparse::MailParseError),
}
