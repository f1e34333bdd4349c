use crate::ext::ByteSlice;
use crate::Error;

/// Upper bound for the header block of a single part.
const MAX_HEADERS: usize = 16 * 1024;
/// Upper bound for the remainder of a boundary line.
const MAX_BOUNDARY_LINE: usize = 1024;


/// Extracts the `boundary` parameter from a `multipart/*` content type.
///
/// The parameter name is matched case-insensitively. Quoted values may
/// contain `;` and backslash escapes. Returns [`None`] if there is no
/// boundary or it is empty.
#[must_use]
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    split_params(content_type.as_bytes()).into_iter().skip(1).find_map(|param| {
        let (key, value) = param.split_once_byte(b'=')?;
        if !key.trim_ws().eq_ignore_ascii_case(b"boundary") {
            return None;
        }
        let value = unquote(value.trim_ws());
        (!value.is_empty()).then(|| lossy(&value))
    })
}


/// Metadata of a single part, taken from its headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartInfo {
    /// The form field name from `Content-Disposition`.
    pub name: String,
    /// The file name from `Content-Disposition`, present for file uploads.
    pub filename: Option<String>,
    /// The value of the part's `Content-Type` header.
    pub content_type: Option<String>,
}

/// A receiver for the parts found by a [`MultipartParser`].
///
/// For every part, `begin_part` is called once, then `part_data` any number
/// of times with consecutive pieces of the body, and finally `end_part`.
pub trait PartSink {
    /// Starts a new part.
    ///
    /// # Errors
    /// Errors abort parsing and are returned from `MultipartParser::feed`.
    fn begin_part(&mut self, part: &PartInfo) -> Result<(), Error>;

    /// Receives the next piece of the current part's body.
    ///
    /// # Errors
    /// Errors abort parsing and are returned from `MultipartParser::feed`.
    fn part_data(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Ends the current part.
    ///
    /// # Errors
    /// Errors abort parsing and are returned from `MultipartParser::feed`.
    fn end_part(&mut self) -> Result<(), Error>;
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Searching for the first boundary.
    Preamble,
    /// After a boundary, which is either followed by `--` or by a line break.
    AfterBoundary,
    /// Collecting a part's header block.
    Headers,
    /// Passing through a part's body until the next boundary.
    Body,
    /// After the closing boundary. Anything else is epilogue.
    Done,
}

/// A streaming `multipart/form-data` parser.
///
/// Input can be fed in chunks of any size. Bytes which could be the start of
/// a boundary are carried over to the next call. Part bodies are never
/// buffered beyond that and are passed on to a [`PartSink`] as they arrive.
#[derive(Debug, Clone)]
pub struct MultipartParser {
    /// `\r\n--` followed by the boundary.
    delimiter: Vec<u8>,
    state: State,
    carry: Vec<u8>,
    consumed: u64,
}

impl MultipartParser {
    /// Creates a parser for a body with the given boundary.
    #[must_use]
    pub fn new(boundary: &str) -> Self {
        let mut delimiter = Vec::with_capacity(boundary.len() + 4);
        delimiter.extend_from_slice(b"\r\n--");
        delimiter.extend_from_slice(boundary.as_bytes());
        Self { delimiter, state: State::Preamble, carry: Vec::new(), consumed: 0 }
    }

    /// Returns the total number of bytes passed to `MultipartParser::feed`.
    #[inline]
    #[must_use]
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Tests whether the closing boundary was found.
    #[inline]
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Parses the next chunk of the body.
    ///
    /// # Errors
    /// Fails with [`Error::InvalidMultipart`] on malformed boundary lines or
    /// oversized part headers. Errors from `sink` are forwarded.
    pub fn feed(&mut self, data: &[u8], sink: &mut impl PartSink) -> Result<(), Error> {
        self.consumed += data.len() as u64;
        if self.state == State::Done {
            return Ok(());
        }
        self.carry.extend_from_slice(data);

        let res = self.parse_carry(sink);
        let pos = match res {
            Ok(pos) => pos,
            Err((pos, e)) => {
                self.carry.drain(..pos);
                return Err(e);
            },
        };
        self.carry.drain(..pos);
        Ok(())
    }

    /// Parses as much of `self.carry` as possible, returning how many bytes
    /// were used up.
    fn parse_carry(&mut self, sink: &mut impl PartSink) -> Result<usize, (usize, Error)> {
        let carry = &self.carry;
        let delimiter = &self.delimiter[..];
        let mut pos = 0;
        loop {
            let rest = &carry[pos..];
            match self.state {
                State::Preamble => {
                    let dash_boundary = &delimiter[2..];
                    if let Some(i) = rest.find(dash_boundary) {
                        pos += i + dash_boundary.len();
                        self.state = State::AfterBoundary;
                    } else {
                        // The tail may be the start of the boundary
                        return Ok(carry.len() - rest.len().min(dash_boundary.len() - 1));
                    }
                },

                State::AfterBoundary => {
                    if rest.len() < 2 {
                        return Ok(pos);
                    }
                    if rest.starts_with(b"--") {
                        self.state = State::Done;
                        return Ok(carry.len());
                    }
                    let Some(eol) = rest.find(b"\r\n") else {
                        if rest.len() > MAX_BOUNDARY_LINE {
                            return Err((pos, Error::InvalidMultipart("boundary line too long")));
                        }
                        return Ok(pos);
                    };
                    if !rest[..eol].iter().all(|&b| b == b' ' || b == b'\t') {
                        return Err((pos, Error::InvalidMultipart("unexpected data after boundary")));
                    }
                    pos += eol + 2;
                    self.state = State::Headers;
                },

                State::Headers => {
                    let (block, used) = if rest.starts_with(b"\r\n") {
                        (&rest[..0], 2)
                    } else if let Some(end) = rest.find(b"\r\n\r\n") {
                        (&rest[..end], end + 4)
                    } else if rest.len() > MAX_HEADERS {
                        return Err((pos, Error::InvalidMultipart("part headers too large")));
                    } else {
                        return Ok(pos);
                    };
                    let info = parse_part_headers(block);
                    crate::macros::trace!(?info, "multipart part started");
                    sink.begin_part(&info).map_err(|e| (pos, e))?;
                    pos += used;
                    self.state = State::Body;
                },

                State::Body => {
                    if let Some(i) = rest.find(delimiter) {
                        if i > 0 {
                            sink.part_data(&rest[..i]).map_err(|e| (pos, e))?;
                        }
                        sink.end_part().map_err(|e| (pos, e))?;
                        pos += i + delimiter.len();
                        self.state = State::AfterBoundary;
                    } else {
                        // Hold back what could be the start of the delimiter
                        let safe = rest.len().saturating_sub(delimiter.len() - 1);
                        if safe > 0 {
                            sink.part_data(&rest[..safe]).map_err(|e| (pos, e))?;
                        }
                        return Ok(pos + safe);
                    }
                },

                State::Done => return Ok(carry.len()),
            }
        }
    }

    /// Ends the body.
    ///
    /// # Errors
    /// Fails with [`Error::MultipartFormBoundaryNotFound`] unless the closing
    /// boundary was seen, including when the body ended inside a part.
    pub fn finish(&mut self) -> Result<(), Error> {
        self.carry.clear();
        if self.state == State::Done {
            Ok(())
        } else {
            Err(Error::MultipartFormBoundaryNotFound)
        }
    }
}


fn lossy(b: &[u8]) -> String {
    String::from_utf8_lossy(b).into_owned()
}

/// Splits a header value at `;`, ignoring separators inside quoted strings.
fn split_params(value: &[u8]) -> Vec<&[u8]> {
    let mut params = Vec::new();
    let (mut start, mut quoted, mut escaped) = (0, false, false);
    for (i, &b) in value.iter().enumerate() {
        match b {
            _ if escaped => escaped = false,
            b'\\' if quoted => escaped = true,
            b'"' => quoted = !quoted,
            b';' if !quoted => {
                params.push(&value[start..i]);
                start = i + 1;
            },
            _ => {},
        }
    }
    params.push(&value[start..]);
    params
}

/// Removes surrounding quotes and backslash escapes from a parameter value.
fn unquote(value: &[u8]) -> Vec<u8> {
    let Some(inner) = value.strip_prefix(b"\"").and_then(|v| v.strip_suffix(b"\"")) else {
        return value.to_vec();
    };
    let mut out = Vec::with_capacity(inner.len());
    let mut escaped = false;
    for &b in inner {
        if !escaped && b == b'\\' {
            escaped = true;
            continue;
        }
        escaped = false;
        out.push(b);
    }
    out
}

fn parse_part_headers(block: &[u8]) -> PartInfo {
    let mut info = PartInfo::default();
    for line in block.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some((name, value)) = line.split_once_byte(b':') else {
            continue;
        };
        let name = name.trim_ws();
        if name.eq_ignore_ascii_case(b"content-disposition") {
            for param in split_params(value).into_iter().skip(1) {
                let Some((key, val)) = param.split_once_byte(b'=') else {
                    continue;
                };
                let key = key.trim_ws();
                let val = lossy(&unquote(val.trim_ws()));
                if key.eq_ignore_ascii_case(b"name") {
                    info.name = val;
                } else if key.eq_ignore_ascii_case(b"filename") {
                    info.filename = Some(val);
                }
            }
        } else if name.eq_ignore_ascii_case(b"content-type") {
            info.content_type = Some(lossy(value.trim_ws()));
        }
    }
    info
}
