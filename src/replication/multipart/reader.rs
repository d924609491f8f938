//! Streaming `multipart/*` splitter
//!
//! Turns arbitrary byte chunks into part events. At most one boundary's
//! worth of unconsumed body bytes is held back between chunks; everything
//! else is handed out as soon as it is known not to be a boundary.

use std::collections::BTreeMap;

use super::errors::MultipartError;

const CRLFCRLF: &[u8] = b"\r\n\r\n";

/// Headers of one part, keys lowercased.
pub type PartHeaders = BTreeMap<String, String>;

/// What a chunk of input produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartEvent {
    Started(PartHeaders),
    Data(Vec<u8>),
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AtStart,
    InPrologue,
    InHeaders,
    InBody,
    AtEnd,
}

/// Extract the boundary parameter of a multipart content type.
pub fn boundary_from_content_type(content_type: &str) -> Result<String, MultipartError> {
    let mut params = content_type.split(';').map(str::trim);
    let media_type = params.next().unwrap_or_default();
    if !media_type.to_ascii_lowercase().starts_with("multipart/") {
        return Err(MultipartError::NotMultipart(content_type.to_string()));
    }

    for param in params {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        if !key.trim().eq_ignore_ascii_case("boundary") {
            continue;
        }
        let value = value.trim();
        let value = match value.strip_prefix('"') {
            Some(quoted) => quoted
                .strip_suffix('"')
                .ok_or(MultipartError::MissingBoundary)?,
            None => value,
        };
        if value.is_empty() {
            return Err(MultipartError::MissingBoundary);
        }
        return Ok(value.to_string());
    }
    Err(MultipartError::MissingBoundary)
}

/// Incremental multipart parser.
#[derive(Debug)]
pub struct MultipartReader {
    /// `\r\n--<boundary>`
    delimiter: Vec<u8>,
    buffer: Vec<u8>,
    state: State,
}

impl MultipartReader {
    pub fn new(content_type: &str) -> Result<Self, MultipartError> {
        let boundary = boundary_from_content_type(content_type)?;
        let mut delimiter = b"\r\n--".to_vec();
        delimiter.extend_from_slice(boundary.as_bytes());
        Ok(Self {
            delimiter,
            buffer: Vec::new(),
            state: State::AtStart,
        })
    }

    /// True once the closing delimiter has been read.
    pub fn is_finished(&self) -> bool {
        self.state == State::AtEnd
    }

    /// Feed a chunk. Bytes after the closing delimiter are ignored.
    pub fn append(&mut self, data: &[u8]) -> Result<Vec<PartEvent>, MultipartError> {
        let mut events = Vec::new();
        if self.is_finished() || data.is_empty() {
            return Ok(events);
        }
        self.buffer.extend_from_slice(data);

        loop {
            let next = match self.state {
                State::AtStart => self.read_start(),
                State::InPrologue | State::InBody => self.read_body(&mut events),
                State::InHeaders => self.read_headers(&mut events)?,
                State::AtEnd => None,
            };
            match next {
                Some(state) => self.state = state,
                None => break,
            }
            if self.state == State::AtEnd {
                self.buffer.clear();
                break;
            }
            if self.buffer.is_empty() {
                break;
            }
        }
        Ok(events)
    }

    fn read_start(&mut self) -> Option<State> {
        // The first delimiter may open the body without a leading CRLF.
        let opening = &self.delimiter[2..];
        if self.buffer.len() < opening.len() {
            return None;
        }
        if self.buffer.starts_with(opening) {
            self.buffer.drain(..opening.len());
            Some(State::InHeaders)
        } else {
            // Let the prologue search see the delimiter with its CRLF.
            self.buffer.splice(0..0, b"\r\n".iter().copied());
            Some(State::InPrologue)
        }
    }

    fn read_body(&mut self, events: &mut Vec<PartEvent>) -> Option<State> {
        if self.buffer.len() < self.delimiter.len() {
            return None;
        }
        let in_body = self.state == State::InBody;
        match find(&self.buffer, &self.delimiter) {
            Some(at) => {
                if in_body {
                    if at > 0 {
                        events.push(PartEvent::Data(self.buffer[..at].to_vec()));
                    }
                    events.push(PartEvent::Finished);
                }
                self.buffer.drain(..at + self.delimiter.len());
                Some(State::InHeaders)
            }
            None => {
                let keep = self.delimiter.len() - 1;
                let release = self.buffer.len() - keep;
                if in_body && release > 0 {
                    events.push(PartEvent::Data(self.buffer[..release].to_vec()));
                }
                self.buffer.drain(..release);
                None
            }
        }
    }

    fn read_headers(&mut self, events: &mut Vec<PartEvent>) -> Result<Option<State>, MultipartError> {
        if self.buffer.starts_with(b"--") {
            return Ok(Some(State::AtEnd));
        }
        let Some(at) = find(&self.buffer, CRLFCRLF) else {
            return Ok(None);
        };
        let headers = parse_headers(&String::from_utf8_lossy(&self.buffer[..at]))?;
        self.buffer.drain(..at + CRLFCRLF.len());
        events.push(PartEvent::Started(headers));
        Ok(Some(State::InBody))
    }
}

fn parse_headers(block: &str) -> Result<PartHeaders, MultipartError> {
    let mut headers = PartHeaders::new();
    for line in block.trim().split("\r\n").filter(|line| !line.is_empty()) {
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| MultipartError::InvalidHeader(line.to_string()))?;
        headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
    }
    Ok(headers)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTENT_TYPE: &str = "multipart/related; boundary=\"XyZ\"";

    fn body() -> Vec<u8> {
        b"--XyZ\r\nContent-Type: application/json\r\n\r\n{\"_id\":\"d\"}\r\n--XyZ\r\nContent-Disposition: attachment; filename=\"a.txt\"\r\n\r\nhello\r\n--XyZ--\r\n"
            .to_vec()
    }

    fn collect(events: Vec<PartEvent>) -> Vec<(PartHeaders, Vec<u8>)> {
        let mut parts = Vec::new();
        let mut current: Option<(PartHeaders, Vec<u8>)> = None;
        for event in events {
            match event {
                PartEvent::Started(headers) => current = Some((headers, Vec::new())),
                PartEvent::Data(data) => {
                    if let Some((_, body)) = current.as_mut() {
                        body.extend(data);
                    }
                }
                PartEvent::Finished => parts.extend(current.take()),
            }
        }
        parts
    }

    #[test]
    fn test_boundary_parsing() {
        assert_eq!(boundary_from_content_type(CONTENT_TYPE).unwrap(), "XyZ");
        assert_eq!(
            boundary_from_content_type("multipart/related;boundary=abc; type=x").unwrap(),
            "abc"
        );
        assert_eq!(
            boundary_from_content_type("multipart/related").unwrap_err(),
            MultipartError::MissingBoundary
        );
        assert_eq!(
            boundary_from_content_type("multipart/related; boundary=\"\"").unwrap_err(),
            MultipartError::MissingBoundary
        );
        assert!(matches!(
            boundary_from_content_type("application/json"),
            Err(MultipartError::NotMultipart(_))
        ));
    }

    #[test]
    fn test_single_chunk() {
        let mut reader = MultipartReader::new(CONTENT_TYPE).unwrap();
        let parts = collect(reader.append(&body()).unwrap());
        assert!(reader.is_finished());
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].0["content-type"], "application/json");
        assert_eq!(parts[0].1, b"{\"_id\":\"d\"}");
        assert_eq!(parts[1].0["content-disposition"], "attachment; filename=\"a.txt\"");
        assert_eq!(parts[1].1, b"hello");
    }

    #[test]
    fn test_every_chunk_size_gives_same_parts() {
        let body = body();
        let expected = collect(MultipartReader::new(CONTENT_TYPE).unwrap().append(&body).unwrap());
        for size in 1..body.len() {
            let mut reader = MultipartReader::new(CONTENT_TYPE).unwrap();
            let mut events = Vec::new();
            for chunk in body.chunks(size) {
                events.extend(reader.append(chunk).unwrap());
            }
            assert!(reader.is_finished(), "chunk size {}", size);
            assert_eq!(collect(events), expected, "chunk size {}", size);
        }
    }

    #[test]
    fn test_prologue_is_skipped() {
        let mut input = b"preamble text".to_vec();
        input.extend(b"\r\n");
        input.extend(body());
        let mut reader = MultipartReader::new(CONTENT_TYPE).unwrap();
        let parts = collect(reader.append(&input).unwrap());
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].1, b"hello");
    }

    #[test]
    fn test_truncated_body_is_not_finished() {
        let body = body();
        let mut reader = MultipartReader::new(CONTENT_TYPE).unwrap();
        reader.append(&body[..body.len() - 10]).unwrap();
        assert!(!reader.is_finished());
    }

    #[test]
    fn test_header_without_colon_is_an_error() {
        let mut reader = MultipartReader::new(CONTENT_TYPE).unwrap();
        let err = reader
            .append(b"--XyZ\r\nnot a header\r\n\r\nbody\r\n--XyZ--")
            .unwrap_err();
        assert_eq!(err, MultipartError::InvalidHeader("not a header".into()));
    }

    #[test]
    fn test_part_without_headers() {
        let mut reader = MultipartReader::new(CONTENT_TYPE).unwrap();
        let parts = collect(reader.append(b"--XyZ\r\n\r\nraw\r\n--XyZ--").unwrap());
        assert_eq!(parts.len(), 1);
        assert!(parts[0].0.is_empty());
        assert_eq!(parts[0].1, b"raw");
    }
}
