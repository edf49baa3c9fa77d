//! Streaming `multipart/form-data` reader and small form decoding.
//!
//! Part bodies are streamed through [`Read`] with a holdback of one delimiter
//! length, so a firmware image never has to fit in memory.

use std::collections::HashMap;
use std::io::{self, Read};

const HEADER_LIMIT: usize = 4096;
const FILL_CHUNK: usize = 1024;

/// `boundary` parameter of a multipart content type.
pub fn boundary(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|b| !b.is_empty())
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartInfo {
    pub name: Option<String>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Preamble,
    Body,
    BetweenParts,
    Done,
}

pub struct Multipart<'r> {
    source: &'r mut dyn Read,
    delimiter: Vec<u8>,
    pending: Vec<u8>,
    ready: usize,
    state: State,
}

impl<'r> Multipart<'r> {
    pub fn new(source: &'r mut dyn Read, boundary: &str) -> Self {
        let mut delimiter = b"\r\n--".to_vec();
        delimiter.extend_from_slice(boundary.as_bytes());
        Self {
            source,
            delimiter,
            // Lets the first boundary line match the same delimiter as the rest.
            pending: b"\r\n".to_vec(),
            ready: 0,
            state: State::Preamble,
        }
    }

    /// Advances to the next part, discarding whatever is left of the current one.
    pub fn next_part(&mut self) -> io::Result<Option<PartInfo>> {
        let mut sink = [0u8; 256];
        while self.state == State::Body {
            if self.read(&mut sink)? == 0 {
                break;
            }
        }

        if self.state == State::Preamble {
            loop {
                if let Some(i) = find(&self.pending, &self.delimiter) {
                    self.pending.drain(..i + self.delimiter.len());
                    break;
                }
                let keep = self.delimiter.len();
                if self.pending.len() > keep {
                    self.pending.drain(..self.pending.len() - keep);
                }
                if !self.fill()? {
                    return Err(truncated("no opening boundary"));
                }
            }
            self.state = State::BetweenParts;
        }

        if self.state == State::Done {
            return Ok(None);
        }

        while self.pending.len() < 2 {
            if !self.fill()? {
                return Err(truncated("missing part header"));
            }
        }
        if self.pending.starts_with(b"--") {
            self.state = State::Done;
            return Ok(None);
        }

        let end = loop {
            if let Some(i) = find(&self.pending, b"\r\n\r\n") {
                break i;
            }
            if self.pending.len() > HEADER_LIMIT {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "part header too long"));
            }
            if !self.fill()? {
                return Err(truncated("unterminated part header"));
            }
        };
        let headers = String::from_utf8_lossy(&self.pending[..end]).into_owned();
        self.pending.drain(..end + 4);
        self.ready = 0;
        self.state = State::Body;
        Ok(Some(parse_headers(&headers)))
    }

    /// Advances to the first part that carries a filename.
    pub fn next_file(&mut self) -> io::Result<Option<PartInfo>> {
        while let Some(part) = self.next_part()? {
            if part.filename.is_some() {
                return Ok(Some(part));
            }
        }
        Ok(None)
    }

    fn fill(&mut self) -> io::Result<bool> {
        let mut chunk = [0u8; FILL_CHUNK];
        let n = loop {
            match self.source.read(&mut chunk) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        self.pending.extend_from_slice(&chunk[..n]);
        Ok(n > 0)
    }
}

/// Reads the body of the current part; `Ok(0)` at its closing boundary.
impl Read for Multipart<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.ready > 0 {
                let n = self.ready.min(out.len());
                out[..n].copy_from_slice(&self.pending[..n]);
                self.pending.drain(..n);
                self.ready -= n;
                return Ok(n);
            }
            if self.state != State::Body {
                return Ok(0);
            }
            match find(&self.pending, &self.delimiter) {
                Some(0) => {
                    self.pending.drain(..self.delimiter.len());
                    self.state = State::BetweenParts;
                    return Ok(0);
                }
                Some(i) => self.ready = i,
                None => {
                    let keep = self.delimiter.len() - 1;
                    if self.pending.len() > keep {
                        self.ready = self.pending.len() - keep;
                    } else if !self.fill()? {
                        return Err(truncated("body ended inside a part"));
                    }
                }
            }
        }
    }
}

fn truncated(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, format!("multipart: {}", what))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_headers(block: &str) -> PartInfo {
    let mut info = PartInfo::default();
    for line in block.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("content-disposition") {
            for param in value.split(';').skip(1) {
                if let Some((key, v)) = param.trim().split_once('=') {
                    let v = v.trim().trim_matches('"').to_string();
                    match key.trim() {
                        "name" => info.name = Some(v),
                        "filename" => info.filename = Some(v),
                        _ => {}
                    }
                }
            }
        } else if name.eq_ignore_ascii_case("content-type") {
            info.content_type = Some(value.trim().to_string());
        }
    }
    info
}

/// Text fields of a small form body, urlencoded or multipart.
pub fn form_fields(content_type: Option<&str>, body: &[u8]) -> io::Result<HashMap<String, String>> {
    if let Some(b) = content_type.and_then(boundary) {
        let mut source = body;
        let mut parts = Multipart::new(&mut source, &b);
        let mut fields = HashMap::new();
        while let Some(part) = parts.next_part()? {
            let mut value = Vec::new();
            parts.read_to_end(&mut value)?;
            if let (Some(name), None) = (part.name, part.filename) {
                fields.insert(name, String::from_utf8_lossy(&value).into_owned());
            }
        }
        return Ok(fields);
    }

    let text = std::str::from_utf8(body)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(text
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (percent_decode(k), percent_decode(v))
        })
        .collect())
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 2;
                    }
                    _ => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hands out at most `step` bytes per read.
    struct Trickle<'a> {
        data: &'a [u8],
        step: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(out.len()).min(self.data.len());
            out[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    fn body(file: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(b"--XyZ\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nhello\r\n");
        body.extend_from_slice(
            b"--XyZ\r\nContent-Disposition: form-data; name=\"firmware\"; filename=\"fw.bin\"\r\n\
              Content-Type: application/octet-stream\r\n\r\n",
        );
        body.extend_from_slice(file);
        body.extend_from_slice(b"\r\n--XyZ--\r\n");
        body
    }

    #[test]
    fn boundary_from_content_type() {
        assert_eq!(
            boundary("multipart/form-data; boundary=----WebKit123").as_deref(),
            Some("----WebKit123")
        );
        assert_eq!(boundary("multipart/form-data; boundary=\"q\"").as_deref(), Some("q"));
        assert_eq!(boundary("application/json"), None);
    }

    #[test]
    fn streams_file_part_across_tiny_reads() {
        // Contains a partial delimiter that must not end the part.
        let file: Vec<u8> = b"\xE9\x01binary\r\n--Xy not a boundary\r\n-"
            .iter()
            .copied()
            .chain((0..=255u8).cycle().take(3000))
            .collect();
        let data = body(&file);
        for step in [1, 3, 7, 64, 4096] {
            let mut source = Trickle { data: &data, step };
            let mut parts = Multipart::new(&mut source, "XyZ");
            let part = parts.next_file().unwrap().unwrap();
            assert_eq!(part.filename.as_deref(), Some("fw.bin"));
            assert_eq!(part.name.as_deref(), Some("firmware"));
            let mut out = Vec::new();
            parts.read_to_end(&mut out).unwrap();
            assert_eq!(out, file, "step {}", step);
            assert!(parts.next_part().unwrap().is_none());
        }
    }

    #[test]
    fn truncated_body_is_an_error() {
        let mut data = body(b"abcdef");
        data.truncate(data.len() - 12);
        let mut source: &[u8] = &data;
        let mut parts = Multipart::new(&mut source, "XyZ");
        parts.next_file().unwrap().unwrap();
        let mut out = Vec::new();
        assert_eq!(
            parts.read_to_end(&mut out).unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );
    }

    #[test]
    fn form_fields_from_urlencoded() {
        let fields = form_fields(
            Some("application/x-www-form-urlencoded"),
            b"ssid=My+Net%21&pass=p%26ss",
        )
        .unwrap();
        assert_eq!(fields["ssid"], "My Net!");
        assert_eq!(fields["pass"], "p&ss");
    }

    #[test]
    fn form_fields_from_multipart_skip_files() {
        let data = body(b"ignored");
        let fields = form_fields(Some("multipart/form-data; boundary=XyZ"), &data).unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["note"], "hello");
    }
}
