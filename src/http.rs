use crate::error::{ServerError, ServerResult};
use crate::router::HandlerPos;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::str::{self, FromStr};

/// HTTP Status Codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok = 200,
    Created = 201,
    NoContent = 204,

    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    NotFound = 404,
    MethodNotAllowed = 405,
    RequestTimeout = 408,
    PayloadTooLarge = 413,

    InternalServerError = 500,
    ServiceUnavailable = 503,
}

impl Status {
    /// Get the text description for this status code
    pub fn as_str(&self) -> &'static str {
        match *self {
            Status::Ok => "OK",
            Status::Created => "Created",
            Status::NoContent => "No Content",

            Status::BadRequest => "Bad Request",
            Status::Unauthorized => "Unauthorized",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::MethodNotAllowed => "Method Not Allowed",
            Status::RequestTimeout => "Request Timeout",
            Status::PayloadTooLarge => "Payload Too Large",

            Status::InternalServerError => "Internal Server Error",
            Status::ServiceUnavailable => "Service Unavailable",
        }
    }

    pub fn code(&self) -> u16 {
        *self as u16
    }
}

/// HTTP Methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
}

impl Method {
    /// Convert the method to a string
    pub fn as_str(&self) -> &'static str {
        match *self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
        }
    }
}

impl FromStr for Method {
    type Err = ServerError;

    fn from_str(s: &str) -> ServerResult<Self> {
        match s {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            "OPTIONS" => Ok(Method::Options),
            _ => Err(ServerError::HttpParse(format!("Invalid method: {}", s))),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP Parser State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpParserState {
    RequestLine,
    Body,
    Complete,
}

/// Incremental HTTP/1.1 request parser.
///
/// Bytes are fed as they arrive from the socket; the request line and headers
/// are parsed once the blank line is seen, after which the parser waits for
/// `Content-Length` body bytes.
pub struct HttpParser {
    pub state: HttpParserState,
    pub method: Option<Method>,
    pub uri: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub content_length: usize,
    pending: Vec<u8>,
    max_size: usize,
}

impl HttpParser {
    /// Create a new HTTP parser
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Create a parser that rejects requests larger than `max_size` bytes
    pub fn with_limit(max_size: usize) -> Self {
        Self {
            state: HttpParserState::RequestLine,
            method: None,
            uri: None,
            headers: HashMap::new(),
            body: Vec::new(),
            content_length: 0,
            pending: Vec::new(),
            max_size,
        }
    }

    /// Feed a chunk of data. Returns whether a full request is available.
    pub fn parse(&mut self, data: &[u8]) -> ServerResult<bool> {
        match self.state {
            HttpParserState::Complete => return Ok(true),
            HttpParserState::Body => {
                self.body.extend_from_slice(data);
            }
            HttpParserState::RequestLine => {
                self.pending.extend_from_slice(data);
                if self.pending.len() > self.max_size {
                    return Err(ServerError::RequestTooLarge(self.pending.len()));
                }

                let headers_end = match find_subsequence(&self.pending, b"\r\n\r\n") {
                    Some(pos) => pos,
                    None => return Ok(false),
                };

                let head = str::from_utf8(&self.pending[..headers_end])
                    .map_err(|_| ServerError::HttpParse("Invalid UTF-8".to_string()))?
                    .to_string();
                let mut lines = head.split("\r\n");
                self.parse_request_line(lines.next().unwrap_or_default())?;
                for line in lines.filter(|l| !l.is_empty()) {
                    self.parse_header(line)?;
                }

                if let Some(length) = self.headers.get("content-length") {
                    self.content_length = length.trim().parse().map_err(|_| {
                        ServerError::HttpParse(format!("Invalid Content-Length: {}", length))
                    })?;
                }
                let total = (headers_end + 4)
                    .checked_add(self.content_length)
                    .ok_or(ServerError::RequestTooLarge(usize::MAX))?;
                if total > self.max_size {
                    return Err(ServerError::RequestTooLarge(total));
                }

                let rest = self.pending.split_off(headers_end + 4);
                self.pending.clear();
                self.body = rest;
                self.state = HttpParserState::Body;
            }
        }

        if self.body.len() >= self.content_length {
            self.body.truncate(self.content_length);
            self.state = HttpParserState::Complete;
        }

        Ok(self.is_complete())
    }

    /// Parse a request line
    fn parse_request_line(&mut self, line: &str) -> ServerResult<()> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != 3 || !parts[2].starts_with("HTTP/") {
            return Err(ServerError::HttpParse(format!(
                "Invalid request line: {:?}",
                line
            )));
        }

        self.method = Some(parts[0].parse()?);
        self.uri = Some(parts[1].to_string());

        Ok(())
    }

    /// Parse a header line
    fn parse_header(&mut self, line: &str) -> ServerResult<()> {
        match line.split_once(':') {
            Some((key, value)) => {
                self.headers
                    .insert(key.trim().to_lowercase(), value.trim().to_string());
                Ok(())
            }
            None => Err(ServerError::HttpParse(format!("Invalid header: {:?}", line))),
        }
    }

    /// Check if the parser has completed parsing a request
    pub fn is_complete(&self) -> bool {
        self.state == HttpParserState::Complete
    }

    /// Get the parsed request
    pub fn get_request(&self) -> ServerResult<Request> {
        if !self.is_complete() {
            return Err(ServerError::HttpParse("Request not complete".to_string()));
        }

        let method = self
            .method
            .ok_or_else(|| ServerError::HttpParse("Method not set".to_string()))?;
        let uri = self
            .uri
            .as_deref()
            .ok_or_else(|| ServerError::HttpParse("URI not set".to_string()))?;

        let mut request = Request::new(method, uri);
        request.headers = self.headers.clone();
        request.body = self.body.clone();
        Ok(request)
    }
}

impl Default for HttpParser {
    fn default() -> Self {
        Self::new()
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Decode `+` and `%XX` escapes; malformed escapes are kept verbatim
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => decoded.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or_default();
                match u8::from_str_radix(hex, 16) {
                    Ok(byte) => {
                        decoded.push(byte);
                        i += 2;
                    }
                    Err(_) => decoded.push(b'%'),
                }
            }
            byte => decoded.push(byte),
        }
        i += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

/// Split `a=1&b=2` into a map; keys without `=` map to an empty string
fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (percent_decode(key), percent_decode(value)),
            None => (percent_decode(pair), String::new()),
        })
        .collect()
}

/// HTTP Request
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// The raw request target, query string included
    pub uri: String,
    /// The path portion of the URI
    pub path: String,
    pub query: HashMap<String, String>,
    /// Filled from `:name` segments of the matched route prefix
    pub params: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// Values handed from one handler to the next
    pub locals: HashMap<String, serde_json::Value>,
}

impl Request {
    /// Create a new request
    pub fn new(method: Method, uri: &str) -> Self {
        let (path, query) = match uri.split_once('?') {
            Some((path, query)) => (path, parse_query(query)),
            None => (uri, HashMap::new()),
        };

        Self {
            method,
            uri: uri.to_string(),
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
            query,
            params: HashMap::new(),
            headers: HashMap::new(),
            body: Vec::new(),
            locals: HashMap::new(),
        }
    }

    /// Set a header
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.insert(name.to_lowercase(), value.to_string());
    }

    /// Get a header
    pub fn get_header(&self, name: &str) -> Option<&String> {
        self.headers.get(&name.to_lowercase())
    }

    /// Set the body
    pub fn set_body(&mut self, body: &[u8]) {
        self.body = body.to_vec();
        self.set_header("Content-Length", &self.body.len().to_string());
    }

    /// Set a JSON body
    pub fn set_json<T: Serialize>(&mut self, value: &T) -> ServerResult<()> {
        let body = serde_json::to_vec(value)?;
        self.set_body(&body);
        self.set_header("Content-Type", "application/json");
        Ok(())
    }

    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> ServerResult<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ServerError::BadRequest(format!("Invalid JSON body: {}", e)))
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }
}

/// Whether the terminal write of a response has happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    Open,
    Closed { by: Option<HandlerPos> },
}

/// HTTP Response.
///
/// A response is a write-once channel: headers can be staged while it is
/// open, and exactly one terminal write (`send*` / `end`) closes it. Any later
/// terminal write or header change is returned as an error to the caller
/// and kept in [`Response::violations`].
#[derive(Debug, Clone)]
pub struct Response {
    pub status: Status,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    state: ResponseState,
    writer: Option<HandlerPos>,
    violations: Vec<ServerError>,
}

impl Response {
    /// Create an open response
    pub fn new() -> Self {
        let mut headers = HashMap::new();
        headers.insert("Server".to_string(), "chain-dispatch/0.1".to_string());
        headers.insert("Connection".to_string(), "close".to_string());

        Self {
            status: Status::Ok,
            headers,
            body: Vec::new(),
            state: ResponseState::Open,
            writer: None,
            violations: Vec::new(),
        }
    }

    pub fn state(&self) -> ResponseState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ResponseState::Closed { .. })
    }

    /// The handler whose write closed this response
    pub fn closed_by(&self) -> Option<HandlerPos> {
        match self.state {
            ResponseState::Closed { by } => by,
            ResponseState::Open => None,
        }
    }

    /// Every misuse reported against this response
    pub fn violations(&self) -> &[ServerError] {
        &self.violations
    }

    /// Mark `pos` as the handler currently running; returns the previous one
    pub(crate) fn enter(&mut self, pos: Option<HandlerPos>) -> Option<HandlerPos> {
        std::mem::replace(&mut self.writer, pos)
    }

    /// Stage a header. Fails once the response is closed.
    pub fn set_header(&mut self, name: &str, value: &str) -> ServerResult<()> {
        if self.is_closed() {
            let err = ServerError::HeadersSent {
                name: name.to_string(),
            };
            log::error!("{}", err);
            self.violations.push(err.clone());
            return Err(err);
        }
        self.headers.insert(name.to_string(), value.to_string());
        Ok(())
    }

    /// Terminal write with a plain-text body
    pub fn send_text(&mut self, status: Status, body: &str) -> ServerResult<()> {
        self.close(status, body.as_bytes().to_vec(), Some("text/plain; charset=utf-8"))
    }

    /// Terminal write with a JSON body
    pub fn send_json<T: Serialize>(&mut self, status: Status, value: &T) -> ServerResult<()> {
        let body = serde_json::to_vec(value)?;
        self.close(status, body, Some("application/json"))
    }

    /// Terminal write with raw bytes; Content-Type is left as staged
    pub fn send(&mut self, status: Status, body: &[u8]) -> ServerResult<()> {
        self.close(status, body.to_vec(), None)
    }

    /// Terminal write without a body
    pub fn end(&mut self, status: Status) -> ServerResult<()> {
        self.close(status, Vec::new(), None)
    }

    fn close(
        &mut self,
        status: Status,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> ServerResult<()> {
        if let ResponseState::Closed { by } = self.state {
            let err = ServerError::DoubleResponse {
                first: by,
                second: self.writer,
            };
            log::error!("{}", err);
            self.violations.push(err.clone());
            return Err(err);
        }

        if let Some(content_type) = content_type {
            self.headers
                .entry("Content-Type".to_string())
                .or_insert_with(|| content_type.to_string());
        }
        self.headers
            .insert("Content-Length".to_string(), body.len().to_string());
        self.status = status;
        self.body = body;
        self.state = ResponseState::Closed { by: self.writer };
        Ok(())
    }

    /// Serialize the response to a byte vector
    pub fn serialize(&self, writer: &mut Vec<u8>) -> ServerResult<()> {
        write!(writer, "HTTP/1.1 {} {}\r\n", self.status.code(), self.status.as_str())?;

        let mut names: Vec<&String> = self.headers.keys().collect();
        names.sort();
        for name in names {
            write!(writer, "{}: {}\r\n", name, self.headers[name])?;
        }

        write!(writer, "\r\n")?;
        writer.extend_from_slice(&self.body);

        Ok(())
    }

    pub fn body_str(&self) -> &str {
        str::from_utf8(&self.body).unwrap_or_default()
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}
