//! Minimal STOMP 1.2 frame codec for the text frames exchanged over the
//! realtime WebSocket.

use std::fmt;

use crate::errors::{WalletError, WalletResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    fn parse(line: &str) -> Option<Self> {
        Some(match line {
            "CONNECT" | "STOMP" => Command::Connect,
            "CONNECTED" => Command::Connected,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "DISCONNECT" => Command::Disconnect,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            _ => return None,
        })
    }

    /// CONNECT and CONNECTED headers are sent verbatim.
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn connect(host: &str) -> Self {
        Frame::new(Command::Connect)
            .with_header("accept-version", "1.2")
            .with_header("host", host)
            .with_header("heart-beat", "0,0")
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .with_header("id", id)
            .with_header("destination", destination)
            .with_header("ack", "auto")
    }

    pub fn disconnect() -> Self {
        Frame::new(Command::Disconnect)
    }

    /// First occurrence wins when a header is repeated.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.header("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Decode one frame. A heart-beat (bare end-of-line) yields `None`.
    pub fn decode(text: &str) -> WalletResult<Option<Frame>> {
        let text = text.trim_start_matches(['\r', '\n']);
        if text.is_empty() || text == "\0" {
            return Ok(None);
        }

        let (command_line, mut rest) = split_line(text)
            .ok_or_else(|| malformed("frame has no command line"))?;
        let command = Command::parse(command_line)
            .ok_or_else(|| malformed(&format!("unknown command '{}'", command_line)))?;

        let mut headers = Vec::new();
        loop {
            let (line, remaining) =
                split_line(rest).ok_or_else(|| malformed("unterminated header block"))?;
            rest = remaining;
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| malformed("header without ':'"))?;
            if command.escapes_headers() {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let mut frame = Frame {
            command,
            headers,
            body: String::new(),
        };

        let body = match frame.header("content-length") {
            Some(length) => {
                let length: usize = length
                    .trim()
                    .parse()
                    .map_err(|_| malformed("invalid content-length"))?;
                let bytes = rest
                    .as_bytes()
                    .get(..length)
                    .ok_or_else(|| malformed("body shorter than content-length"))?;
                std::str::from_utf8(bytes)
                    .map_err(|_| malformed("body is not valid UTF-8"))?
                    .to_string()
            }
            None => {
                let end = rest
                    .find('\0')
                    .ok_or_else(|| malformed("frame is missing its NUL terminator"))?;
                rest[..end].to_string()
            }
        };
        frame.body = body;
        Ok(Some(frame))
    }
}

fn split_line(text: &str) -> Option<(&str, &str)> {
    let index = text.find('\n')?;
    let line = text[..index].strip_suffix('\r').unwrap_or(&text[..index]);
    Some((line, &text[index + 1..]))
}

fn escape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(value: &str) -> WalletResult<String> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(malformed("undefined escape sequence in header")),
        }
    }
    Ok(out)
}

fn malformed(reason: &str) -> WalletError {
    WalletError::ChannelError(format!("Malformed STOMP frame: {}", reason))
}
