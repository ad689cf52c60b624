//! # STOMP Frame Codec
//!
//! STOMP 1.2 frames as they travel inside WebSocket text messages:
//!
//! ```text
//! COMMAND
//! header1:value1
//! header2:value2
//!
//! body^@
//! ```
//!
//! Header values are escaped (`\\`, `\n`, `\r`, `\c`) in every frame except
//! CONNECT and CONNECTED. A `content-length` header, when present, bounds the
//! body; otherwise the body runs to the first NUL. A message made only of
//! end-of-line characters is a heart-beat.

use crate::errors::FrameError;

/// Accepted protocol version advertised on CONNECT.
pub const STOMP_VERSION: &str = "1.2";

/// STOMP frame commands this client sends or understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    /// Wire spelling of the command.
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    /// Parses the command line of a frame.
    pub fn parse(line: &str) -> Option<Self> {
        let command = match line {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            "DISCONNECT" => Command::Disconnect,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            _ => return None,
        };
        Some(command)
    }

    // CONNECT and CONNECTED carry raw header values.
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

/// A single STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    /// Headers in wire order. Repeated names are kept; the first one wins on lookup.
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

    /// Appends a header (builder style).
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body (builder style).
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of header `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn destination(&self) -> Option<&str> {
        self.get("destination")
    }

    /// CONNECT frame carrying the bearer token. Heart-beating is disabled;
    /// liveness is left to the WebSocket layer.
    pub fn connect(host: &str, token: &str) -> Self {
        Frame::new(Command::Connect)
            .header("accept-version", STOMP_VERSION)
            .header("host", host)
            .header("heart-beat", "0,0")
            .header("Authorization", format!("Bearer {}", token))
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(Command::Unsubscribe).header("id", id)
    }

    /// SEND frame with a JSON body.
    pub fn send(destination: &str, body: impl Into<String>) -> Self {
        Frame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .with_body(body)
    }

    pub fn disconnect() -> Self {
        Frame::new(Command::Disconnect)
    }

    /// Serializes the frame, NUL terminator included.
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
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// True for a message that only carries end-of-line heart-beats.
    pub fn is_heartbeat(text: &str) -> bool {
        !text.is_empty() && text.chars().all(|c| c == '\n' || c == '\r')
    }

    /// Decodes one frame from a WebSocket text message.
    pub fn decode(text: &str) -> Result<Frame, FrameError> {
        let text = text.trim_start_matches(['\n', '\r']);
        if text.is_empty() || text == "\0" {
            return Err(FrameError::Empty);
        }

        let (head, rest) = split_head(text)?;
        let mut lines = head.split('\n').map(|l| l.trim_end_matches('\r'));

        let command_line = lines.next().unwrap_or_default();
        let command = Command::parse(command_line)
            .ok_or_else(|| FrameError::UnknownCommand(command_line.to_string()))?;

        let mut headers = Vec::new();
        for line in lines.filter(|l| !l.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
            if command.escapes_headers() {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let declared = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .and_then(|(_, v)| v.trim().parse::<usize>().ok());

        let body = match declared {
            Some(len) => rest
                .get(..len)
                .ok_or(FrameError::Truncated {
                    declared: len,
                    actual: rest.len(),
                })?
                .to_string(),
            None => match rest.find('\0') {
                Some(end) => rest[..end].to_string(),
                None => rest.to_string(),
            },
        };

        Ok(Frame {
            command,
            headers,
            body,
        })
    }
}

// Splits at the first blank line, accepting both LF and CRLF framing.
fn split_head(text: &str) -> Result<(&str, &str), FrameError> {
    let lf = text.find("\n\n").map(|i| (i, 2));
    let crlf = text.find("\r\n\r\n").map(|i| (i, 4));
    let (at, width) = match (lf, crlf) {
        (Some(a), Some(b)) => {
            if a.0 <= b.0 {
                a
            } else {
                b
            }
        }
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return Err(FrameError::MissingBody),
    };
    Ok((&text[..at], &text[at + width..]))
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
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

fn unescape_header(raw: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
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
            _ => return Err(FrameError::InvalidEscape(raw.to_string())),
        }
    }
    Ok(out)
}
