use std::collections::HashMap;
use std::fmt;

use crate::error::{Result, StompError};

/// Version list offered in every CONNECT frame.
pub const SUPPORTED_VERSIONS: &str = "1.0,1.1,1.2";

/// Content type emitted on SEND unless the caller overrides it.
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

/// Conventional broker port.
pub const DEFAULT_PORT: u16 = 61613;

// Delimiter bytes of the wire grammar.
pub(crate) const NULL: u8 = 0x00;
pub(crate) const LINE_FEED: u8 = 0x0a;
pub(crate) const COLON: u8 = 0x3a;
pub(crate) const COMMA: u8 = 0x2c;

// Client commands.
pub const CMD_CONNECT: &str = "CONNECT";
pub const CMD_DISCONNECT: &str = "DISCONNECT";
pub const CMD_SEND: &str = "SEND";
pub const CMD_SUBSCRIBE: &str = "SUBSCRIBE";
pub const CMD_UNSUBSCRIBE: &str = "UNSUBSCRIBE";
pub const CMD_ACK: &str = "ACK";
pub const CMD_NACK: &str = "NACK";
pub const CMD_BEGIN: &str = "BEGIN";
pub const CMD_ABORT: &str = "ABORT";
pub const CMD_COMMIT: &str = "COMMIT";

// Server commands.
pub const CMD_CONNECTED: &str = "CONNECTED";
pub const CMD_MESSAGE: &str = "MESSAGE";
pub const CMD_RECEIPT: &str = "RECEIPT";
pub const CMD_ERROR: &str = "ERROR";

// Standard headers on client frames, in canonical emission order.
pub const HDR_ACCEPT_VERSION: &str = "accept-version";
pub const HDR_HOST: &str = "host";
pub const HDR_CONTENT_LENGTH: &str = "content-length";
pub const HDR_RECEIPT: &str = "receipt";
pub const HDR_RECEIPT_ID: &str = "receipt-id";
pub const HDR_DESTINATION: &str = "destination";
pub const HDR_CONTENT_TYPE: &str = "content-type";
pub const HDR_ID: &str = "id";
pub const HDR_ACK: &str = "ack";
pub const HDR_TRANSACTION: &str = "transaction";
pub const HDR_HEART_BEAT: &str = "heart-beat";

// Headers seen on server frames.
pub const HDR_VERSION: &str = "version";
pub const HDR_SESSION: &str = "session";
pub const HDR_SERVER: &str = "server";
pub const HDR_MESSAGE_ID: &str = "message-id";
pub const HDR_SUBSCRIPTION: &str = "subscription";
pub const HDR_MESSAGE: &str = "message";

/// Subscription acknowledgement modes as defined by STOMP 1.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    Auto,
    Client,
    ClientIndividual,
}

impl AckMode {
    /// Wire token for the `ack` header.
    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }

    /// Numeric form: auto = 0, client = 1, client-individual = 2.
    pub fn as_int(&self) -> u8 {
        match self {
            AckMode::Auto => 0,
            AckMode::Client => 1,
            AckMode::ClientIndividual => 2,
        }
    }

    /// Inverse of [`AckMode::as_int`]. Any other integer is rejected.
    pub fn from_int(n: u8) -> Result<AckMode> {
        match n {
            0 => Ok(AckMode::Auto),
            1 => Ok(AckMode::Client),
            2 => Ok(AckMode::ClientIndividual),
            _ => Err(StompError::InvalidArgument(format!("invalid ack mode: {n}"))),
        }
    }
}

/// Heart-beat configuration requested at CONNECT, in milliseconds.
///
/// A zero disables the corresponding direction: `send_interval_ms = 0` means
/// the client never sends pulses, `recv_timeout_ms = 0` means it never
/// expects them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartBeat {
    pub send_interval_ms: u64,
    pub recv_timeout_ms: u64,
}

impl HeartBeat {
    pub fn new(send_interval_ms: u64, recv_timeout_ms: u64) -> Self {
        Self {
            send_interval_ms,
            recv_timeout_ms,
        }
    }

    /// Value of the `heart-beat` header: `"<tx>,<rx>"`.
    pub fn header_value(&self) -> String {
        let mut value = self.send_interval_ms.to_string();
        value.push(COMMA as char);
        value.push_str(&self.recv_timeout_ms.to_string());
        value
    }
}

/// Standard headers of an outgoing frame. Field order is the canonical wire
/// order; the encoder walks the fields top to bottom and emits the ones that
/// are set, then the user-defined overlay in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    pub accept_version: Option<String>,
    pub host: Option<String>,
    pub content_length: Option<String>,
    pub receipt: Option<String>,
    pub receipt_id: Option<String>,
    pub destination: Option<String>,
    pub content_type: Option<String>,
    pub id: Option<String>,
    pub ack: Option<String>,
    pub transaction: Option<String>,
    pub heart_beat: Option<String>,
    pub user_defined: Vec<(String, String)>,
}

impl Headers {
    /// Standard headers that are present, as `(name, value)` pairs in
    /// canonical order. User-defined headers are not included.
    pub fn standard(&self) -> Vec<(&'static str, &str)> {
        let slots: [(&'static str, Option<&String>); 11] = [
            (HDR_ACCEPT_VERSION, self.accept_version.as_ref()),
            (HDR_HOST, self.host.as_ref()),
            (HDR_CONTENT_LENGTH, self.content_length.as_ref()),
            (HDR_RECEIPT, self.receipt.as_ref()),
            (HDR_RECEIPT_ID, self.receipt_id.as_ref()),
            (HDR_DESTINATION, self.destination.as_ref()),
            (HDR_CONTENT_TYPE, self.content_type.as_ref()),
            (HDR_ID, self.id.as_ref()),
            (HDR_ACK, self.ack.as_ref()),
            (HDR_TRANSACTION, self.transaction.as_ref()),
            (HDR_HEART_BEAT, self.heart_beat.as_ref()),
        ];
        slots
            .into_iter()
            .filter_map(|(name, value)| value.map(|v| (name, v.as_str())))
            .collect()
    }
}

fn optional(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_owned)
}

fn require(value: &str, what: &str) -> Result<String> {
    if value.is_empty() {
        Err(StompError::InvalidArgument(format!("empty {what}")))
    } else {
        Ok(value.to_owned())
    }
}

/// A typed client command. Each variant carries only the headers legal for
/// its verb; `Pulse` is the empty heart-beat frame.
///
/// Constructors validate required fields and treat an empty `receipt` or
/// `transaction` as absent. A `receipt` makes the command expect a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect {
        host: String,
        heart_beat: HeartBeat,
    },
    Disconnect {
        receipt: Option<String>,
    },
    Send {
        destination: String,
        body: Vec<u8>,
        receipt: Option<String>,
        transaction: Option<String>,
        /// Defaults to `text/plain`; `None` suppresses the header.
        content_type: Option<String>,
        /// Defaults to `len(body) + 1`, counting the trailing line feed the
        /// encoder appends before NUL. `None` suppresses the header, in
        /// which case the body must be NUL-free.
        content_length: Option<usize>,
        user_defined: Vec<(String, String)>,
    },
    Subscribe {
        id: String,
        destination: String,
        ack: AckMode,
        receipt: Option<String>,
    },
    Unsubscribe {
        id: String,
        receipt: Option<String>,
    },
    Ack {
        id: String,
        receipt: Option<String>,
        transaction: Option<String>,
    },
    Nack {
        id: String,
        receipt: Option<String>,
        transaction: Option<String>,
    },
    Begin {
        transaction: String,
        receipt: Option<String>,
    },
    Abort {
        transaction: String,
        receipt: Option<String>,
    },
    Commit {
        transaction: String,
        receipt: Option<String>,
    },
    /// Empty heart-beat frame: a single line feed on the wire.
    Pulse,
}

impl Command {
    pub fn connect(host: impl Into<String>, heart_beat: HeartBeat) -> Command {
        Command::Connect {
            host: host.into(),
            heart_beat,
        }
    }

    pub fn disconnect(receipt: Option<&str>) -> Command {
        Command::Disconnect {
            receipt: optional(receipt),
        }
    }

    pub fn send(
        destination: &str,
        body: Vec<u8>,
        receipt: Option<&str>,
        transaction: Option<&str>,
        user_defined: Vec<(String, String)>,
    ) -> Result<Command> {
        let destination = require(destination, "destination")?;
        let content_length = Some(body.len() + 1);
        Ok(Command::Send {
            destination,
            body,
            receipt: optional(receipt),
            transaction: optional(transaction),
            content_type: Some(CONTENT_TYPE_TEXT.to_owned()),
            content_length,
            user_defined,
        })
    }

    pub fn subscribe(
        id: &str,
        destination: &str,
        ack: AckMode,
        receipt: Option<&str>,
    ) -> Result<Command> {
        Ok(Command::Subscribe {
            id: require(id, "subscription id")?,
            destination: require(destination, "destination")?,
            ack,
            receipt: optional(receipt),
        })
    }

    pub fn unsubscribe(id: &str, receipt: Option<&str>) -> Result<Command> {
        Ok(Command::Unsubscribe {
            id: require(id, "subscription id")?,
            receipt: optional(receipt),
        })
    }

    pub fn ack(id: &str, receipt: Option<&str>, transaction: Option<&str>) -> Result<Command> {
        Ok(Command::Ack {
            id: require(id, "message id")?,
            receipt: optional(receipt),
            transaction: optional(transaction),
        })
    }

    pub fn nack(id: &str, receipt: Option<&str>, transaction: Option<&str>) -> Result<Command> {
        Ok(Command::Nack {
            id: require(id, "message id")?,
            receipt: optional(receipt),
            transaction: optional(transaction),
        })
    }

    pub fn begin(transaction: &str, receipt: Option<&str>) -> Result<Command> {
        Ok(Command::Begin {
            transaction: require(transaction, "transaction id")?,
            receipt: optional(receipt),
        })
    }

    pub fn abort(transaction: &str, receipt: Option<&str>) -> Result<Command> {
        Ok(Command::Abort {
            transaction: require(transaction, "transaction id")?,
            receipt: optional(receipt),
        })
    }

    pub fn commit(transaction: &str, receipt: Option<&str>) -> Result<Command> {
        Ok(Command::Commit {
            transaction: require(transaction, "transaction id")?,
            receipt: optional(receipt),
        })
    }

    /// Command name on the wire. Empty for `Pulse`, which has no command
    /// line.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Connect { .. } => CMD_CONNECT,
            Command::Disconnect { .. } => CMD_DISCONNECT,
            Command::Send { .. } => CMD_SEND,
            Command::Subscribe { .. } => CMD_SUBSCRIBE,
            Command::Unsubscribe { .. } => CMD_UNSUBSCRIBE,
            Command::Ack { .. } => CMD_ACK,
            Command::Nack { .. } => CMD_NACK,
            Command::Begin { .. } => CMD_BEGIN,
            Command::Abort { .. } => CMD_ABORT,
            Command::Commit { .. } => CMD_COMMIT,
            Command::Pulse => "",
        }
    }

    /// Whether the command blocks for one server frame after the write.
    /// CONNECT always does (it awaits CONNECTED); every other frame does
    /// exactly when it carries a `receipt` header.
    pub fn expects_reply(&self) -> bool {
        match self {
            Command::Connect { .. } => true,
            Command::Pulse => false,
            Command::Disconnect { receipt }
            | Command::Send { receipt, .. }
            | Command::Subscribe { receipt, .. }
            | Command::Unsubscribe { receipt, .. }
            | Command::Ack { receipt, .. }
            | Command::Nack { receipt, .. }
            | Command::Begin { receipt, .. }
            | Command::Abort { receipt, .. }
            | Command::Commit { receipt, .. } => receipt.is_some(),
        }
    }

    /// Body bytes. Empty for every verb except SEND.
    pub fn body(&self) -> &[u8] {
        match self {
            Command::Send { body, .. } => body,
            _ => &[],
        }
    }

    /// Assemble the canonical header struct for this command.
    pub fn headers(&self) -> Headers {
        let mut headers = Headers::default();
        match self {
            Command::Connect { host, heart_beat } => {
                headers.accept_version = Some(SUPPORTED_VERSIONS.to_owned());
                headers.host = Some(host.clone());
                headers.heart_beat = Some(heart_beat.header_value());
            }
            Command::Disconnect { receipt } => {
                headers.receipt = receipt.clone();
            }
            Command::Send {
                destination,
                receipt,
                transaction,
                content_type,
                content_length,
                user_defined,
                ..
            } => {
                headers.content_length = content_length.map(|n| n.to_string());
                headers.receipt = receipt.clone();
                headers.destination = Some(destination.clone());
                headers.content_type = content_type.clone();
                headers.transaction = transaction.clone();
                headers.user_defined = user_defined.clone();
            }
            Command::Subscribe {
                id,
                destination,
                ack,
                receipt,
            } => {
                headers.receipt = receipt.clone();
                headers.destination = Some(destination.clone());
                headers.id = Some(id.clone());
                headers.ack = Some(ack.as_str().to_owned());
            }
            Command::Unsubscribe { id, receipt } => {
                headers.receipt = receipt.clone();
                headers.id = Some(id.clone());
            }
            Command::Ack {
                id,
                receipt,
                transaction,
            }
            | Command::Nack {
                id,
                receipt,
                transaction,
            } => {
                headers.receipt = receipt.clone();
                headers.id = Some(id.clone());
                headers.transaction = transaction.clone();
            }
            Command::Begin {
                transaction,
                receipt,
            }
            | Command::Abort {
                transaction,
                receipt,
            }
            | Command::Commit {
                transaction,
                receipt,
            } => {
                headers.receipt = receipt.clone();
                headers.transaction = Some(transaction.clone());
            }
            Command::Pulse => {}
        }
        headers
    }
}

/// A frame received from the broker: command, headers, body.
///
/// Header order is not preserved and duplicate keys keep the first
/// occurrence. Values are raw bytes; no unescaping is applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerFrame {
    pub command: String,
    pub headers: HashMap<String, Vec<u8>>,
    pub body: Vec<u8>,
}

impl ServerFrame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    /// Raw value of a header, if present. Keys are case-sensitive.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers.get(name).map(Vec::as_slice)
    }

    /// Header value as UTF-8, if present and valid.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }
}

impl fmt::Display for ServerFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Command: {}", self.command)?;
        for (k, v) in &self.headers {
            writeln!(f, "{}: {}", k, String::from_utf8_lossy(v))?;
        }
        writeln!(f, "Body ({} bytes)", self.body.len())
    }
}
