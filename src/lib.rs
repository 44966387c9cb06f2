//! `stompede` is an asynchronous client for the STOMP 1.0/1.1/1.2 family of
//! message-broker protocols.
//!
//! The crate covers the framing codec (bit-exact encoding of typed client
//! commands, incremental decoding of NUL-terminated server frames) and the
//! session state machine: request/reply multiplexing over one connection,
//! a delivery stream for asynchronous MESSAGE frames, heart-beat scheduling,
//! and the protocol's ordering and lifecycle rules.
//!
//! ```no_run
//! use stompede::{connect, dial, AckMode, Options, DEFAULT_PORT};
//!
//! # async fn demo() -> stompede::Result<()> {
//! let transport = dial("127.0.0.1", DEFAULT_PORT).await?;
//! let (session, _connected) = connect(transport, Options::default()).await?;
//! let (mut deliveries, _errors) = session.receive().expect("streams taken once");
//! session.subscribe("/queue/updates", None, AckMode::Auto).await?;
//! session.send("/queue/updates", b"hello", None, None).await?;
//! if let Some(frame) = deliveries.recv().await {
//!     println!("{}", frame);
//! }
//! session.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod error;
pub mod frame;
pub mod parser;
pub mod session;

pub use codec::{ServerItem, StompCodec};
pub use error::{Result, StompError};
pub use frame::{AckMode, Command, HeartBeat, Headers, ServerFrame, DEFAULT_PORT};
pub use parser::parse_response;
pub use session::{connect, dial, Options, Session, Subscription};
