//! Control-channel message contract for the tunerec recording station.
//!
//! This crate defines the typed messages exchanged between the reservation
//! scheduler and a recording/encoding executor when the two roles run in
//! separate OS processes, together with the framed codec used on the wire.
//!
//! # Frame Format
//!
//! ```text
//! +--------+--------+------------------+
//! | Magic  | Length |     Payload      |
//! | "TREC" | u32 LE |  (JSON, Length)  |
//! +--------+--------+------------------+
//! | 4 bytes| 4 bytes|   Length bytes   |
//! ```
//!
//! The payload is one JSON-encoded [`Envelope`]. Requests carry a caller
//! chosen correlation id which the matching [`Response`] echoes back;
//! [`Notification`]s are fire-and-forget and carry no id.
//!
//! # Example
//!
//! ```rust
//! use tunerec_protocol::{Envelope, Request, RequestOp, ControlCodec};
//! use tokio_util::codec::Encoder;
//! use bytes::BytesMut;
//!
//! let mut codec = ControlCodec::new();
//! let mut buf = BytesMut::new();
//! let msg = Envelope::Request(Request {
//!     id: 1,
//!     op: RequestOp::UpdateAllReserves,
//! });
//! codec.encode(msg, &mut buf).unwrap();
//! ```

pub mod codec;
pub mod error;
pub mod messages;
pub mod types;

pub use codec::{ControlCodec, HEADER_SIZE, MAGIC, MAX_FRAME_SIZE};
pub use error::{ErrorCode, ProtocolError};
pub use messages::{
    Envelope, Notification, Request, RequestOp, Response, ResponseBody, REQUEST_TIMEOUT,
};
pub use types::{
    ChannelType, EncodeJobSpec, Program, RecordOption, ReserveEntry, Rule, RuleSearchOption,
    PROTOCOL_VERSION,
};
