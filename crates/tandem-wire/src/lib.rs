//! # tandem-wire: Binary wire protocol for `tandem`
//!
//! Every message, on a stream connection or in a datagram, travels as one
//! frame:
//!
//! ```text
//! ┌──────────────┬──────────────┬─────────────────────┐
//! │ type (u32 BE)│ len (u32 BE) │ payload (len bytes)  │
//! └──────────────┴──────────────┴─────────────────────┘
//! ```
//!
//! Payloads are `postcard`-encoded message bodies. Stream connections carry
//! a sequence of frames; view-service datagrams carry exactly one.
//!
//! | Type | Message | Direction |
//! |---|---|---|
//! | 1 | [`Query`] | node → view service |
//! | 2 | [`ReportFailure`] | node → view service |
//! | 3 | [`ViewReply`] | view service → node |
//! | 4 | [`Hello`] | node → primary |
//! | 5 | [`InitBackupRequest`] | backup → primary |
//! | 6 | [`InitBackupReply`] | primary → backup |
//! | 7 | [`Sync`] | primary → backup |
//! | 8 | `SyncOk` | backup → primary |
//! | 9 | [`Heartbeat`] | node → primary |
//! | 10 | [`HeartbeatOk`] | primary → node |

mod error;
mod frame;
mod io;
mod message;

pub use error::{WireError, WireResult};
pub use frame::{FRAME_HEADER_SIZE, Frame, MAX_PAYLOAD_SIZE};
pub use io::{read_message, write_message};
pub use message::{
    Heartbeat, HeartbeatOk, Hello, InitBackupReply, InitBackupRequest, Message, MessageKind,
    Query, ReportFailure, Sync, ViewReply,
};
