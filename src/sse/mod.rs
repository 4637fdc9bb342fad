//! Server-Sent Events.
//!
//! - **`codec`**: event formatting and the incremental stream parser
//! - **`session`**: session table with bounded per-session replay history
//! - **`stream`**: channel-backed streaming bodies and resumable streams
//! - **`client`**: async consumer for a remote event stream

pub mod client;
pub mod codec;
pub mod session;
pub mod stream;

pub use codec::{SseEvent, SseParser, format_event};
pub use session::{SessionError, SessionManager};
pub use stream::{EventPublisher, SseSender, SseStream, channel, open_event_stream};
