//! HTTP protocol implementation.
//!
//! This module implements a non-blocking HTTP/1.1 engine with keep-alive
//! connections and chunked streaming responses.
//!
//! # Architecture
//!
//! - **`connection`**: the per-socket request/response state machine
//! - **`parser`**: parses request heads from byte buffers, enforcing limits
//! - **`request`**: HTTP request representation and header access
//! - **`response`**: HTTP response representation with builder pattern
//! - **`writer`**: serializes responses and buffers unsent bytes
//! - **`chunked`**: chunked transfer encoding and decoding
//!
//! # Connection State Machine
//!
//! ```text
//!        ┌──────────────────┐
//!        │       Idle       │ ← Wait for the next request
//!        └────────┬─────────┘
//!                 ▼
//!        ┌──────────────────┐   too large → 431, malformed → 400
//!        │ ReceivingHeaders │ ─────────────────────────────┐
//!        └────────┬─────────┘                              │
//!                 │ Expect: 100-continue                   │
//!                 ├──────► Sending100Continue ─┐           │
//!                 ▼                            ▼           │
//!        ┌──────────────────┐                              │
//!        │  ReceivingBody   │ ← Wait for Content-Length    │
//!        └────────┬─────────┘                              │
//!                 ▼                                        │
//!        ┌──────────────────┐                              │
//!        │    Processing    │ ◄────────────────────────────┘
//!        └────────┬─────────┘
//!                 │ worker pool → ProcessingAsync → (response ready)
//!                 ▼
//!        ┌──────────────────┐
//!        │  SendingHeaders  │
//!        └────────┬─────────┘
//!                 ├─ fixed body → SendingBody
//!                 └─ stream     → StreamingChunked → SendingBody
//!                 │
//!                 ├─ Keep-Alive → Idle (same connection)
//!                 └─ Close      → Closing
//! ```

pub mod chunked;
pub mod connection;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;
