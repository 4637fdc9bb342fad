//! Beacon - event-driven HTTP/1.1 engine
//!
//! Core library: a reactor-driven connection state machine, request
//! parsing with strict limits, chunked streaming, and resumable
//! Server-Sent Event streams.

pub mod config;
pub mod http;
pub mod server;
pub mod sse;
