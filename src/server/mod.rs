//! Server runtime: the reactor, the handler registry, the engine every
//! connection consults, and the optional worker pool.

pub mod engine;
pub mod listener;
pub mod router;
pub mod worker;

pub use engine::Engine;
pub use listener::{Server, ServerHandle};
pub use router::{Handler, Router};
pub use worker::WorkerPool;
