//! Data plane: thread-per-core monoio workers serving HTTP/1.1, a capture
//! layer that snapshots every exchange, and the forwarding handler.

pub mod body;
pub mod capture;
pub mod codec;
pub mod connection;
pub mod io;
pub mod sink;
pub mod transport;
pub mod upstream;
pub mod worker;

pub use body::{Body, IncomingBody, Replayable};
pub use capture::{Capture, Handler};
pub use connection::{ClientAddr, ConnLimits, handle_connection};
pub use sink::{DirectSink, ResponseSink, TeeSink};
pub use transport::{HttpTransport, HttpsTransport, Transport};
pub use upstream::{ConnPool, Upstream};
pub use worker::{WorkerConfig, spawn_workers};
