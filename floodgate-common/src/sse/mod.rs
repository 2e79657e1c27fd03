//! Server-Sent Events broadcasting
//!
//! - [`wire`]: text framing and the `Last-Event-ID` cursor
//! - [`EventStream`] / [`Subscription`]: one broadcaster and its subscribers
//! - [`StreamRegistry`]: streams keyed by id
//! - [`push_events`]: serves one client connection through an [`EventSink`]

mod push;
mod registry;
mod stream;
pub mod wire;

pub use push::{push_events, EventSink, PushError, PushOutcome, PushRequest};
pub use registry::{stream_id, StreamRegistry};
pub use stream::{EventStream, StreamStopped, Subscription};
