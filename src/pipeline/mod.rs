//! Log pipeline: buffer, dispatcher and tracing bridge

mod bridge;
mod buffer;
mod dispatcher;

pub use bridge::DispatchLayer;
pub use buffer::{Buffer, BufferError};
pub use dispatcher::{Dispatcher, DispatcherBuilder};
