//! Wire protocol: typed frames, stream parsing, and message assembly.

mod frame;
mod frame_builder;
mod message;

pub use frame::{Frame, FrameType, FRAME_HEADER_LEN, GATHER_HEADER_LEN, SHORT_HEADER_LEN};
pub use frame_builder::FrameBuilder;
pub use message::Message;
