//! RPC layer: calls, returns, cancellation and remote exceptions on top of
//! the message transport.

mod codec;
mod handler;
mod proxy;
mod service;
mod wait;
mod wire;

pub use codec::{FieldCodec, FIELD_HEADER_LEN};
pub use handler::RpcEndpoint;
pub use proxy::{Args, Proxy};
pub use service::{reply, CallArgs, MethodError, MethodResult, Service, ServiceRegistry};
pub use wait::{CancelTable, RpcOutcome, WaitTable};
pub use wire::{RpcAction, RpcMessage, HANDLER_HANDSHAKE, HANDLER_RPC};
