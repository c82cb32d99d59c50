//! # postwire
//!
//! Point-to-point TCP message-queue transport with an overlaid RPC
//! protocol.
//!
//! The transport moves *messages* (ordered sequences of typed,
//! length-prefixed frames) between exactly two peers. Each session owns a
//! mailbox; a shared postmaster schedules bounded pools of reader and
//! writer workers across all mailboxes with at-most-one pass per mailbox
//! per direction. The RPC layer adds request/response correlation,
//! fire-and-forget calls, cooperative cancellation, remote exceptions and
//! an optional authentication handshake.
//!
//! ## Example
//!
//! ```ignore
//! use postwire::{reply, Args, CallArgs, ClientBuilder, Config, Server, Service};
//!
//! let server = Server::builder(Config::default())
//!     .service(Service::new("Calculator").method("Add", 2, |args: CallArgs| async move {
//!         let a: i64 = args.get(0)?;
//!         let b: i64 = args.get(1)?;
//!         reply(&(a + b))
//!     }))
//!     .start()
//!     .await?;
//!
//! let client = ClientBuilder::new(Config::default().with_port(server.local_addr().port()))
//!     .connect()
//!     .await?;
//! let sum: i64 = client
//!     .proxy("Calculator")
//!     .call("Add", Args::new().arg(&100)?.arg(&200)?, None)
//!     .await?;
//! assert_eq!(sum, 300);
//! ```

pub mod buffer_pool;
pub mod cancel;
pub mod config;
pub mod error;
pub mod handshake;
pub mod mailbox;
pub mod postmaster;
pub mod protocol;
pub mod rpc;
pub mod session;

mod client;
mod server;

pub use cancel::CancelToken;
pub use client::{Client, ClientBuilder};
pub use config::Config;
pub use error::{CloseReason, RemoteException, Result, WireError};
pub use handshake::{verifier_fn, AuthVerifier, ServerInfo};
pub use rpc::{reply, Args, CallArgs, MethodError, Proxy, Service, ServiceRegistry};
pub use server::{Server, ServerBuilder};
pub use session::{MessageSink, Role, Session, SessionState};
