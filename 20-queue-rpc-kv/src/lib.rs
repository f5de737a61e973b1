//! Request/reply RPC over a message queue, fronting a shared key-value store.
//!
//! A client publishes a command to the well-known `message-queue` and waits
//! on a private reply queue; the server consumes commands, applies them to
//! an in-memory, insertion-ordered store and publishes correlated replies.
//!
//! - [`store`] is the ordered key-value map behind one exclusive lock.
//! - [`command`] defines the request/reply records and their JSON encoding.
//! - [`server`] runs the intake loop and the permit-bounded worker tasks.
//! - [`client`] publishes a request and matches the reply by correlation id.
//! - [`bus`] is the queue contract both ends program against; [`broker`]
//!   implements it in-process and [`remote`] carries it over TCP using the
//!   JSON-lines frames in [`frame`].
//! - [`cli`] parses the `broker`, `server` and `client` subcommands.

pub mod broker;
pub mod bus;
pub mod cli;
pub mod client;
pub mod command;
pub mod frame;
pub mod remote;
pub mod server;
pub mod store;
