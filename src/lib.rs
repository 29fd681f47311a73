//! A multiplexed DNS client transport over a single stream connection.
//!
//! This crate provides the transport layer of a DNS resolver client. A
//! [`Connection`] owns one persistent byte-stream connection to a single
//! name server and allows any number of concurrent callers to send queries
//! over it. Queries are told apart by the 16 bit ID in the message header.
//! Responses are read by a single reader task and handed to whichever query
//! is waiting for that ID.
//!
//! The connection is established lazily by the first query and is
//! re-established transparently by the next query after it was lost.
//!
//! # Modules
//!
//! * [conn] contains the [`Connection`] itself and its configuration,
//! * [message] contains the [`Message`] type the transport moves around,
//! * [codec] defines how messages are framed on the stream,
//! * [protocol] deals with resolving server addresses and connecting,
//!   possibly through a [`Proxy`], and
//! * [error] contains the crate’s [`Error`] type.
//!
//! # Example
//!
//! ```no_run
//! # use domain_mux::{Connection, Message, ServerAddr};
//! # use std::time::Duration;
//! # async fn _test(request: Message) {
//! let conn = Connection::new(ServerAddr::named("ns.example.net", 53), None);
//! match conn.query(request, Duration::from_secs(2)).await {
//!     Ok(Some(response)) => println!("got {:?}", response),
//!     Ok(None) => println!("no response, try again"),
//!     Err(err) => println!("query failed: {}", err),
//! }
//! # }
//! ```

#![allow(renamed_and_removed_lints)]
#![allow(clippy::unknown_clippy_lints)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod codec;
pub mod conn;
pub mod error;
pub mod message;
pub mod protocol;
mod transaction;
mod utils;

pub use self::codec::{LengthPrefixed, StreamCodec};
pub use self::conn::{Config, Connection};
pub use self::error::Error;
pub use self::message::{Message, Metadata, Transport};
pub use self::protocol::{Proxy, ServerAddr};
