//! DNS messages as seen by the transport.
//!
//! The transport does not look into a message beyond its header ID. A
//! [`Message`] therefore is little more than the wire octets of a DNS
//! message plus the [`Metadata`] the transport attaches to a response when
//! it is delivered.

use core::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use crate::error::Error;

//------------ Configuration Constants ----------------------------------------

/// The length of the DNS message header in octets.
pub const HEADER_LEN: usize = 12;

//------------ Message --------------------------------------------------------

/// The wire octets of a single DNS message.
#[derive(Clone)]
pub struct Message {
    /// The octets of the message, starting with the header.
    octets: BytesMut,

    /// Delivery information, only present for received responses.
    metadata: Option<Metadata>,
}

impl Message {
    /// Creates a message from an octets buffer.
    ///
    /// Fails if the buffer is too short to contain a DNS header.
    pub fn from_octets(octets: BytesMut) -> Result<Self, Error> {
        if octets.len() < HEADER_LEN {
            return Err(Error::ShortMessage);
        }
        Ok(Message {
            octets,
            metadata: None,
        })
    }

    /// Creates a message by copying the given slice.
    pub fn from_slice(slice: &[u8]) -> Result<Self, Error> {
        Self::from_octets(BytesMut::from(slice))
    }

    /// Returns the value of the ID field.
    pub fn id(&self) -> u16 {
        u16::from_be_bytes([self.octets[0], self.octets[1]])
    }

    /// Sets the value of the ID field.
    pub fn set_id(&mut self, value: u16) {
        self.octets[..2].copy_from_slice(&value.to_be_bytes())
    }

    /// Sets the value of the ID field to a randomly chosen number.
    pub fn set_random_id(&mut self) {
        self.set_id(::rand::random())
    }

    /// Returns the length of the message on the wire.
    pub fn size(&self) -> usize {
        self.octets.len()
    }

    /// Returns the message as an octets slice.
    pub fn as_slice(&self) -> &[u8] {
        self.octets.as_ref()
    }

    /// Converts the message into its octets.
    pub fn into_octets(self) -> Bytes {
        self.octets.freeze()
    }

    /// Returns the delivery metadata if this is a received response.
    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    /// Attaches delivery metadata.
    pub fn set_metadata(&mut self, metadata: Metadata) {
        self.metadata = Some(metadata)
    }
}

impl AsRef<[u8]> for Message {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id())
            .field("size", &self.size())
            .field("metadata", &self.metadata)
            .finish()
    }
}

//------------ Metadata -------------------------------------------------------

/// Information about how a response was delivered.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Metadata {
    /// The server the response was received from.
    pub server: SocketAddr,

    /// The transport the response was received over.
    pub transport: Transport,

    /// The size of the response on the wire.
    pub size: usize,

    /// The time between sending the request and receiving the response.
    pub elapsed: Duration,
}

impl Metadata {
    /// Returns the elapsed time in whole milliseconds.
    pub fn elapsed_millis(&self) -> u128 {
        self.elapsed.as_millis()
    }
}

//------------ Transport ------------------------------------------------------

/// The kind of transport a connection is bound to.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Transport {
    /// A direct TCP connection.
    Tcp,

    /// A TCP connection tunnelled through a proxy.
    TcpProxied,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => f.write_str("TCP"),
            Transport::TcpProxied => f.write_str("TCP (proxied)"),
        }
    }
}

//============ Tests =========================================================
