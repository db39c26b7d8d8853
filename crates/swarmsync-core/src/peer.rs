//! Peer abstraction consumed from the messaging layer
//!
//! Connection setup, discovery and wire encoding live outside the core. A
//! connected peer only needs to stream byte ranges, say whether it accepts
//! part requests and carry transfer control messages.

use crate::error::Result;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::FutureExt;
use std::sync::Arc;
use swarmsync_types::{FileVersion, PartsRecord, PeerId, TransferMessage};

/// Body of a range response
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

pub type SharedPeer = Arc<dyn Peer>;

pub trait Peer: Send + Sync {
    fn id(&self) -> &PeerId;

    /// Whether the peer serves arbitrary byte ranges. Peers without part
    /// support only serve a file from an offset to its end.
    fn supports_part_requests(&self) -> bool;

    fn is_connected(&self) -> bool {
        true
    }

    /// Peers on the local network use the LAN traffic classes
    fn is_lan(&self) -> bool {
        false
    }

    /// Bytes per second the peer is expected to deliver, 0 if unknown
    fn bandwidth_estimate(&self) -> u64 {
        0
    }

    /// Stream `length` bytes of `version` starting at `offset`
    fn request_range<'a>(
        &'a self,
        version: &'a FileVersion,
        offset: u64,
        length: u64,
    ) -> BoxFuture<'a, Result<ByteStream>>;

    /// Block signatures of `version`, `None` when the peer has none
    fn request_parts_record<'a>(
        &'a self,
        _version: &'a FileVersion,
        _block_size: u64,
    ) -> BoxFuture<'a, Result<Option<PartsRecord>>> {
        async { Ok(None) }.boxed()
    }

    /// Deliver a transfer control message
    fn send(&self, message: TransferMessage) -> BoxFuture<'_, Result<()>>;
}
