//! The ADC/NMDC wire messages this core sends and receives over a peer
//! connection, and the codec that (de)serializes them.

pub mod codec;

use crate::{segment::Segment, Tth};

/// A message exchanged directly with another client over a `UserConnection`.
///
/// Only the subset needed to drive the queue/transfer state machine is
/// modelled; hub-side chat and search protocol messages are the hub
/// client's concern, not this core's (spec.md §6.2 scopes the wire
/// protocol to file transfer negotiation).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// ADC `SUP`/NMDC `$Supports`: feature negotiation at connection
    /// start.
    Supports(Vec<String>),
    /// NMDC `$MyNick` / ADC equivalent identity announce.
    MyNick(String),
    /// ADC `INF` / NMDC `$Lock`-`$Key`: completes the handshake.
    Info { cid: crate::Cid },
    /// Requests a byte range of a file identified by TTH.
    Get { tth: Tth, segment: Segment },
    /// Accepts a `Get`, giving the total file size the sender believes it
    /// has (used to validate `segment` is in range).
    Sending { tth: Tth, file_size: u64 },
    /// Indicates the requested file/range is not available.
    FileNotAvailable,
    /// A chunk of file content following a `Sending`.
    Data(Vec<u8>),
    /// Partial search response / PSR: reports what block ranges of a TTH
    /// the sender has, for partial-file-sharing.
    Psr { tth: Tth, blocks: Vec<(u32, u32)>, block_size: u64 },
    /// ADC `CTM`/NMDC `$ConnectToMe`: asks the peer to connect to us.
    ConnectToMe { token: String, secure: bool },
    /// ADC `RCM`/NMDC `$RevConnectToMe`: asks the peer to ask us to
    /// connect to them.
    ReverseConnectToMe { token: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_equality() {
        let a = Message::Get {
            tth: Tth([1; 24]),
            segment: Segment::new(0, 10),
        };
        let b = Message::Get {
            tth: Tth([1; 24]),
            segment: Segment::new(0, 10),
        };
        assert_eq!(a, b);
    }
}
