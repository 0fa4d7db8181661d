//! Encodes and decodes [`Message`] as ADC-style space-separated text
//! lines terminated by `\n`, in the manner of the teacher's
//! `tokio_util::codec::{Decoder, Encoder}` implementations for its
//! handshake/peer-message codecs.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, ProtocolError};
use crate::segment::Segment;
use crate::{Cid, Tth};

use super::Message;

/// Maximum line length accepted before a connection is dropped as
/// misbehaving (guards against a peer streaming an unbounded line).
const MAX_LINE_LEN: usize = 16 * 1024;

#[derive(Clone, Copy, Debug, Default)]
pub struct AdcCodec;

impl Decoder for AdcCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Error> {
        let newline_pos = src.iter().position(|&b| b == b'\n');
        let line_end = match newline_pos {
            Some(pos) => pos,
            None => {
                if src.len() > MAX_LINE_LEN {
                    return Err(ProtocolError::Malformed("line too long".to_owned()).into());
                }
                return Ok(None);
            }
        };

        let line = src.split_to(line_end + 1);
        let line = &line[..line.len() - 1];
        let line = std::str::from_utf8(line)
            .map_err(|_| ProtocolError::Malformed("invalid utf8".to_owned()))?
            .trim_end_matches('\r');

        Ok(Some(parse_line(line)?))
    }
}

impl Encoder<Message> for AdcCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Error> {
        let line = render_line(&item);
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

fn parse_line(line: &str) -> Result<Message, ProtocolError> {
    let mut parts = line.split(' ');
    let cmd = parts.next().ok_or_else(|| ProtocolError::Malformed(line.to_owned()))?;
    match cmd {
        "SUP" => Ok(Message::Supports(parts.map(|s| s.to_owned()).collect())),
        "MYNICK" => {
            let nick = parts.next().ok_or_else(|| ProtocolError::Malformed(line.to_owned()))?;
            Ok(Message::MyNick(nick.to_owned()))
        }
        "INF" => {
            let cid_str = parts.next().ok_or_else(|| ProtocolError::Malformed(line.to_owned()))?;
            Ok(Message::Info { cid: parse_cid(cid_str)? })
        }
        "GET" => {
            let tth_str = parts.next().ok_or_else(|| ProtocolError::Malformed(line.to_owned()))?;
            let start: u64 = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| ProtocolError::Malformed(line.to_owned()))?;
            let size: u64 = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| ProtocolError::Malformed(line.to_owned()))?;
            Ok(Message::Get {
                tth: parse_tth(tth_str)?,
                segment: Segment::new(start, size),
            })
        }
        "SND" => {
            let tth_str = parts.next().ok_or_else(|| ProtocolError::Malformed(line.to_owned()))?;
            let file_size: u64 = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| ProtocolError::Malformed(line.to_owned()))?;
            Ok(Message::Sending {
                tth: parse_tth(tth_str)?,
                file_size,
            })
        }
        "FNF" => Ok(Message::FileNotAvailable),
        "CTM" => {
            let token = parts.next().ok_or_else(|| ProtocolError::Malformed(line.to_owned()))?;
            let secure = parts.next() == Some("S");
            Ok(Message::ConnectToMe {
                token: token.to_owned(),
                secure,
            })
        }
        "RCM" => {
            let token = parts.next().ok_or_else(|| ProtocolError::Malformed(line.to_owned()))?;
            Ok(Message::ReverseConnectToMe { token: token.to_owned() })
        }
        "PSR" => {
            let tth_str = parts.next().ok_or_else(|| ProtocolError::Malformed(line.to_owned()))?;
            let block_size: u64 = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| ProtocolError::Malformed(line.to_owned()))?;
            let rest: Vec<&str> = parts.collect();
            let mut blocks = Vec::with_capacity(rest.len() / 2);
            for pair in rest.chunks(2) {
                if let [a, b] = pair {
                    let a: u32 = a.parse().map_err(|_| ProtocolError::Malformed(line.to_owned()))?;
                    let b: u32 = b.parse().map_err(|_| ProtocolError::Malformed(line.to_owned()))?;
                    blocks.push((a, b));
                }
            }
            Ok(Message::Psr {
                tth: parse_tth(tth_str)?,
                blocks,
                block_size,
            })
        }
        _ => Err(ProtocolError::Malformed(line.to_owned())),
    }
}

fn render_line(msg: &Message) -> String {
    match msg {
        Message::Supports(features) => format!("SUP {}", features.join(" ")),
        Message::MyNick(nick) => format!("MYNICK {}", nick),
        Message::Info { cid } => format!("INF {}", cid.to_base32()),
        Message::Get { tth, segment } => format!("GET {} {} {}", tth.to_base32(), segment.start, segment.size),
        Message::Sending { tth, file_size } => format!("SND {} {}", tth.to_base32(), file_size),
        Message::FileNotAvailable => "FNF".to_owned(),
        Message::Data(_) => String::new(),
        Message::Psr { tth, blocks, block_size } => {
            let mut s = format!("PSR {} {}", tth.to_base32(), block_size);
            for (a, b) in blocks {
                s.push(' ');
                s.push_str(&a.to_string());
                s.push(' ');
                s.push_str(&b.to_string());
            }
            s
        }
        Message::ConnectToMe { token, secure } => {
            format!("CTM {}{}", token, if *secure { " S" } else { "" })
        }
        Message::ReverseConnectToMe { token } => format!("RCM {}", token),
    }
}

fn parse_tth(s: &str) -> Result<Tth, ProtocolError> {
    let bytes = base32::decode(base32::Alphabet::RFC4648 { padding: false }, s)
        .ok_or_else(|| ProtocolError::Malformed(format!("bad tth: {}", s)))?;
    to_array(&bytes).map(Tth).ok_or_else(|| ProtocolError::Malformed(format!("bad tth length: {}", s)))
}

fn parse_cid(s: &str) -> Result<Cid, ProtocolError> {
    let bytes = base32::decode(base32::Alphabet::RFC4648 { padding: false }, s)
        .ok_or_else(|| ProtocolError::Malformed(format!("bad cid: {}", s)))?;
    to_array(&bytes).map(Cid).ok_or_else(|| ProtocolError::Malformed(format!("bad cid length: {}", s)))
}

fn to_array(bytes: &[u8]) -> Option<[u8; 24]> {
    if bytes.len() != 24 {
        return None;
    }
    let mut arr = [0u8; 24];
    arr.copy_from_slice(bytes);
    Some(arr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_get() {
        let mut codec = AdcCodec;
        let mut buf = BytesMut::new();
        let msg = Message::Get {
            tth: Tth([7; 24]),
            segment: Segment::new(128, 256),
        };
        codec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_returns_none_without_newline() {
        let mut codec = AdcCodec;
        let mut buf = BytesMut::from(&b"SUP ADBASE"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_rejects_unknown_command() {
        let mut codec = AdcCodec;
        let mut buf = BytesMut::from(&b"BOGUS x\n"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_roundtrip_connect_to_me_secure() {
        let mut codec = AdcCodec;
        let mut buf = BytesMut::new();
        let msg = Message::ConnectToMe {
            token: "abc123".to_owned(),
            secure: true,
        };
        codec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }
}
