//! Thin multiplexing layer over length-delimited frames.
//!
//! Each frame starts with a protocol tag byte.  The control plane owns
//! [`CONTROL_PLANE`]; frames carrying any other tag belong to protocols that
//! share the listening port and are handed back as [`Decoded::Foreign`].

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

use crate::certificate::RoleCertificate;
use crate::error::NetworkError;
use crate::message::Message;
use crate::types::QualifiedName;

/// Protocol tag of control plane frames.
pub const CONTROL_PLANE: u8 = 0x01;

/// Largest frame accepted on a link.
pub const MAX_FRAME_LENGTH: usize = 1 << 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlFrame {
    Message(Message),
    CertificateRequest {
        request_id: u64,
        subject: QualifiedName,
    },
    CertificateResponse {
        request_id: u64,
        certificate: Option<RoleCertificate>,
    },
}

#[derive(Debug)]
pub enum Decoded {
    Control(ControlFrame),
    Foreign(u8),
}

pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

pub fn encode(frame: &ControlFrame) -> Result<Bytes, NetworkError> {
    let body = serde_json::to_vec(frame)?;
    let mut buf = BytesMut::with_capacity(body.len() + 1);
    buf.put_u8(CONTROL_PLANE);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

pub fn decode(frame: &[u8]) -> Result<Decoded, NetworkError> {
    match frame.split_first() {
        None => Err(NetworkError::InvalidFrame("empty frame".into())),
        Some((&CONTROL_PLANE, body)) => Ok(Decoded::Control(serde_json::from_slice(body)?)),
        Some((&tag, _)) => Ok(Decoded::Foreign(tag)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Operation;

    #[test]
    fn control_frames_carry_the_tag() {
        let frame = ControlFrame::CertificateRequest {
            request_id: 9,
            subject: "beta.n.r".parse().unwrap(),
        };
        let bytes = encode(&frame).unwrap();
        assert_eq!(bytes[0], CONTROL_PLANE);

        match decode(&bytes).unwrap() {
            Decoded::Control(ControlFrame::CertificateRequest { request_id, subject }) => {
                assert_eq!(request_id, 9);
                assert_eq!(subject.as_str(), "beta.n.r");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn message_frames_decode() {
        let message = Message::builder(
            "alpha.n.a".parse().unwrap(),
            "beta.n.b".parse().unwrap(),
            Operation::KeepAliveInfo,
        )
        .build();
        let bytes = encode(&ControlFrame::Message(message.clone())).unwrap();
        assert!(matches!(
            decode(&bytes).unwrap(),
            Decoded::Control(ControlFrame::Message(m)) if m == message
        ));
    }

    #[test]
    fn other_protocols_are_passed_over() {
        assert!(matches!(decode(&[0x13, 1, 2]).unwrap(), Decoded::Foreign(0x13)));
        assert!(matches!(decode(&[]), Err(NetworkError::InvalidFrame(_))));
        assert!(matches!(
            decode(&[CONTROL_PLANE, b'{']),
            Err(NetworkError::Codec(_))
        ));
    }
}
