//! Signaling protocol

pub mod message;

pub use message::{
    is_close, parse_answer, parse_source, ProtocolError, SdpType, SessionDescription, CLOSE,
};
