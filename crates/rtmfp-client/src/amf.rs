// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The `callFunction` argument boundary (§6, §3 SUPPLEMENTED "AMFReader/
//! AMFWriter"). Full AMF0/AMF3 encoding is out of scope (§1); this module
//! only carries arguments up to an injected encoder.

/// A minimal closed value set sufficient to carry `callFunction` arguments
/// to the Flash-command boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// AMF `Number` (always a double on the wire).
    Number(f64),
    /// AMF `Boolean`.
    Bool(bool),
    /// AMF `String`/`LongString` (UTF-8).
    Utf8(String),
    /// AMF `Null`.
    Null,
    /// AMF `Strict-array`.
    StrictArray(Vec<Value>),
}

/// Encodes [`Value`]s into the bytes a peer or server expects. Full AMF0/3
/// framing is a collaborator's concern (§1 Non-goals); this crate only
/// defines the seam.
pub trait AmfEncode {
    /// Encode a single value, appending to `out`.
    fn encode(&self, value: &Value, out: &mut Vec<u8>);

    /// Encode a `callFunction` invocation: function name plus its argument
    /// list, appending to `out`.
    fn encode_call(&self, function: &str, args: &[Value], out: &mut Vec<u8>) {
        self.encode(&Value::Utf8(function.to_string()), out);
        self.encode(&Value::StrictArray(args.to_vec()), out);
    }
}

/// AMF0 marker bytes (ECMA-style), sufficient for the closed [`Value`] set.
mod marker {
    pub const NUMBER: u8 = 0x00;
    pub const BOOLEAN: u8 = 0x01;
    pub const STRING: u8 = 0x02;
    pub const NULL: u8 = 0x05;
    pub const STRICT_ARRAY: u8 = 0x0A;
}

/// The default [`AmfEncode`] used by [`crate::client::RtmfpClient`] when no
/// application-supplied encoder is injected: plain AMF0 markers, U16-length
/// strings, and no AMF3 switch.
#[derive(Debug, Default, Clone, Copy)]
pub struct Amf0Encoder;

impl AmfEncode for Amf0Encoder {
    fn encode(&self, value: &Value, out: &mut Vec<u8>) {
        match value {
            Value::Number(n) => {
                out.push(marker::NUMBER);
                out.extend_from_slice(&n.to_be_bytes());
            }
            Value::Bool(b) => {
                out.push(marker::BOOLEAN);
                out.push(u8::from(*b));
            }
            Value::Utf8(s) => {
                out.push(marker::STRING);
                #[allow(clippy::cast_possible_truncation)]
                let len = s.len().min(u16::MAX as usize) as u16;
                out.extend_from_slice(&len.to_be_bytes());
                out.extend_from_slice(&s.as_bytes()[..usize::from(len)]);
            }
            Value::Null => out.push(marker::NULL),
            Value::StrictArray(items) => {
                out.push(marker::STRICT_ARRAY);
                #[allow(clippy::cast_possible_truncation)]
                let count = items.len().min(u32::MAX as usize) as u32;
                out.extend_from_slice(&count.to_be_bytes());
                for item in items {
                    self.encode(item, out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amf0_number_round_trips_its_bits() {
        let encoder = Amf0Encoder;
        let mut out = Vec::new();
        encoder.encode(&Value::Number(3.5), &mut out);
        assert_eq!(out[0], marker::NUMBER);
        assert_eq!(f64::from_be_bytes(out[1..9].try_into().unwrap_or_default()), 3.5);
    }

    #[test]
    fn amf0_string_carries_a_u16_length_prefix() {
        let encoder = Amf0Encoder;
        let mut out = Vec::new();
        encoder.encode(&Value::Utf8("hi".into()), &mut out);
        assert_eq!(out, vec![marker::STRING, 0, 2, b'h', b'i']);
    }

    #[test]
    fn amf0_call_writes_name_then_strict_array() {
        let encoder = Amf0Encoder;
        let mut out = Vec::new();
        encoder.encode_call("onStatus", &[Value::Bool(true)], &mut out);
        assert_eq!(out[0], marker::STRING);
        let array_start = 3 + 8; // marker+len(2)+"onStatus"(8)
        assert_eq!(out[array_start], marker::STRICT_ARRAY);
    }

    struct RecordingEncoder;

    impl AmfEncode for RecordingEncoder {
        fn encode(&self, value: &Value, out: &mut Vec<u8>) {
            match value {
                Value::Number(n) => out.extend_from_slice(&n.to_be_bytes()),
                Value::Bool(b) => out.push(u8::from(*b)),
                Value::Utf8(s) => out.extend_from_slice(s.as_bytes()),
                Value::Null => out.push(0),
                Value::StrictArray(items) => {
                    for item in items {
                        self.encode(item, out);
                    }
                }
            }
        }
    }

    #[test]
    fn encode_call_writes_name_then_args() {
        let encoder = RecordingEncoder;
        let mut out = Vec::new();
        encoder.encode_call("onStatus", &[Value::Bool(true), Value::Null], &mut out);
        assert_eq!(out, vec![b'o', b'n', b'S', b't', b'a', b't', b'u', b's', 1, 0]);
    }
}
