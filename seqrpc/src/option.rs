use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use std::time::Duration;

use crate::codec::CodecType;

/// Identifies this wire protocol; the server rejects every other value.
pub const MAGIC_NUMBER: u32 = 0x5add9a7;

/// Per-connection negotiation record.
///
/// The client sends it once, as a single JSON line, before any request. It
/// always travels as JSON so the server can decode it before a codec has
/// been agreed on.
#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct Options {
    #[serde_inline_default(MAGIC_NUMBER)]
    pub magic_number: u32,
    #[serde_inline_default(CodecType::default())]
    pub codec_type: CodecType,
    /// Client-side dial deadline. Zero disables it.
    #[serde_inline_default(Duration::from_secs(10))]
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Server-side per-request deadline. Zero disables it.
    #[serde_inline_default(Duration::ZERO)]
    #[serde(with = "humantime_serde")]
    pub handle_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opt = Options::default();
        assert_eq!(opt.magic_number, MAGIC_NUMBER);
        assert_eq!(opt.codec_type, CodecType::Msgpack);
        assert_eq!(opt.connect_timeout, Duration::from_secs(10));
        assert_eq!(opt.handle_timeout, Duration::ZERO);
    }

    #[test]
    fn test_options_json_line() {
        let opt = Options {
            handle_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        let line = serde_json::to_string(&opt).unwrap();
        assert!(!line.contains('\n'));
        let parsed: Options = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, opt);
    }

    #[test]
    fn test_tampered_magic_number_survives_round_trip() {
        let opt = Options {
            magic_number: 123_456,
            ..Default::default()
        };
        let line = serde_json::to_string(&opt).unwrap();
        let parsed: Options = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.magic_number, 123_456);
    }
}
