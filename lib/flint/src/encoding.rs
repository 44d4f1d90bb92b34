/// Base64 helpers shared by the protocol crates. The wire protocol carries
/// binary payloads (clipboard, images) as standard-alphabet base64 text.
pub mod base64 {
    use ::base64::engine::general_purpose::STANDARD;
    use ::base64::Engine;

    pub use ::base64::DecodeError;

    #[inline]
    pub fn encode(data: &[u8]) -> String {
        STANDARD.encode(data)
    }

    #[inline]
    pub fn decode(data: &str) -> Result<Vec<u8>, DecodeError> {
        STANDARD.decode(data)
    }
}

#[cfg(test)]
mod tests {
    use super::base64;

    #[test]
    fn test_roundtrip() {
        let data = b"clipboard contents \xff\x00\x7f";
        let encoded = base64::encode(data);
        assert_eq!(base64::decode(&encoded).unwrap(), data.to_vec());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(base64::decode("not!base64!").is_err());
    }
}
