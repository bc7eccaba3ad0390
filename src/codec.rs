use crate::error::CacheResult;

/// Converts cache values to and from their on-disk byte representation.
///
/// The cache imposes no header or versioning on the file contents; callers
/// wanting a forward-compatible format must embed versioning in their codec.
///
/// Decoding failures are reported as [`CacheError::Codec`](crate::CacheError)
/// and treated by the cache as a miss, never as a crash.
pub trait PersistenceCodec<V>: Send + Sync + 'static {
    fn encode(&self, value: &V) -> CacheResult<Vec<u8>>;
    fn decode(&self, bytes: Vec<u8>) -> CacheResult<V>;
}

/// The default codec for caches whose values are already raw bytes.
///
/// Encoding and decoding are passthrough; no conversion step runs at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCodec;

impl PersistenceCodec<Vec<u8>> for IdentityCodec {
    fn encode(&self, value: &Vec<u8>) -> CacheResult<Vec<u8>> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: Vec<u8>) -> CacheResult<Vec<u8>> {
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_round_trip() {
        let value = vec![1u8, 2, 3];
        let encoded = IdentityCodec.encode(&value).unwrap();
        assert_eq!(IdentityCodec.decode(encoded).unwrap(), value);
    }
}
