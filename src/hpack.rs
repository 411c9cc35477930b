use crate::types::{Error, Headers};
use log::trace;

/// The encoder/decoder worker pair for one connection.
///
/// Both directions keep dynamic-table state across header blocks, so a single
/// pair must serve the whole connection and blocks must be fed in wire order.
pub struct HeaderCodec {
    encoder: hpack::Encoder<'static>,
    decoder: hpack::Decoder<'static>,
}

impl std::fmt::Debug for HeaderCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderCodec").finish()
    }
}

impl Default for HeaderCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderCodec {
    #[must_use]
    pub fn new() -> Self {
        Self {
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::new(),
        }
    }

    pub fn encode(&mut self, headers: &Headers) -> Vec<u8> {
        self.encoder.encode(
            headers
                .iter()
                .map(|(key, value)| (key.as_bytes(), value.as_bytes())),
        )
    }

    pub fn decode(&mut self, block: &[u8]) -> Result<Headers, Error> {
        let fields = self
            .decoder
            .decode(block)
            .map_err(|err| Error::Compression(format!("{:?}", err)))?;
        Ok(fields
            .into_iter()
            .map(|(key, value)| {
                (
                    String::from_utf8_lossy(&key).into_owned(),
                    String::from_utf8_lossy(&value).into_owned(),
                )
            })
            .collect())
    }

    /// Applies the peer's `header_table_size` setting to the compression
    /// state. The `hpack` crate only exposes the knob on the decode side.
    pub fn update_max_table_size(&mut self, size: u32) {
        trace!("header table size -> {}", size);
        self.decoder.set_max_table_size(size as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_headers() -> Headers {
        vec![
            (":method".to_owned(), "GET".to_owned()),
            (":scheme".to_owned(), "https".to_owned()),
            (":authority".to_owned(), "example.com".to_owned()),
            (":path".to_owned(), "/".to_owned()),
            ("accept".to_owned(), "text/html".to_owned()),
        ]
    }

    #[test]
    fn round_trip() {
        let mut codec = HeaderCodec::new();
        let block = codec.encode(&request_headers());
        assert_eq!(codec.decode(&block).unwrap(), request_headers());
    }

    #[test]
    fn dynamic_table_survives_across_blocks() {
        let mut ours = HeaderCodec::new();
        let mut theirs = HeaderCodec::new();
        for _ in 0..3 {
            let block = ours.encode(&request_headers());
            assert_eq!(theirs.decode(&block).unwrap(), request_headers());
        }
    }

    #[test]
    fn garbage_is_a_compression_error() {
        let mut codec = HeaderCodec::new();
        assert!(matches!(
            codec.decode(&[0x3f, 0xff, 0xff, 0xff, 0xff, 0xff]),
            Err(Error::Compression(_))
        ));
    }
}
