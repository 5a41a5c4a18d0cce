use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::chunk::Chunk;
use crate::node::{EngineError, NodeLogic, UpstreamHandle};

/// A node that turns the typed chunks flowing out of an extractor into raw
/// bytes for persistence, declaring a stable content type the `Database`
/// stores alongside the blob. Every `Encoder` is also a plain [`NodeLogic`]
/// so it can sit in the graph exactly like any other node, listening to the
/// extractor it encodes.
pub trait Encoder: NodeLogic {
    fn content_type(&self) -> &'static str;
}

/// Passes bytes through unchanged. Used for extractors that already produce
/// their stored representation as raw bytes.
pub struct IdentityEncoder {
    cache: Option<Chunk>,
}

impl Default for IdentityEncoder {
    fn default() -> Self {
        Self { cache: None }
    }
}

impl NodeLogic for IdentityEncoder {
    fn name(&self) -> &str {
        "IdentityEncoder"
    }

    fn enqueue(&mut self, data: Chunk, _from: UpstreamHandle) {
        self.cache = Some(data);
    }

    fn dequeue(&mut self, _finalized: bool) -> Result<Chunk, EngineError> {
        self.cache
            .take()
            .ok_or_else(|| EngineError::NotEnoughData(self.name().to_owned()))
    }

    fn process(&mut self, data: Chunk) -> Result<Vec<Chunk>, Box<dyn std::error::Error + Send + Sync>> {
        let bytes = data.as_bytes().unwrap_or(&[]).to_vec();
        Ok(vec![Chunk::bytes(bytes)])
    }
}

impl Encoder for IdentityEncoder {
    fn content_type(&self) -> &'static str {
        "application/octet-stream"
    }
}

/// Serializes each chunk as a single JSON document. Intended for extractors
/// that emit exactly one logical value per run (counts, summaries), not for
/// genuinely streamed byte output.
#[derive(Default)]
pub struct JsonEncoder {
    cache: Option<Chunk>,
}

impl NodeLogic for JsonEncoder {
    fn name(&self) -> &str {
        "JsonEncoder"
    }

    fn enqueue(&mut self, data: Chunk, _from: UpstreamHandle) {
        self.cache = Some(data);
    }

    fn dequeue(&mut self, _finalized: bool) -> Result<Chunk, EngineError> {
        self.cache
            .take()
            .ok_or_else(|| EngineError::NotEnoughData(self.name().to_owned()))
    }

    fn process(&mut self, data: Chunk) -> Result<Vec<Chunk>, Box<dyn std::error::Error + Send + Sync>> {
        let value = chunk_to_json(&data);
        let bytes = serde_json::to_vec(&value)?;
        Ok(vec![Chunk::bytes(bytes)])
    }
}

impl Encoder for JsonEncoder {
    fn content_type(&self) -> &'static str {
        "application/json"
    }
}

fn chunk_to_json(chunk: &Chunk) -> serde_json::Value {
    match chunk {
        Chunk::Bytes(b) => serde_json::Value::String(String::from_utf8_lossy(b).into_owned()),
        Chunk::Text(t) => serde_json::Value::String(t.to_string()),
        Chunk::Counts(counts) => serde_json::to_value(counts).unwrap_or(serde_json::Value::Null),
        Chunk::Number(n) => serde_json::Value::Number((*n).into()),
        Chunk::Json(v) => v.clone(),
        Chunk::Unit => serde_json::Value::Null,
    }
}

/// Gzip-compresses bytes as they stream through, flushing the compressor's
/// trailer on `process_final`. The idiomatic substitute for the reference
/// implementation's bzip2 encoder (see crate-level docs); stored content
/// type is `application/gzip` accordingly.
pub struct GzipEncoder {
    cache: Option<Chunk>,
    encoder: GzEncoder<Vec<u8>>,
}

impl Default for GzipEncoder {
    fn default() -> Self {
        Self {
            cache: None,
            encoder: GzEncoder::new(Vec::new(), Compression::default()),
        }
    }
}

impl NodeLogic for GzipEncoder {
    fn name(&self) -> &str {
        "GzipEncoder"
    }

    fn enqueue(&mut self, data: Chunk, _from: UpstreamHandle) {
        self.cache = Some(data);
    }

    fn dequeue(&mut self, _finalized: bool) -> Result<Chunk, EngineError> {
        self.cache
            .take()
            .ok_or_else(|| EngineError::NotEnoughData(self.name().to_owned()))
    }

    fn process(&mut self, data: Chunk) -> Result<Vec<Chunk>, Box<dyn std::error::Error + Send + Sync>> {
        let bytes = data.as_bytes().unwrap_or(&[]).to_vec();
        self.encoder.write_all(&bytes)?;
        Ok(Vec::new())
    }

    fn process_final(&mut self) -> Result<Vec<Chunk>, Box<dyn std::error::Error + Send + Sync>> {
        let encoder = std::mem::replace(&mut self.encoder, GzEncoder::new(Vec::new(), Compression::default()));
        let finished = encoder.finish()?;
        Ok(vec![Chunk::bytes(finished)])
    }
}

impl Encoder for GzipEncoder {
    fn content_type(&self) -> &'static str {
        "application/gzip"
    }
}

/// A function from a readable byte stream to a typed value, selected at
/// feature-definition time and overridable per fetch.
pub trait Decoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<Chunk, EngineError>;
}

/// Returns the raw bytes unchanged; serves both the "passthrough stream" and
/// "greedy read" reference variants, since this crate's `Database::read_stream`
/// is already fully materialized before a `Decoder` ever sees it.
#[derive(Default)]
pub struct RawDecoder;

impl Decoder for RawDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<Chunk, EngineError> {
        Ok(Chunk::bytes(bytes.to_vec()))
    }
}

/// Decodes stored bytes as UTF-8 text, replacing invalid sequences.
#[derive(Default)]
pub struct TextDecoder;

impl Decoder for TextDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<Chunk, EngineError> {
        Ok(Chunk::text(String::from_utf8_lossy(bytes).into_owned()))
    }
}

#[derive(Default)]
pub struct JsonDecoder;

impl Decoder for JsonDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<Chunk, EngineError> {
        let value: serde_json::Value = serde_json::from_slice(bytes).map_err(|err| EngineError::Extraction {
            node: "JsonDecoder".to_owned(),
            source: Box::new(err),
        })?;
        Ok(Chunk::Json(value))
    }
}

#[derive(Default)]
pub struct GzipDecoder;

impl Decoder for GzipDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<Chunk, EngineError> {
        let mut out = Vec::new();
        GzDecoder::new(bytes)
            .read_to_end(&mut out)
            .map_err(|err| EngineError::Extraction {
                node: "GzipDecoder".to_owned(),
                source: Box::new(err),
            })?;
        Ok(Chunk::bytes(out))
    }
}

/// Serializes a `Chunk::Counts` value through `bincode`, the idiomatic
/// substitute for the reference implementation's pickle-based encoder.
/// Pairs with [`BincodeDecoder`].
#[derive(Default)]
pub struct BincodeEncoder {
    cache: Option<Chunk>,
}

impl NodeLogic for BincodeEncoder {
    fn name(&self) -> &str {
        "BincodeEncoder"
    }

    fn enqueue(&mut self, data: Chunk, _from: UpstreamHandle) {
        self.cache = Some(data);
    }

    fn dequeue(&mut self, _finalized: bool) -> Result<Chunk, EngineError> {
        self.cache
            .take()
            .ok_or_else(|| EngineError::NotEnoughData(self.name().to_owned()))
    }

    fn process(&mut self, data: Chunk) -> Result<Vec<Chunk>, Box<dyn std::error::Error + Send + Sync>> {
        let counts = match data {
            Chunk::Counts(counts) => counts,
            other => {
                return Err(format!("BincodeEncoder cannot encode {other:?}").into());
            }
        };
        let bytes = bincode::serialize(&counts)?;
        Ok(vec![Chunk::bytes(bytes)])
    }
}

impl Encoder for BincodeEncoder {
    fn content_type(&self) -> &'static str {
        "application/x-bincode"
    }
}

/// Binary codec standing in for the reference implementation's pickle-based
/// decoder; round-trips any `serde`-derived value through `bincode`.
#[derive(Default)]
pub struct BincodeDecoder;

impl Decoder for BincodeDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<Chunk, EngineError> {
        let counts: std::collections::BTreeMap<String, u64> =
            bincode::deserialize(bytes).map_err(|err| EngineError::Extraction {
                node: "BincodeDecoder".to_owned(),
                source: err,
            })?;
        Ok(Chunk::Counts(counts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_round_trips_and_shrinks_repetitive_text() {
        let mut encoder = GzipEncoder::default();
        let text = "lorem ipsum ".repeat(200).to_lowercase();
        let chunks = encoder.process(Chunk::text(text.clone())).unwrap();
        assert!(chunks.is_empty());
        let flushed = encoder.process_final().unwrap();
        let compressed = flushed[0].as_bytes().unwrap();
        assert!(compressed.len() < text.len());

        let decoded = GzipDecoder.decode(compressed).unwrap();
        assert_eq!(decoded.as_text().unwrap(), text);
    }

    #[test]
    fn json_encoder_round_trips_counts() {
        let mut counts = std::collections::BTreeMap::new();
        counts.insert("lamb".to_string(), 3u64);
        let mut encoder = JsonEncoder::default();
        let bytes = encoder.process(Chunk::Counts(counts.clone())).unwrap();
        let json_bytes = bytes[0].as_bytes().unwrap();
        let decoded = JsonDecoder.decode(json_bytes).unwrap();
        match decoded {
            Chunk::Json(serde_json::Value::Object(map)) => {
                assert_eq!(map["lamb"], serde_json::json!(3));
            }
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn bincode_decoder_round_trips_counts() {
        let mut counts = std::collections::BTreeMap::new();
        counts.insert("a".to_string(), 1u64);
        let bytes = bincode::serialize(&counts).unwrap();
        let decoded = BincodeDecoder.decode(&bytes).unwrap();
        match decoded {
            Chunk::Counts(c) => assert_eq!(c, counts),
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn bincode_encoder_pairs_with_bincode_decoder() {
        let mut counts = std::collections::BTreeMap::new();
        counts.insert("lamb".to_string(), 3u64);
        let mut encoder = BincodeEncoder::default();
        let out = encoder.process(Chunk::Counts(counts.clone())).unwrap();
        let decoded = BincodeDecoder.decode(out[0].as_bytes().unwrap()).unwrap();
        match decoded {
            Chunk::Counts(c) => assert_eq!(c, counts),
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn text_decoder_reads_utf8() {
        let decoded = TextDecoder.decode("mary had a lamb".as_bytes()).unwrap();
        assert_eq!(decoded.as_text().unwrap(), "mary had a lamb");
    }
}
