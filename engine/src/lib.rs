mod chunk;
mod codec;
mod graph;
mod node;
mod source;

pub use chunk::Chunk;
pub use codec::{
    BincodeDecoder, BincodeEncoder, Decoder, Encoder, GzipDecoder, GzipEncoder, IdentityEncoder, JsonDecoder,
    JsonEncoder, RawDecoder, TextDecoder,
};
pub use graph::Graph;
pub use node::{
    Advance, AggregatorClosureNode, ClosureNode, EngineError, NodeHandle, NodeLogic, UpstreamHandle, ZipNode,
};
pub use source::{ByteStreamSource, FileSource, Source};
