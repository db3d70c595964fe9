//! Incremental ingestion of streamed AI provider responses.

pub mod decoder;
pub mod parser;
pub mod reader;

pub use decoder::Utf8ChunkDecoder;
pub use parser::{StreamFormat, StreamParser};
pub use reader::{read_json_stream, read_response};
