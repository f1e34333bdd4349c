//! The parsers never perform I/O themselves. Callers feed them bytes in
//! arbitrarily sized chunks as they arrive, and each parser keeps just enough
//! state to resume where the previous chunk ended.

/// Form decoding for query strings, urlencoded bodies and cookies.
pub mod form;
/// A streaming parser for `multipart/form-data` bodies.
pub mod multipart;
/// A resumable decoder for the name-value pairs of a PARAMS stream.
pub mod params;
/// A demultiplexer splitting a record stream into per-request events.
pub mod record;

pub use form::Form;
pub use multipart::MultipartParser;
pub use params::ParamsDecoder;
pub use record::{Demux, Event};
