// Module for query result exports streamed to disk
pub mod ejson;
pub mod manager;
pub mod source;

pub use ejson::{EjsonArrayWriter, JsonExportFormat, encode_document};
pub use manager::{
    AvailableExport, CreateExport, ExportContent, ExportEvent, ExportsConfig, ExportsManager, StoredExport,
    normalize_export_name,
};
pub use source::{DocumentSource, StreamSource};
