use bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Numeric encoding used for exported documents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonExportFormat {
    /// Plain JSON numbers where lossless (`{"a": 1}`)
    #[default]
    Relaxed,
    /// Type-preserving wrappers (`{"a": {"$numberInt": "1"}}`)
    Canonical,
}

/// Encode a single document as one line of extended JSON
pub fn encode_document(document: Document, format: JsonExportFormat) -> String {
    let value = match format {
        JsonExportFormat::Relaxed => Bson::Document(document).into_relaxed_extjson(),
        JsonExportFormat::Canonical => Bson::Document(document).into_canonical_extjson(),
    };
    value.to_string()
}

/// Incrementally writes documents as a single JSON array.
///
/// The first element is written with the opening bracket, later ones are
/// prefixed with `,\n`; `finish` closes the array, producing `[]` when nothing
/// was written.
pub struct EjsonArrayWriter<W> {
    writer: W,
    format: JsonExportFormat,
    count: u64,
}

impl<W: AsyncWrite + Unpin> EjsonArrayWriter<W> {
    pub fn new(writer: W, format: JsonExportFormat) -> Self {
        EjsonArrayWriter { writer, format, count: 0 }
    }

    pub async fn write_document(&mut self, document: Document) -> std::io::Result<()> {
        let prefix = if self.count == 0 { "[" } else { ",\n" };
        let encoded = encode_document(document, self.format);
        self.writer.write_all(prefix.as_bytes()).await?;
        self.writer.write_all(encoded.as_bytes()).await?;
        self.count += 1;
        Ok(())
    }

    /// Close the array and flush, returning the number of documents written
    pub async fn finish(mut self) -> std::io::Result<u64> {
        let closing: &[u8] = if self.count == 0 { b"[]" } else { b"]" };
        self.writer.write_all(closing).await?;
        self.writer.flush().await?;
        Ok(self.count)
    }
}
