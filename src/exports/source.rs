use async_trait::async_trait;
use bson::Document;
use futures::{Stream, StreamExt};
use std::pin::Pin;

/// A finite, non-restartable sequence of documents, typically a query cursor
#[async_trait]
pub trait DocumentSource: Send + 'static {
    /// Next document, `Ok(None)` once exhausted
    async fn next_document(&mut self) -> anyhow::Result<Option<Document>>;

    /// Release the underlying cursor. Called exactly once by the export pipeline.
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Adapts any stream of documents into a `DocumentSource`
pub struct StreamSource {
    stream: Pin<Box<dyn Stream<Item = anyhow::Result<Document>> + Send>>,
}

impl StreamSource {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = anyhow::Result<Document>> + Send + 'static,
    {
        StreamSource { stream: Box::pin(stream) }
    }

    pub fn from_documents(documents: Vec<Document>) -> Self {
        Self::new(futures::stream::iter(documents.into_iter().map(Ok)))
    }
}

#[async_trait]
impl DocumentSource for StreamSource {
    async fn next_document(&mut self) -> anyhow::Result<Option<Document>> {
        self.stream.next().await.transpose()
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        // Dropping the remaining stream releases whatever it holds
        self.stream = Box::pin(futures::stream::empty());
        Ok(())
    }
}
