use async_trait::async_trait;

use super::traits::{RetrievalFilter, RetrievedDocument, Retriever};

/// Retriever with no backing index. Answers are generated from history alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRetriever;

#[async_trait]
impl Retriever for NoopRetriever {
    async fn retrieve(
        &self,
        _query: &str,
        _filter: &RetrievalFilter,
        _mode: &str,
        _k: usize,
    ) -> anyhow::Result<Vec<RetrievedDocument>> {
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "noop"
    }
}
