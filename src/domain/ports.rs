use crate::utils::error::Result;
use async_trait::async_trait;

/// Yes/no question against the target. `candidate` is the full guessed prefix.
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn probe(&self, candidate: &str) -> Result<bool>;
}

#[async_trait]
impl<O: Oracle + ?Sized> Oracle for std::sync::Arc<O> {
    async fn probe(&self, candidate: &str) -> Result<bool> {
        (**self).probe(candidate).await
    }
}
