use async_trait::async_trait;

use permsync_net::{FetchError, FetchOutcome, FetchRequest, Fetcher};

/// Where sync cycles get list bodies from.
#[async_trait]
pub trait ListSource: Send + Sync {
    async fn fetch(&self, req: &FetchRequest) -> Result<FetchOutcome, FetchError>;
}

#[async_trait]
impl ListSource for Fetcher {
    async fn fetch(&self, req: &FetchRequest) -> Result<FetchOutcome, FetchError> {
        Fetcher::fetch(self, req).await
    }
}
