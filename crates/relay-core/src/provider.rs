use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::GenerationError;
use crate::messages::GenerationRequest;
use crate::stream::FragmentStream;

/// The generation engine as seen by the session core: something that turns a
/// request into a lazy stream of text fragments.
///
/// `stop` is a best-effort cooperative stop signal. Implementations should end
/// their stream soon after it fires, but callers must not rely on that; the
/// producer checks the same token at every fragment boundary.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    async fn generate(
        &self,
        request: GenerationRequest,
        stop: CancellationToken,
    ) -> Result<FragmentStream, GenerationError>;
}
