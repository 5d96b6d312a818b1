use std::pin::Pin;

use futures::Stream;

use crate::errors::GenerationError;

/// Lazy, finite, non-restartable sequence of text fragments produced by a
/// generation engine. An `Err` item ends the generation.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, GenerationError>> + Send>>;

/// Box a fragment stream.
pub fn boxed<S>(stream: S) -> FragmentStream
where
    S: Stream<Item = Result<String, GenerationError>> + Send + 'static,
{
    Box::pin(stream)
}

/// A stream that yields the given fragments in order.
pub fn from_fragments<I>(fragments: I) -> FragmentStream
where
    I: IntoIterator<Item = String>,
    I::IntoIter: Send + 'static,
{
    boxed(futures::stream::iter(fragments.into_iter().map(Ok)))
}
