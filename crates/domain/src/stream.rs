use std::pin::Pin;

use crate::message::UnifiedMessage;

/// A boxed async stream, used for adapter message sequences.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// The normalized output of a backend session: one [`UnifiedMessage`] at a
/// time until the session closes.
pub type MessageStream = BoxStream<'static, UnifiedMessage>;
