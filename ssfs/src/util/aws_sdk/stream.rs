use aws_smithy_async::future::pagination_stream::PaginationStream;
use aws_smithy_types::byte_stream::{error::Error as ByteStreamError, ByteStream};
use bytes::Bytes;
use futures::stream;
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;

/// Converts [`Self`] into [`Stream`].
///
/// The AWS SDK has its own stream-like types which don't implement the `futures` `Stream` trait.
pub(crate) trait IntoStream {
    type Item;

    fn into_stream(self) -> Pin<Box<dyn Stream<Item = Self::Item> + Send>>;
}

/// Converts [`PaginationStream`] (as produced by the `into_paginator` APIs) into [`Stream`].
impl<T> IntoStream for PaginationStream<T>
where
    T: Send + Unpin + 'static,
{
    type Item = T;

    fn into_stream(self) -> Pin<Box<dyn Stream<Item = Self::Item> + Send + 'static>> {
        stream::unfold(self, |mut state| async move {
            state.next().await.map(|item| (item, state))
        })
        .boxed()
    }
}

/// Converts the body of an object read from S3 into [`Stream`] of chunks.
impl IntoStream for ByteStream {
    type Item = Result<Bytes, ByteStreamError>;

    fn into_stream(self) -> Pin<Box<dyn Stream<Item = Self::Item> + Send + 'static>> {
        stream::unfold(self, |mut body| async move {
            body.next().await.map(|chunk| (chunk, body))
        })
        .boxed()
    }
}
