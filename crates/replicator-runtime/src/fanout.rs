//! Splitting one body stream across several consumers.

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use replicator_core::{ByteStream, ReplicatorError, Result};

/// Split `body` into `n` streams that each yield every chunk.
///
/// Chunks are shared, not copied. The returned pump future drives the
/// source and must be polled alongside the consumers. A consumer that stops
/// reading never holds back the others; the pump stops early once every
/// consumer is gone. A source error is delivered to every consumer as a
/// [`ReplicatorError::Stream`].
pub fn tee(body: ByteStream, n: usize) -> (Vec<ByteStream>, BoxFuture<'static, ()>) {
    let mut senders = Vec::with_capacity(n);
    let mut outputs = Vec::with_capacity(n);
    for _ in 0..n {
        let (tx, rx) = mpsc::unbounded_channel::<Result<bytes::Bytes>>();
        senders.push(tx);
        outputs.push(UnboundedReceiverStream::new(rx).boxed());
    }

    let pump = async move {
        let mut body = body;
        while let Some(item) = body.next().await {
            match item {
                Ok(chunk) => {
                    senders.retain(|tx| tx.send(Ok(chunk.clone())).is_ok());
                    if senders.is_empty() {
                        break;
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    for tx in &senders {
                        let _ = tx.send(Err(ReplicatorError::Stream {
                            message: message.clone(),
                        }));
                    }
                    break;
                }
            }
        }
    }
    .boxed();

    (outputs, pump)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;
    use futures::TryStreamExt;
    use replicator_core::storage::bytes_to_stream;

    #[tokio::test]
    async fn test_every_output_sees_every_chunk() {
        let (outputs, pump) = tee(bytes_to_stream(Bytes::from("hello world"), 3), 3);
        pump.await;
        for output in outputs {
            let chunks: Vec<Bytes> = output.try_collect().await.unwrap();
            assert_eq!(chunks.concat(), b"hello world".to_vec());
        }
    }

    #[tokio::test]
    async fn test_dropped_output_does_not_block_others() {
        let (mut outputs, pump) = tee(bytes_to_stream(Bytes::from("abcdef"), 1), 2);
        drop(outputs.remove(0));
        pump.await;
        let chunks: Vec<Bytes> = outputs.remove(0).try_collect().await.unwrap();
        assert_eq!(chunks.len(), 6);
    }

    #[tokio::test]
    async fn test_source_error_reaches_every_output() {
        let body: ByteStream = stream::iter(vec![
            Ok(Bytes::from("a")),
            Err(ReplicatorError::Stream {
                message: "reset".into(),
            }),
        ])
        .boxed();
        let (outputs, pump) = tee(body, 2);
        pump.await;
        for output in outputs {
            let result: Result<Vec<Bytes>> = output.try_collect().await;
            assert!(matches!(result, Err(ReplicatorError::Stream { .. })));
        }
    }
}
