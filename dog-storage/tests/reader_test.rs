mod support;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;

use dog_storage::hash::{encode_crc32c, Crc32cHashFunction, NullHashFunction};
use dog_storage::{
    LimitedErrorCountResumePolicy, ObjectMetadata, ObjectReader, ReadPayload, ReaderConnection,
    ResumableReader, RpcMetadata, StatusCode, StorageError, StorageResult, Token,
};
use support::{eventually, ScriptedReader};

type Opens = Arc<Mutex<Vec<(Option<i64>, i64)>>>;

/// Factory handing out `readers` in order and recording every open
fn scripted_factory(
    readers: Vec<StorageResult<Arc<ScriptedReader>>>,
) -> (
    impl Fn(Option<i64>, i64) -> futures::future::Ready<StorageResult<Arc<dyn ReaderConnection>>>
        + Send
        + Sync
        + 'static,
    Opens,
) {
    let opens: Opens = Arc::new(Mutex::new(Vec::new()));
    let readers = Arc::new(Mutex::new(std::collections::VecDeque::from(readers)));
    let recorded = opens.clone();
    let factory = move |generation: Option<i64>, offset: i64| {
        recorded.lock().push((generation, offset));
        let next = readers
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(StorageError::failed_precondition("no more readers")))
            .map(|reader| reader as Arc<dyn ReaderConnection>);
        futures::future::ready(next)
    };
    (factory, opens)
}

fn payload(data: &'static str) -> StorageResult<Option<ReadPayload>> {
    Ok(Some(ReadPayload::new(Bytes::from_static(data.as_bytes()))))
}

async fn collect(reader: &ResumableReader) -> StorageResult<Vec<ReadPayload>> {
    let mut payloads = Vec::new();
    while let Some(payload) = reader.read().await? {
        payloads.push(payload);
    }
    Ok(payloads)
}

/// R1. Resumption is invisible to the consumer
#[tokio::test]
async fn test_resume_yields_seamless_sequence() {
    let metadata = ObjectMetadata::new("test-bucket", "test-object").with_generation(42);
    let first = ScriptedReader::new(vec![
        Ok(Some(ReadPayload::new(Bytes::from_static(b"1")).with_metadata(metadata))),
        payload("2"),
        Err(StorageError::unavailable("connection reset")),
    ]);
    let second = ScriptedReader::chunks(&["1", "2"], Err(StorageError::unavailable("reset again")));
    let third = ScriptedReader::chunks(&["3"], Ok(None));
    let (factory, opens) = scripted_factory(vec![Ok(first), Ok(second), Ok(third)]);

    let reader = ResumableReader::new(
        Arc::new(factory),
        Box::new(LimitedErrorCountResumePolicy::new(3)),
        Box::new(Crc32cHashFunction::new()),
    );
    let payloads = collect(&reader).await.unwrap();

    let data: Vec<&[u8]> = payloads.iter().map(|p| p.data.as_ref()).collect();
    assert_eq!(data, vec![&b"1"[..], b"2", b"1", b"2", b"3"]);
    let offsets: Vec<i64> = payloads.iter().map(|p| p.offset).collect();
    assert_eq!(offsets, vec![0, 1, 2, 3, 4]);

    // Reconnects are pinned to the generation seen first
    assert_eq!(
        *opens.lock(),
        vec![(None, 0), (Some(42), 2), (Some(42), 4)]
    );
    assert_eq!(reader.generation(), Some(42));
    assert_eq!(reader.offset(), 5);
}

/// R2. Permanent errors surface unchanged and repeat
#[tokio::test]
async fn test_permanent_error_is_terminal() {
    let denied = StorageError::rpc(StatusCode::PermissionDenied, "denied");
    let (factory, opens) =
        scripted_factory(vec![Ok(ScriptedReader::chunks(&["a"], Err(denied.clone())))]);
    let reader = ResumableReader::new(
        Arc::new(factory),
        Box::new(LimitedErrorCountResumePolicy::new(5)),
        Box::new(NullHashFunction),
    );

    assert!(reader.read().await.unwrap().is_some());
    for _ in 0..3 {
        assert_eq!(reader.read().await.unwrap_err(), denied);
    }
    assert_eq!(opens.lock().len(), 1);
}

/// R3. The last transient error propagates once the policy gives up
#[tokio::test]
async fn test_policy_exhaustion_surfaces_last_error() {
    let readers = (0..3)
        .map(|i| {
            Ok(ScriptedReader::new(vec![Err(StorageError::unavailable(format!(
                "attempt {}",
                i
            )))]))
        })
        .collect();
    let (factory, opens) = scripted_factory(readers);
    let reader = ResumableReader::new(
        Arc::new(factory),
        Box::new(LimitedErrorCountResumePolicy::new(2)),
        Box::new(NullHashFunction),
    );

    let err = reader.read().await.unwrap_err();
    assert_eq!(err, StorageError::unavailable("attempt 2"));
    assert_eq!(opens.lock().len(), 3);
}

/// R4. A failing factory ends the read without further attempts
#[tokio::test]
async fn test_factory_failure_is_terminal() {
    let (factory, opens) = scripted_factory(vec![
        Ok(ScriptedReader::chunks(&["a"], Err(StorageError::unavailable("reset")))),
        Err(StorageError::rpc(StatusCode::NotFound, "object deleted")),
    ]);
    let reader = ResumableReader::new(
        Arc::new(factory),
        Box::new(LimitedErrorCountResumePolicy::new(5)),
        Box::new(NullHashFunction),
    );

    assert!(reader.read().await.unwrap().is_some());
    let err = reader.read().await.unwrap_err();
    assert_eq!(err.code(), StatusCode::NotFound);
    assert_eq!(reader.read().await.unwrap_err(), err);
    assert_eq!(opens.lock().len(), 2);
}

/// R5. Checksums are validated over all reconnects
#[tokio::test]
async fn test_hash_mismatch_at_end_of_stream() {
    let metadata = ObjectMetadata {
        crc32c: Some(encode_crc32c(crc32c::crc32c(b"something else"))),
        ..ObjectMetadata::new("test-bucket", "test-object").with_generation(7)
    };
    let (factory, _) = scripted_factory(vec![
        Ok(ScriptedReader::new(vec![
            Ok(Some(ReadPayload::new(Bytes::from_static(b"hello ")).with_metadata(metadata))),
            Err(StorageError::unavailable("reset")),
        ])),
        Ok(ScriptedReader::chunks(&["world"], Ok(None))),
    ]);
    let reader = ResumableReader::new(
        Arc::new(factory),
        Box::new(LimitedErrorCountResumePolicy::new(5)),
        Box::new(Crc32cHashFunction::new()),
    );

    let err = collect(&reader).await.unwrap_err();
    assert_eq!(err.code(), StatusCode::InvalidArgument);
    let metadata = err.metadata();
    assert_eq!(
        metadata["computed_hash"],
        format!("crc32c={}, md5=<none>", encode_crc32c(crc32c::crc32c(b"hello world")))
    );
}

/// R6. Matching checksums pass across a reconnect
#[tokio::test]
async fn test_hash_match_across_reconnect() {
    let metadata = ObjectMetadata {
        crc32c: Some(encode_crc32c(crc32c::crc32c(b"hello world"))),
        ..ObjectMetadata::new("test-bucket", "test-object").with_generation(7)
    };
    let (factory, _) = scripted_factory(vec![
        Ok(ScriptedReader::new(vec![
            Ok(Some(ReadPayload::new(Bytes::from_static(b"hello ")).with_metadata(metadata))),
            Err(StorageError::unavailable("reset")),
        ])),
        Ok(ScriptedReader::chunks(&["world"], Ok(None))),
    ]);
    let reader = ResumableReader::new(
        Arc::new(factory),
        Box::new(LimitedErrorCountResumePolicy::new(5)),
        Box::new(Crc32cHashFunction::new()),
    );

    assert_eq!(collect(&reader).await.unwrap().len(), 2);
}

/// R7. Cancel is idempotent and stops resumption
#[tokio::test]
async fn test_cancel_before_and_during_read() {
    let (factory, opens) = scripted_factory(vec![Ok(ScriptedReader::chunks(&["a"], Ok(None)))]);
    let reader = ResumableReader::new(
        Arc::new(factory),
        Box::new(LimitedErrorCountResumePolicy::new(5)),
        Box::new(NullHashFunction),
    );

    // No active stream yet
    reader.cancel();
    reader.cancel();
    let err = reader.read().await.unwrap_err();
    assert_eq!(err.code(), StatusCode::Cancelled);
    assert!(opens.lock().is_empty());
}

/// R8. Request metadata follows the most recent stream
#[tokio::test]
async fn test_request_metadata_tracks_active_stream() {
    let first = ScriptedReader::with_metadata(
        vec![payload("a"), Err(StorageError::unavailable("reset"))],
        RpcMetadata::new().with_header("x-stream", "first"),
    );
    let second = ScriptedReader::with_metadata(
        vec![payload("b")],
        RpcMetadata::new().with_header("x-stream", "second"),
    );
    let (factory, _) = scripted_factory(vec![Ok(first), Ok(second)]);
    let reader = ResumableReader::new(
        Arc::new(factory),
        Box::new(LimitedErrorCountResumePolicy::new(5)),
        Box::new(NullHashFunction),
    );

    assert!(reader.request_metadata().is_empty());
    reader.read().await.unwrap();
    assert_eq!(reader.request_metadata().headers["x-stream"], "first");
    reader.read().await.unwrap();
    assert_eq!(reader.request_metadata().headers["x-stream"], "second");
    assert_eq!(reader.read().await.unwrap(), None);
    assert_eq!(reader.request_metadata().headers["x-stream"], "second");
}

/// H1. Tokens from nowhere never reach the connection
#[tokio::test]
async fn test_invalid_tokens_are_rejected() {
    let conn = ScriptedReader::chunks(&["a", "b"], Ok(None));
    let (reader, token) = ObjectReader::new(conn.clone());
    let (_other, foreign) = ObjectReader::new(ScriptedReader::new(vec![]));

    let err = reader.read(Token::default()).await.unwrap_err();
    assert_eq!(err.code(), StatusCode::InvalidArgument);
    let err = reader.read(foreign).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidToken { .. }));
    assert_eq!(conn.reads(), 0);

    // The legitimate token still works
    let (payload, next) = reader.read(token).await.unwrap();
    assert_eq!(payload.unwrap().data, Bytes::from_static(b"a"));
    assert!(next.valid());
    assert_eq!(conn.reads(), 1);
}

/// H2. End of stream closes the handle
#[tokio::test]
async fn test_end_of_stream_returns_invalid_token() {
    let conn = ScriptedReader::chunks(&["a"], Ok(None));
    let (reader, token) = ObjectReader::new(conn.clone());

    let (payload, token) = reader.read(token).await.unwrap();
    assert!(payload.is_some());
    let (payload, token) = reader.read(token).await.unwrap();
    assert!(payload.is_none());
    assert!(!token.valid());
    tokio_test::assert_err!(reader.read(token).await);
    assert_eq!(conn.reads(), 2);
}

/// H3. Errors close the handle
#[tokio::test]
async fn test_error_closes_handle() {
    let conn = ScriptedReader::new(vec![Err(StorageError::rpc(StatusCode::NotFound, "gone"))]);
    let (reader, token) = ObjectReader::new(conn.clone());

    let err = reader.read(token).await.unwrap_err();
    assert_eq!(err.code(), StatusCode::NotFound);
    // Dropping a closed handle does not cancel
    drop(reader);
    assert_eq!(conn.cancels(), 0);
}

/// H4. Dropping a live handle cancels and drains in the background
#[tokio::test]
async fn test_drop_cancels_and_drains() {
    let conn = ScriptedReader::chunks(&["a", "b", "c"], Ok(None));
    let (reader, token) = ObjectReader::new(conn.clone());
    let (_, _token) = reader.read(token).await.unwrap();

    drop(reader);
    assert_eq!(conn.cancels(), 1);
    let drained = conn.clone();
    eventually(move || drained.remaining() == 0).await;
}

/// H5. Handles convert into byte streams
#[tokio::test]
async fn test_into_stream() {
    let conn = ScriptedReader::chunks(&["hello ", "world"], Ok(None));
    let (reader, token) = ObjectReader::new(conn);

    let chunks: Vec<_> = reader.into_stream(token).collect().await;
    let bytes: Vec<u8> = chunks
        .into_iter()
        .map(|chunk| chunk.unwrap())
        .flat_map(|chunk| chunk.to_vec())
        .collect();
    assert_eq!(bytes, b"hello world");
}

/// H6. Stream errors surface as io errors
#[tokio::test]
async fn test_into_stream_error() {
    let conn = ScriptedReader::chunks(&["a"], Err(StorageError::unavailable("reset")));
    let (reader, token) = ObjectReader::new(conn);

    let chunks: Vec<_> = reader.into_stream(token).collect().await;
    assert_eq!(chunks.len(), 2);
    assert!(chunks[0].is_ok());
    let err = chunks[1].as_ref().unwrap_err();
    assert!(err.to_string().contains("reset"));
}
