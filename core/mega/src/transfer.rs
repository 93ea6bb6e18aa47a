//! Encrypted upload and download.

use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use stowage_common::cancel::run_cancellable;
use stowage_common::{
    ByteRange, CancellationToken, ChunkReader, Error, ProgressCallback, ProgressTracker, Result,
    RetryExecutor, SizedStream,
};
use stowage_crypto::{ChunkCipher, FileKey, RangeDecryptor};

use crate::api::ApiClient;
use crate::error::error_from_code;

/// Interpret a chunk upload response: empty while more data is expected,
/// the completion handle after the last chunk, or a negative error code.
fn parse_chunk_response(body: &str) -> Result<Option<String>> {
    let body = body.trim();
    if body.is_empty() {
        return Ok(None);
    }
    if let Ok(code) = body.parse::<i64>() {
        if code < 0 {
            return Err(error_from_code(code, "upload"));
        }
    }
    Ok(Some(body.to_string()))
}

/// Encrypt and upload `source`; returns the completion handle and the key
/// carrying the computed meta-MAC.
pub(crate) async fn upload(
    api: &ApiClient,
    sid: &str,
    source: SizedStream,
    progress: Option<ProgressCallback>,
    token: &CancellationToken,
) -> Result<(String, FileKey)> {
    let size = source.len();
    let slot = api
        .call(Some(sid), json!({"a": "u", "s": size}), token)
        .await?;
    let url = slot
        .get("p")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Serialization("'u' response lacks 'p'".to_string()))?
        .to_string();

    let key = FileKey::generate();
    let mut cipher = ChunkCipher::new(&key);
    let mut reader = ChunkReader::new(source.into_checked_stream());
    let mut tracker = ProgressTracker::new(progress);
    let executor = RetryExecutor::new(api.retry_config().clone());
    let mut completion = None;
    let mut offset = 0u64;

    loop {
        let chunk = reader.read_chunk(cipher.next_chunk_len(), token).await?;
        let Some(chunk) = chunk else {
            break;
        };
        let len = chunk.len() as u64;
        let mut data = chunk.to_vec();
        cipher.encrypt_chunk(&mut data);
        let data = Bytes::from(data);

        let chunk_url = format!("{}/{}", url, offset);
        let body = executor
            .execute(token, || {
                let data = data.clone();
                let chunk_url = chunk_url.as_str();
                async move {
                    let body =
                        run_cancellable(token, api.transport().post_chunk(chunk_url, data)).await?;
                    parse_chunk_response(&body)
                }
            })
            .await?;
        if body.is_some() {
            completion = body;
        }

        offset += len;
        tracker.advance(len);
    }

    if size == 0 {
        let body = run_cancellable(
            token,
            api.transport().post_chunk(&format!("{}/0", url), Bytes::new()),
        )
        .await?;
        completion = parse_chunk_response(&body)?;
    }

    let completion = completion.ok_or_else(|| {
        Error::Network("Upload finished without a completion handle".to_string())
    })?;
    debug!("Uploaded {} encrypted bytes", offset);
    Ok((completion, key.with_meta_mac(cipher.meta_mac())))
}

/// Download, decrypt and verify a whole file.
///
/// Chunks are written as they are decrypted; a MAC mismatch at the end
/// fails the call with `CorruptData`.
pub(crate) async fn download_full(
    api: &ApiClient,
    url: &str,
    key: &FileKey,
    size: u64,
    dest: &mut (dyn AsyncWrite + Send + Unpin),
    progress: Option<ProgressCallback>,
    token: &CancellationToken,
) -> Result<u64> {
    let stream = run_cancellable(token, api.transport().get_stream(url)).await?;
    let mut reader = ChunkReader::new(stream);
    let mut cipher = ChunkCipher::new(key);
    let mut tracker = ProgressTracker::new(progress);
    let mut written = 0u64;

    while let Some(chunk) = reader.read_chunk(cipher.next_chunk_len(), token).await? {
        let mut data = chunk.to_vec();
        cipher.decrypt_chunk(&mut data);
        run_cancellable(token, async { Ok(dest.write_all(&data).await?) }).await?;
        written += data.len() as u64;
        tracker.advance(data.len() as u64);
    }

    if written != size {
        return Err(Error::CorruptData(format!(
            "Download ended after {} of {} bytes",
            written, size
        )));
    }
    cipher.verify(key)?;
    dest.flush().await?;
    Ok(written)
}

/// Download and decrypt part of a file. Not MAC-verified.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn download_range(
    api: &ApiClient,
    url: &str,
    key: &FileKey,
    size: u64,
    range: ByteRange,
    dest: &mut (dyn AsyncWrite + Send + Unpin),
    progress: Option<ProgressCallback>,
    token: &CancellationToken,
) -> Result<u64> {
    let (start, end) = range.resolve(size)?;
    let mut stream = run_cancellable(
        token,
        api.transport().get_stream(&format!("{}/{}-{}", url, start, end)),
    )
    .await?;
    let mut decryptor = RangeDecryptor::new(key, start);
    let mut tracker = ProgressTracker::new(progress);
    let expected = end - start + 1;
    let mut written = 0u64;

    while let Some(frame) = run_cancellable(token, async { Ok(stream.next().await) }).await? {
        let mut data = frame?.to_vec();
        if written + data.len() as u64 > expected {
            return Err(Error::CorruptData(format!(
                "Range response exceeds the requested {} bytes",
                expected
            )));
        }
        decryptor.apply(&mut data);
        run_cancellable(token, async { Ok(dest.write_all(&data).await?) }).await?;
        written += data.len() as u64;
        tracker.advance(data.len() as u64);
    }

    if written != expected {
        return Err(Error::CorruptData(format!(
            "Range response ended after {} of {} bytes",
            written, expected
        )));
    }
    dest.flush().await?;
    Ok(written)
}
