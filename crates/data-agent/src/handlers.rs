//! Read and write handlers binding the archiver to HTTP.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use axum::extract::Request;
use axum::http::header::{CONTENT_TYPE, TRAILER};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodRouter, get, post};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use http_body::Frame;
use knitfab_archive::{Checksum, Md5Reader, Md5Writer, TarOptions, go_tar, go_untar};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api_error::ApiError;
use crate::body::{BodyReader, ChannelWriter, FrameSender, channel_body};
use crate::{CHECKSUM_TRAILER, CONTENT_TYPE_TAR_GZIP};

type TarSink = Md5Writer<GzEncoder<ChannelWriter>>;
type TarSource = Md5Reader<GzDecoder<BodyReader>>;

/// `GET` route streaming the tree under `root` as tar+gzip.
pub fn reader(root: PathBuf) -> MethodRouter {
    get(move || send_tree(root))
}

/// `POST` route extracting a tar+gzip body into the empty directory `root`.
pub fn writer(root: PathBuf) -> MethodRouter {
    post(move |request: Request| receive_tree(root, request))
}

async fn send_tree(root: PathBuf) -> Response {
    match tokio::fs::metadata(&root).await {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            debug!(root = %root.display(), "source is not a directory");
            return ApiError::not_found().into_response();
        }
        Err(err) => {
            debug!(root = %root.display(), error = %err, "source is not accessible");
            return ApiError::not_found().into_response();
        }
    }

    let (tx, body) = channel_body();
    let sink = Md5Writer::new(GzEncoder::new(ChannelWriter::new(tx.clone()), Compression::default()));
    let cancel = CancellationToken::new();
    let progress = go_tar(cancel.clone(), &root, sink, TarOptions::default());

    tokio::spawn(async move {
        tokio::select! {
            _ = progress.done() => {}
            _ = tx.closed() => {
                debug!("client went away; cancelling archive");
                cancel.cancel();
                progress.done().await;
            }
        }

        if let Some(err) = progress.error() {
            warn!(root = %root.display(), error = %err, "archiving failed");
            abort(&tx, io::Error::other(err.to_string())).await;
            return;
        }
        let Some(sink) = progress.take_stream() else {
            abort(&tx, io::Error::other("archive stream missing")).await;
            return;
        };

        match tokio::task::spawn_blocking(move || finish_gzip(sink)).await {
            Ok(Ok(checksum)) => {
                info!(
                    root = %root.display(),
                    bytes = progress.progressed_size(),
                    checksum = %checksum,
                    "tree sent"
                );
                send_trailer(&tx, &checksum).await;
            }
            Ok(Err(err)) => {
                warn!(error = %err, "finishing gzip stream failed");
                abort(&tx, err).await;
            }
            Err(err) => abort(&tx, io::Error::other(err)).await,
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, CONTENT_TYPE_TAR_GZIP)
        .header(TRAILER, CHECKSUM_TRAILER)
        .body(body)
        .unwrap_or_else(|err| ApiError::internal(err).into_response())
}

/// Writes the gzip footer and returns the checksum of the tar stream.
fn finish_gzip(sink: TarSink) -> io::Result<String> {
    let checksum = sink.hex_sum();
    let mut out = sink.into_inner().finish()?;
    out.flush()?;
    Ok(checksum)
}

async fn send_trailer(tx: &FrameSender, checksum: &str) {
    let mut trailers = HeaderMap::new();
    match HeaderValue::from_str(checksum) {
        Ok(value) => {
            trailers.insert(CHECKSUM_TRAILER, value);
            let _ = tx.send(Ok(Frame::trailers(trailers))).await;
        }
        Err(err) => abort(tx, io::Error::other(err)).await,
    }
}

async fn abort(tx: &FrameSender, err: io::Error) {
    let _ = tx.send(Err(err)).await;
}

async fn receive_tree(root: PathBuf, request: Request) -> Response {
    match has_entries(&root).await {
        Ok(false) => {}
        Ok(true) => return ApiError::conflict("data exists already").into_response(),
        Err(err) => {
            let error = ApiError::internal(format!("{}: {err}", root.display()));
            // A missing destination is a deployment mistake, not an admin matter.
            let error = match err.kind() {
                io::ErrorKind::NotFound => error,
                _ => error.with_advice("ask your system admin."),
            };
            return error.into_response();
        }
    }

    let (body, trailers) = BodyReader::spawn(request.into_body());
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    // The decoder reads the gzip header on construction, which blocks on
    // the request body.
    let source = match tokio::task::spawn_blocking(move || open_source(body)).await {
        Ok(source) => source,
        Err(err) => return ApiError::internal(err).into_response(),
    };
    let progress = go_untar(cancel, source, &root);
    progress.done().await;

    if let Some(err) = progress.error() {
        return ApiError::internal(err).into_response();
    }
    let Some(source) = progress.take_stream() else {
        return ApiError::internal("extract stream missing").into_response();
    };
    let computed = match tokio::task::spawn_blocking(move || drain(source)).await {
        Ok(Ok(sum)) => sum,
        Ok(Err(err)) => return ApiError::internal(err).into_response(),
        Err(err) => return ApiError::internal(err).into_response(),
    };

    // A client that sent no trailers skips verification.
    let expected = trailers.await.ok().and_then(|trailers| declared_checksum(&trailers));
    if let Some(expected) = expected
        && expected != computed
    {
        warn!(root = %root.display(), %expected, %computed, "checksum mismatch");
        return ApiError::bad_request("hash is not match.").into_response();
    }

    info!(
        root = %root.display(),
        bytes = progress.progressed_size(),
        checksum = %computed,
        "tree received"
    );
    StatusCode::NO_CONTENT.into_response()
}

fn open_source(body: BodyReader) -> TarSource {
    Md5Reader::new(GzDecoder::new(body))
}

/// Returns `true` when `dir` holds at least one entry.
async fn has_entries(dir: &Path) -> io::Result<bool> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    Ok(entries.next_entry().await?.is_some())
}

/// A non-empty `x-checksum-md5` value, if any.
fn declared_checksum(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CHECKSUM_TRAILER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

/// Reads what the extractor left unread and returns the stream's checksum.
///
/// The tar trailer may be followed by padding; the sender hashed it too.
fn drain(mut source: TarSource) -> io::Result<String> {
    io::copy(&mut source, &mut io::sink())?;
    Ok(source.hex_sum())
}
