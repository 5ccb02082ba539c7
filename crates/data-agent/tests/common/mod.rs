//! Loopback HTTP/1 client helpers.

#![allow(dead_code)]

use std::io::Read;
use std::path::Path;

use axum::body::Body;
use axum::http::{HeaderMap, Request, Response};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use md5::{Digest, Md5};
use tokio::net::TcpStream;

/// Sends one request over a fresh connection.
pub async fn send(port: u16, request: Request<Body>) -> hyper::Result<Response<Incoming>> {
    let stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("connect to agent");
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        let _ = conn.await;
    });
    sender.send_request(request).await
}

/// Reads a whole response body with its trailers.
pub async fn collect(response: Response<Incoming>) -> (Bytes, Option<HeaderMap>) {
    let collected = response.into_body().collect().await.expect("read body");
    let trailers = collected.trailers().cloned();
    (collected.to_bytes(), trailers)
}

pub async fn json(response: Response<Incoming>) -> serde_json::Value {
    let (bytes, _) = collect(response).await;
    serde_json::from_slice(&bytes).expect("JSON error body")
}

/// Decompresses a tar.gz payload.
pub fn gunzip(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(bytes)
        .read_to_end(&mut out)
        .expect("valid gzip");
    out
}

pub fn md5_hex(bytes: &[u8]) -> String {
    hex::encode(Md5::digest(bytes))
}

/// Relative paths of the entries in a tar stream, in stream order.
pub fn entry_names(tar_bytes: &[u8]) -> Vec<String> {
    let mut archive = tar::Archive::new(tar_bytes);
    archive
        .entries()
        .expect("tar entries")
        .map(|entry| {
            let entry = entry.expect("tar entry");
            entry.path().expect("entry path").to_string_lossy().into_owned()
        })
        .collect()
}

/// Sorted names directly under `dir`.
pub fn listing(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .expect("read_dir")
        .map(|entry| entry.expect("dir entry").file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
