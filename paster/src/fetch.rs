//! This module provides fragment fetching features.

use std::future::Future;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::stream::TryStreamExt;
use reqwest::header::HeaderMap;
use thiserror::Error;

pub use reqwest::Client;
pub use url::Url;

use crate::fragment::{Fragment, OutOfRange};
use crate::png::{self, Image};

/// Response header carrying the sequence index of the returned strip (`X-Ece252-Fragment`).
pub const SEQUENCE_HEADER: &str = "x-ece252-fragment";

/// Default upper bound of a response body; a strip is expected to be far smaller.
pub const MAX_BODY_LEN: usize = 16 * 1_024 * 1_024;

const RECV_BUF_SIZE: usize = 64 * 1_024;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error("response has no `X-Ece252-Fragment` header")]
    MissingSequence,
    #[error("invalid fragment sequence index `{0}`")]
    InvalidSequence(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("response body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
    #[error(transparent)]
    Png(#[from] png::Error),
    #[error(transparent)]
    Store(#[from] OutOfRange),
}

/// A fetched, not yet decoded fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFragment {
    pub index: usize,
    /// A whole single-strip image stream.
    pub body: Bytes,
}

impl RawFragment {
    /// Decode the strip image and check it can be stacked with others.
    pub fn decode(&self) -> Result<Fragment, Error> {
        let image = Image::decode(&self.body[..])?;

        Ok(Fragment::new(self.index, image))
    }
}

/// Anything returning some fragment on each request, usually a randomly chosen one.
pub trait FragmentSource: Send + Sync + 'static {
    /// Fetch one fragment.
    fn fetch(&self) -> impl Future<Output = Result<RawFragment, Error>> + Send;
}

/// A fragment server reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
    url: Url,
    max_body_len: usize,
}

impl HttpSource {
    pub fn new(url: Url) -> Self {
        Self {
            client: Client::default(),
            url,
            max_body_len: MAX_BODY_LEN,
        }
    }

    #[inline]
    pub fn with_client(self, client: Client) -> Self {
        Self { client, ..self }
    }

    /// Fail any fetch whose body is longer than `max_body_len` bytes.
    #[inline]
    pub fn with_max_body_len(self, max_body_len: usize) -> Self {
        Self { max_body_len, ..self }
    }

    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl FragmentSource for HttpSource {
    async fn fetch(&self) -> Result<RawFragment, Error> {
        tracing::trace!("Fetching fragment from `{}`", self.url);

        let resp = self.client.get(self.url.clone()).send().await?.error_for_status()?;

        // an unreadable index must not alias another fragment, so the fetch fails instead
        let index = sequence(resp.headers())?;

        let limit = self.max_body_len;
        let capacity = match resp.content_length().map(usize::try_from) {
            Some(Ok(len)) if len <= limit => len,
            Some(_) => return Err(Error::BodyTooLarge { limit }),
            None => RECV_BUF_SIZE.min(limit),
        };

        let body = resp
            .bytes_stream()
            .map_err(Error::from)
            .try_fold(BytesMut::with_capacity(capacity), |mut buf, chunk| async move {
                if buf.len() + chunk.len() > limit {
                    return Err(Error::BodyTooLarge { limit });
                }

                buf.extend_from_slice(&chunk);
                Ok(buf)
            })
            .await?;

        Ok(RawFragment {
            index,
            body: body.freeze(),
        })
    }
}

fn sequence(headers: &HeaderMap) -> Result<usize, Error> {
    let value = headers.get(SEQUENCE_HEADER).ok_or(Error::MissingSequence)?;

    value
        .to_str()
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .ok_or_else(|| Error::InvalidSequence(String::from_utf8_lossy(value.as_bytes()).into_owned()))
}
