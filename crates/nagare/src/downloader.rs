use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};

use bytes::Bytes;
use reqwest::{header::HeaderMap, Client};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{NagareError, NagareResult};

/// Fetches manifests and fragments.
///
/// `abort_in_flight` makes the running and every following fetch fail with
/// [NagareError::Aborted] until `reset` is called.
pub trait Downloader: Send + Sync + 'static {
    fn fetch(&self, uri: &Url) -> impl Future<Output = NagareResult<Bytes>> + Send;

    fn abort_in_flight(&self);

    fn reset(&self);
}

impl<D: Downloader> Downloader for Arc<D> {
    fn fetch(&self, uri: &Url) -> impl Future<Output = NagareResult<Bytes>> + Send {
        self.as_ref().fetch(uri)
    }

    fn abort_in_flight(&self) {
        self.as_ref().abort_in_flight()
    }

    fn reset(&self) {
        self.as_ref().reset()
    }
}

/// [Downloader] over a reqwest [Client].
pub struct HttpDownloader {
    client: Client,
    headers: HeaderMap,
    abort: Mutex<CancellationToken>,
}

impl HttpDownloader {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            headers: HeaderMap::new(),
            abort: Mutex::new(CancellationToken::new()),
        }
    }

    /// Headers sent with every request.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    fn abort_token(&self) -> CancellationToken {
        self.abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn get(&self, uri: &Url) -> NagareResult<Bytes> {
        let response = self
            .client
            .get(uri.clone())
            .headers(self.headers.clone())
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            tracing::debug!(%uri, %status, "Fetch failed");
            return Err(NagareError::HttpError(status));
        }
        Ok(response.bytes().await?)
    }
}

impl Default for HttpDownloader {
    fn default() -> Self {
        Self::new(Client::new())
    }
}

impl Downloader for HttpDownloader {
    async fn fetch(&self, uri: &Url) -> NagareResult<Bytes> {
        let abort = self.abort_token();
        tokio::select! {
            _ = abort.cancelled() => Err(NagareError::Aborted),
            result = self.get(uri) => result,
        }
    }

    fn abort_in_flight(&self) {
        self.abort_token().cancel();
    }

    fn reset(&self) {
        let mut abort = self.abort.lock().unwrap_or_else(PoisonError::into_inner);
        if abort.is_cancelled() {
            *abort = CancellationToken::new();
        }
    }
}
