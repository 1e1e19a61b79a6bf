//! Network collaborators of the media pipelines.
//!
//! The pipelines only see the traits below. [`HttpLink`] implements all of
//! them over HTTP with the device's basic-auth credentials.

use std::future::Future;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use reqwest::{Body, Client, Response, StatusCode};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::config::Config;
use crate::error::{NetError, ProfileError};
use crate::profile::DeviceProfileSnapshot;
use crate::track_id::TrackId;

/// Response to a track request.
pub struct TrackResponse {
    pub status: u16,
    /// Body length when the server sent one; `None` for chunked transfers.
    pub length: Option<u64>,
    pub body: Box<dyn TrackStream>,
}

#[async_trait]
pub trait TrackStream: Send {
    /// Reads up to `buf.len()` body bytes. Zero means nothing was available.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, NetError>;
}

/// Where compressed audio comes from.
#[async_trait]
pub trait TrackSource: Send + Sync {
    async fn open(&self, track: TrackId) -> Result<TrackResponse, NetError>;

    /// Tells the server the device is done with `track`.
    async fn finish_track(&self, track: TrackId) -> Result<(), NetError>;
}

/// Where captured audio goes.
#[async_trait]
pub trait UploadSink: Send + Sync {
    async fn open(&self) -> Result<Box<dyn UploadStream>, NetError>;
}

/// One chunked upload in progress.
#[async_trait]
pub trait UploadStream: Send {
    /// Sends `chunk` as one transfer chunk.
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), NetError>;

    /// Terminates the body and drains the response. Returns its status.
    async fn finish(self: Box<Self>) -> Result<u16, NetError>;
}

#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn fetch(&self) -> Result<DeviceProfileSnapshot, ProfileError>;
}

/// HTTP implementation of every network collaborator.
pub struct HttpLink {
    client: Client,
    profile_url: Url,
    player_url: Url,
    recorder_url: Url,
    login: String,
    password: String,
    device_id: String,
    timeout: Duration,
}

impl HttpLink {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            client: Client::builder().connect_timeout(config.net_timeout).build()?,
            profile_url: Url::parse(config.profile_url)?,
            player_url: Url::parse(config.player_url)?,
            recorder_url: Url::parse(config.recorder_url)?,
            login: config.login.to_string(),
            password: config.password.to_string(),
            device_id: config.device_id.clone(),
            timeout: config.net_timeout,
        })
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .basic_auth(&self.login, Some(&self.password))
            .header("Device-Id", &self.device_id)
    }

    // The player URL ends in the id query parameter; the id goes last.
    fn track_url(&self, track: TrackId) -> Result<Url, NetError> {
        Url::parse(&format!("{}{}", self.player_url, track))
            .map_err(|e| NetError::Transport(e.to_string()))
    }
}

/// Bounds `fut` by `limit`, turning expiry into [`NetError::Timeout`].
async fn bounded<T, E>(
    limit: Duration,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, NetError>
where
    NetError: From<E>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(NetError::from),
        Err(_) => Err(NetError::Timeout(limit)),
    }
}

#[async_trait]
impl TrackSource for HttpLink {
    async fn open(&self, track: TrackId) -> Result<TrackResponse, NetError> {
        let url = self.track_url(track)?;
        log::debug!("GET {}", url);
        let request = self.request(reqwest::Method::GET, url).send();
        let response = bounded(self.timeout, request).await?;
        Ok(TrackResponse {
            status: response.status().as_u16(),
            length: response.content_length(),
            body: Box::new(HttpTrackStream {
                response,
                pending: Bytes::new(),
                timeout: self.timeout,
            }),
        })
    }

    // The server releases whatever track the device holds; the id is not sent.
    async fn finish_track(&self, track: TrackId) -> Result<(), NetError> {
        log::debug!("DELETE {} (track {})", self.player_url, track);
        let response = self
            .request(reqwest::Method::DELETE, self.player_url.clone())
            .timeout(self.timeout)
            .send()
            .await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            s => Err(NetError::Status(s.as_u16())),
        }
    }
}

struct HttpTrackStream {
    response: Response,
    pending: Bytes,
    timeout: Duration,
}

#[async_trait]
impl TrackStream for HttpTrackStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, NetError> {
        if self.pending.is_empty() {
            match bounded(self.timeout, self.response.chunk()).await? {
                Some(chunk) => self.pending = chunk,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending.split_to(n));
        Ok(n)
    }
}

#[async_trait]
impl UploadSink for HttpLink {
    async fn open(&self) -> Result<Box<dyn UploadStream>, NetError> {
        let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(8);
        let body = Body::wrap_stream(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }));
        let request = self
            .request(reqwest::Method::POST, self.recorder_url.clone())
            .header(reqwest::header::CONTENT_TYPE, "audio/wav")
            .body(body);
        log::debug!("POST {} (chunked)", self.recorder_url);
        Ok(Box::new(HttpUploadStream {
            tx,
            response: tokio::spawn(request.send()),
            timeout: self.timeout,
        }))
    }
}

struct HttpUploadStream {
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
    response: JoinHandle<Result<Response, reqwest::Error>>,
    timeout: Duration,
}

#[async_trait]
impl UploadStream for HttpUploadStream {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), NetError> {
        if self.response.is_finished() {
            return Err(NetError::Closed);
        }
        self.tx
            .send(Ok(Bytes::copy_from_slice(chunk)))
            .await
            .map_err(|_| NetError::Closed)
    }

    async fn finish(self: Box<Self>) -> Result<u16, NetError> {
        let Self {
            tx,
            response,
            timeout,
        } = *self;
        drop(tx);
        let response = match tokio::time::timeout(timeout, response).await {
            Ok(joined) => joined.map_err(|e| NetError::Transport(e.to_string()))??,
            Err(_) => return Err(NetError::Timeout(timeout)),
        };
        let status = response.status().as_u16();
        let body = bounded(timeout, response.bytes()).await?;
        log::debug!("upload finished: status={}, {} response bytes", status, body.len());
        Ok(status)
    }
}

#[async_trait]
impl ProfileSource for HttpLink {
    async fn fetch(&self) -> Result<DeviceProfileSnapshot, ProfileError> {
        let response = self
            .request(reqwest::Method::GET, self.profile_url.clone())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(NetError::from)?;
        match response.status() {
            StatusCode::OK => {
                let text = response.text().await.map_err(NetError::from)?;
                DeviceProfileSnapshot::parse(&text)
            }
            StatusCode::UNAUTHORIZED => Err(ProfileError::Unauthorized),
            s => Err(NetError::Status(s.as_u16()).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_url_fills_id_query() {
        let config = Config::new().unwrap();
        let link = HttpLink::new(&config).unwrap();
        let track: TrackId = "6f1c2a9e-0b7d-4c1e-9a3f-2d4b5c6e7f80".parse().unwrap();
        let url = link.track_url(track).unwrap();
        assert_eq!(url.path(), "/teddyserver-rest/webapis/0.1/device/sound");
        assert_eq!(url.query(), Some("id=6f1c2a9e-0b7d-4c1e-9a3f-2d4b5c6e7f80"));
    }

    #[tokio::test]
    async fn test_bounded_maps_expiry_to_timeout() {
        let limit = Duration::from_millis(10);
        let stalled = std::future::pending::<Result<(), NetError>>();
        assert!(matches!(bounded(limit, stalled).await, Err(NetError::Timeout(d)) if d == limit));

        let ready = async { Ok::<_, NetError>(7) };
        assert_eq!(bounded(limit, ready).await.unwrap(), 7);
    }
}
