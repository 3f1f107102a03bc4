//! Connection opener
//!
//! Performs the two independent fetches of a session: the playback request
//! (asking for in-band metadata, retried once without it) and the
//! header-free request used only to probe the format.

use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, select};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, warn};

use crate::audio::types::FormatMetadata;
use crate::cancel::{AbortHandle, CancelToken};
use crate::config::network::ICY_METADATA_HEADER;
use crate::config::PlayerConfig;
use crate::error::{PlayerError, Result};
use crate::stream::format::{self, detect_format_hint, ProbeReader};
use crate::stream::icy::IcyReader;
use crate::stream::types::{IcyTagSet, OpenedStream, ResponseInfo};

/// Network collaborator of the session controller
pub trait StreamConnector: Send + Sync {
    /// Open the playback connection. Invoking `abort` makes a pending
    /// attempt return `PlayerError::Cancelled` and stops the body reader.
    fn open_stream(&self, url: &str, abort: &AbortHandle) -> Result<OpenedStream>;

    /// Fetch the stream again without special headers and probe its
    /// container/codec metadata. Stops reading once `cancel` fires.
    fn probe_format(&self, url: &str, cancel: &CancelToken) -> Result<FormatMetadata>;
}

/// `StreamConnector` over reqwest's blocking client
pub struct HttpConnector {
    client: Client,
    connect_timeout: Duration,
    probe_byte_limit: u64,
}

impl HttpConnector {
    pub fn new(config: &PlayerConfig) -> Result<Self> {
        // The blocking client applies `timeout` to each body read, not to
        // the whole body: an idle read returns so readers can check for
        // cancellation, and a live body is read for as long as it flows.
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(config.connect_timeout())
            .timeout(config.connect_timeout())
            .build()?;

        Ok(Self {
            client,
            connect_timeout: config.connect_timeout(),
            probe_byte_limit: config.probe_byte_limit,
        })
    }

    /// Send `request` on a `thread_name` thread and wait for the response
    /// headers, the cancel token, or the connect timeout, whichever comes
    /// first. A late response is dropped with the channel.
    fn send_bounded(
        &self,
        request: RequestBuilder,
        url: &str,
        thread_name: &str,
        cancel: &CancelToken,
    ) -> Result<Response> {
        if cancel.is_cancelled() {
            return Err(PlayerError::Cancelled);
        }

        let (tx, rx) = bounded(1);
        thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || {
                let _ = tx.send(request.send());
            })
            .map_err(|e| PlayerError::Stream(format!("Failed to spawn {} thread: {}", thread_name, e)))?;

        let timed_out = || {
            PlayerError::Timeout(format!(
                "No response from {} within {} ms",
                url,
                self.connect_timeout.as_millis()
            ))
        };

        // The client's own timeout may fire first; both mean the same thing
        select! {
            recv(rx) -> msg => match msg {
                Ok(Ok(response)) if response.status().is_success() => Ok(response),
                Ok(Ok(response)) => Err(PlayerError::Stream(format!("HTTP {}", response.status()))),
                Ok(Err(e)) if e.is_timeout() => Err(timed_out()),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(PlayerError::Stream(format!("{} thread exited", thread_name))),
            },
            recv(cancel.wake()) -> _ => Err(PlayerError::Cancelled),
            default(self.connect_timeout) => Err(timed_out()),
        }
    }

    /// One playback attempt. A timeout invokes the abort handle.
    fn attempt(&self, url: &str, with_icy: bool, abort: &AbortHandle) -> Result<Response> {
        let mut request = self.client.get(url);
        if with_icy {
            request = request.header(ICY_METADATA_HEADER, "1");
        }

        match self.send_bounded(request, url, "icy-connect", abort.token()) {
            Err(e @ PlayerError::Timeout(_)) => {
                abort.abort();
                Err(e)
            }
            result => result,
        }
    }
}

fn response_info(response: &Response, icy_requested: bool) -> ResponseInfo {
    let headers = response.headers();
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let tags = IcyTagSet::from_headers(
        headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v))),
    );
    ResponseInfo {
        content_type,
        tags,
        icy_requested,
    }
}

impl StreamConnector for HttpConnector {
    fn open_stream(&self, url: &str, abort: &AbortHandle) -> Result<OpenedStream> {
        let (response, icy_requested) = match self.attempt(url, true, abort) {
            Ok(response) => (response, true),
            Err(e @ (PlayerError::Cancelled | PlayerError::Timeout(_))) => return Err(e),
            Err(e) => {
                warn!(url, error = %e, "connection with {} failed, retrying without", ICY_METADATA_HEADER);
                (self.attempt(url, false, abort)?, false)
            }
        };

        let info = response_info(&response, icy_requested);
        // Servers only interleave metadata when it was requested
        let metaint = if icy_requested { info.tags.metaint() } else { 0 };
        debug!(
            url,
            content_type = info.content_type.as_deref().unwrap_or("-"),
            metaint,
            "stream connected"
        );

        let (reader, events) = IcyReader::spawn(response, metaint, Some(abort.clone()))?;
        Ok(OpenedStream {
            info,
            reader,
            events,
        })
    }

    fn probe_format(&self, url: &str, cancel: &CancelToken) -> Result<FormatMetadata> {
        let response = self.send_bounded(self.client.get(url), url, "probe-connect", cancel)?;

        let info = response_info(&response, false);
        let hint = detect_format_hint(url, info.content_type.as_deref());
        let bitrate = info.tags.bitrate_kbps().map(|kbps| kbps * 1000);
        let reader = ProbeReader::new(response, self.probe_byte_limit, cancel.clone());
        format::probe_format(reader, hint.as_deref(), bitrate)
    }
}
