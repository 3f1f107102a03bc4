//! Body of the `stream-session` thread
//!
//! Connects, publishes the response tags, forwards in-band titles, and
//! then plays the stream on one of two paths: chunks through the decode
//! pump (containers the output device cannot take directly), or the whole
//! reader attached to the graph as a self-timed element.
//!
//! The thread does not return before its helper threads are joined, or
//! given up on after `WORKER_JOIN_MS` and logged.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{select, Receiver};
use tracing::{debug, info, warn};

use crate::audio::decoder::DecoderService;
use crate::audio::graph::OutputGraph;
use crate::cancel::Worker;
use crate::config::network::WORKER_JOIN_MS;
use crate::config::scheduler::ELEMENT_POLL_MS;
use crate::config::PlayerConfig;
use crate::session::pump::{DecodePump, PumpExit, PumpReport};
use crate::session::scheduler::PlaybackScheduler;
use crate::session::state::{Publisher, SessionState};
use crate::stream::connector::StreamConnector;
use crate::stream::format::{detect_format_hint, needs_decoding};
use crate::stream::icy::IcyReader;
use crate::stream::metadata::TrackTitle;
use crate::stream::types::{IcyEvent, OpenedStream, StreamDescriptor};

enum Outcome {
    Ended(PumpReport),
    Cancelled,
    Failed(String),
}

pub(crate) struct SessionRunner {
    pub session: Arc<SessionState>,
    pub publisher: Publisher,
    pub descriptor: StreamDescriptor,
    pub graph: Arc<dyn OutputGraph>,
    pub decoder: DecoderService,
    pub connector: Arc<dyn StreamConnector>,
    pub config: PlayerConfig,
}

impl SessionRunner {
    pub fn run(self) {
        let token = self.session.token();
        let url = self.descriptor.url.clone();
        info!(token, url = %url, title = %self.descriptor.title, "Session started");

        let probe = self.spawn_probe(&url);
        self.connect_and_play(&url);

        if let Some(probe) = probe {
            if !probe.join_within(Duration::from_millis(WORKER_JOIN_MS)) {
                debug!(token, "format-probe left running");
            }
        }
    }

    fn connect_and_play(&self, url: &str) {
        let token = self.session.token();
        let Some(abort) = self.session.abort_handle() else {
            return;
        };
        let opened = match self.connector.open_stream(url, &abort) {
            Ok(opened) => opened,
            Err(e) if e.is_cancelled() || self.session.is_cancelled() => {
                debug!(token, "Connection cancelled");
                return;
            }
            Err(e) => {
                // Nothing left in flight; a timeout has already aborted
                self.session.take_abort();
                warn!(token, url = %url, error = %e, "Connection failed");
                self.publisher.failed(e.to_string());
                return;
            }
        };

        let OpenedStream {
            info,
            reader,
            events,
        } = opened;
        if !self.session.install_reader(reader.cancel_handle()) {
            debug!(token, "Cancelled before playback started");
            return;
        }

        let decoded = needs_decoding(info.content_type.as_deref());
        let hint = detect_format_hint(url, info.content_type.as_deref());
        info!(
            token,
            content_type = info.content_type.as_deref().unwrap_or("unknown"),
            station = info.tags.station_name().unwrap_or(""),
            decoded,
            "Connected"
        );
        self.publisher
            .connected(info.content_type.clone(), info.tags.clone(), decoded);

        let forwarder = self.spawn_forwarder(events);

        let outcome = if decoded {
            self.play_decoded(reader)
        } else {
            self.play_direct(reader, hint.as_deref())
        };

        match outcome {
            Outcome::Ended(report) => {
                info!(token, chunks = report.chunks_read, errors = report.decode_errors, "Stream ended");
                self.publisher.ended(report);
            }
            Outcome::Cancelled => debug!(token, "Playback cancelled"),
            Outcome::Failed(error) => {
                warn!(token, error = %error, "Playback failed");
                self.publisher.failed(error);
            }
        }

        if let Some(forwarder) = forwarder {
            if forwarder.join().is_err() {
                debug!(token, "icy-metadata thread panicked");
            }
        }
    }

    fn play_decoded(&self, mut reader: IcyReader) -> Outcome {
        let scheduler = PlaybackScheduler::new(
            self.graph.clone(),
            self.session.clone(),
            self.config.initial_lookahead_secs,
            self.config.min_lookahead_secs,
        );
        let mut pump = DecodePump::new(
            self.session.clone(),
            self.decoder.clone(),
            scheduler,
            self.publisher.clone(),
        );
        let exit = pump.run(&mut reader);
        self.session.release_reader();
        if !reader.shutdown(Duration::from_millis(WORKER_JOIN_MS)) {
            debug!(token = self.session.token(), "icy-reader left running");
        }
        match exit {
            PumpExit::Drained => Outcome::Ended(pump.report()),
            PumpExit::Cancelled => Outcome::Cancelled,
        }
    }

    fn play_direct(&self, reader: IcyReader, hint: Option<&str>) -> Outcome {
        let element = match self.graph.attach_element(Box::new(reader), hint) {
            Ok(element) => element,
            Err(_) if self.session.is_cancelled() => return Outcome::Cancelled,
            Err(e) => {
                self.session.release_reader();
                return Outcome::Failed(e.to_string());
            }
        };
        if let Err(element) = self.session.install_element(element) {
            element.pause();
            element.detach();
            return Outcome::Cancelled;
        }

        let poll = Duration::from_millis(ELEMENT_POLL_MS);
        loop {
            select! {
                recv(self.session.cancel_token().wake()) -> _ => return Outcome::Cancelled,
                default(poll) => {
                    if self.session.element_finished() {
                        self.session.release_reader();
                        let report = self.session.element_report().unwrap_or_default();
                        if let Some(error) = report.error {
                            return Outcome::Failed(error);
                        }
                        return Outcome::Ended(PumpReport {
                            chunks_decoded: report.packets_decoded,
                            decode_errors: report.decode_errors,
                            ..PumpReport::default()
                        });
                    }
                }
            }
        }
    }

    /// Probe the container on a second connection. Only a still-current
    /// session may publish the result.
    fn spawn_probe(&self, url: &str) -> Option<Worker> {
        let token = self.session.token();
        let connector = self.connector.clone();
        let publisher = self.publisher.clone();
        let cancel = self.session.cancel_token().clone();
        let url = url.to_string();

        let spawned = Worker::spawn("format-probe", move || {
            match connector.probe_format(&url, &cancel) {
                Ok(format) => {
                    let summary = format.to_string();
                    if publisher.format(format) {
                        debug!(token, format = %summary, "Format probed");
                    } else {
                        debug!(token, "Discarded format probe of a stale session");
                    }
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => debug!(token, error = %e, "Format probe failed"),
            }
        });
        spawned
            .map_err(|e| warn!(token, error = %e, "Failed to spawn format probe"))
            .ok()
    }

    fn spawn_forwarder(&self, events: Receiver<IcyEvent>) -> Option<JoinHandle<()>> {
        let token = self.session.token();
        let publisher = self.publisher.clone();
        let cancel = self.session.cancel_token().clone();

        thread::Builder::new()
            .name("icy-metadata".to_string())
            .spawn(move || loop {
                select! {
                    recv(events) -> msg => match msg {
                        Ok(event) => {
                            if let Some(raw) = event.title {
                                let title = TrackTitle::parse(&raw);
                                if publisher.title(title) {
                                    debug!(token, title = %raw, "Title update");
                                }
                            }
                            publisher.stats(event.stats);
                        }
                        Err(_) => break,
                    },
                    recv(cancel.wake()) -> _ => break,
                }
            })
            .map_err(|e| warn!(token, error = %e, "Failed to spawn metadata forwarder"))
            .ok()
    }
}
