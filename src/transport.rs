//! The raw streaming link.
use std::{
    collections::HashMap,
    io::{BufRead, BufReader},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use reqwest::{header::ACCEPT, Url};

use crate::{
    error::TransportError,
    scheduler::{Scheduler, TimerHandle},
    token::StreamingToken,
    Error,
};

/// Readiness of the streaming link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Request sent, response not received yet.
    Connecting,
    /// Response received, events are flowing.
    Open,
    /// No connection.
    Closed,
}

/// Something that happened on the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The server accepted the connection.
    Open,
    /// A complete server-sent event, as `field -> value`.
    Message(HashMap<String, String>),
    /// Traffic without data, proving the link is alive.
    KeepAlive,
    /// The link failed. Nothing else follows on this connection.
    Error(TransportError),
}

/// Receives the events of one connection, in order.
pub type EventSink = Box<dyn FnMut(TransportEvent) + Send>;

/// Duplex streaming link abstraction.
///
/// After [`StreamingTransport::disconnect`] returns, the sink of the closed connection receives
/// nothing more, in particular no error.
pub trait StreamingTransport: Send + Sync {
    /// Start connecting with the channels scoped by `token`. Returns immediately, the outcome is
    /// reported to `sink`.
    fn connect(&self, token: &StreamingToken, sink: EventSink);

    /// Close the current connection, if any.
    fn disconnect(&self);

    /// Disconnect after `after`, unless cancelled first.
    fn schedule_background_disconnect(&self, after: Duration);

    /// Returns `true` if a scheduled disconnect was pending and will no longer happen.
    fn cancel_scheduled_disconnect(&self) -> bool;

    /// Current state of the link.
    fn ready_state(&self) -> ReadyState;
}

/// Output of [`EventStreamParser::push_line`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    /// A complete event.
    Event(HashMap<String, String>),
    /// A comment line.
    KeepAlive,
}

/// Incremental `text/event-stream` parser.
///
/// `field:value` lines accumulate into an event which a blank line completes. Lines starting
/// with `:` are comments, used by the server as heartbeats.
#[derive(Debug, Default)]
pub struct EventStreamParser {
    current: HashMap<String, String>,
}

impl EventStreamParser {
    /// Create a parser with no pending fields.
    pub fn new() -> EventStreamParser {
        EventStreamParser::default()
    }

    /// Feed one line, without its terminator.
    pub fn push_line(&mut self, line: &str) -> Option<ParsedLine> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            if self.current.is_empty() {
                return None;
            }
            return Some(ParsedLine::Event(std::mem::take(&mut self.current)));
        }

        if line.starts_with(':') {
            return Some(ParsedLine::KeepAlive);
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        self.current
            .entry(field.to_owned())
            .and_modify(|existing| {
                existing.push('\n');
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_owned());
        None
    }
}

/// Configuration for [`HttpStreamingTransport`].
pub struct HttpStreamingTransportConfig {
    /// Streaming endpoint.
    pub streaming_url: String,
    /// Longest wait for a single read on an open stream. A reader waiting on a silent stream
    /// gives up, and releases its socket, after this long.
    pub read_timeout: Duration,
}

const SPEC_VERSION: &str = "1.1";

struct Link {
    state: ReadyState,
    /// Stop flag of the active connection, if any.
    stop: Option<Arc<AtomicBool>>,
    scheduled_disconnect: Option<TimerHandle>,
}

struct Shared {
    link: Mutex<Link>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Link> {
        self.link
            .lock()
            .expect("thread holding streaming link lock should not panic")
    }

    fn disconnect(&self) {
        let mut link = self.lock();
        if let Some(stop) = link.stop.take() {
            stop.store(true, Ordering::SeqCst);
        }
        link.state = ReadyState::Closed;
    }

    /// Update state for the connection owning `stop`, unless it was superseded.
    fn set_state(&self, stop: &Arc<AtomicBool>, state: ReadyState) -> bool {
        let mut link = self.lock();
        let current = link.stop.as_ref().map_or(false, |it| Arc::ptr_eq(it, stop));
        if current && !stop.load(Ordering::SeqCst) {
            link.state = state;
            if state == ReadyState::Closed {
                link.stop = None;
            }
            true
        } else {
            false
        }
    }
}

/// [`StreamingTransport`] over a long-lived HTTP `text/event-stream` response.
///
/// Each connection reads on a task spawned on the scheduler. Events of a disconnected reader are
/// suppressed at once; the reader itself exits on the next line it receives or, on a silent
/// stream, when the read timeout expires.
pub struct HttpStreamingTransport {
    client: reqwest::blocking::Client,
    config: HttpStreamingTransportConfig,
    scheduler: Arc<dyn Scheduler>,
    shared: Arc<Shared>,
}

impl HttpStreamingTransport {
    /// Create a transport spawning its readers on `scheduler`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        config: HttpStreamingTransportConfig,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<HttpStreamingTransport, Error> {
        // The blocking client applies its timeout to every read of the response body.
        let client = reqwest::blocking::Client::builder()
            .timeout(config.read_timeout)
            .build()?;
        Ok(HttpStreamingTransport {
            client,
            config,
            scheduler,
            shared: Arc::new(Shared {
                link: Mutex::new(Link {
                    state: ReadyState::Closed,
                    stop: None,
                    scheduled_disconnect: None,
                }),
            }),
        })
    }

    fn url(&self, token: &StreamingToken) -> Result<Url, Error> {
        let channels = token
            .channels
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(",");
        Url::parse_with_params(
            &self.config.streaming_url,
            &[
                ("v", SPEC_VERSION),
                ("channel", channels.as_str()),
                ("accessToken", token.raw.as_str()),
            ],
        )
        .map_err(Error::InvalidBaseUrl)
    }
}

impl StreamingTransport for HttpStreamingTransport {
    fn connect(&self, token: &StreamingToken, mut sink: EventSink) {
        self.disconnect();

        let url = match self.url(token) {
            Ok(url) => url,
            Err(err) => {
                log::error!(target: "flagsync", "cannot build streaming url: {err}");
                sink(TransportEvent::Error(TransportError { recoverable: false }));
                return;
            }
        };

        let stop = Arc::new(AtomicBool::new(false));
        {
            let mut link = self.shared.lock();
            link.stop = Some(Arc::clone(&stop));
            link.state = ReadyState::Connecting;
        }

        let client = self.client.clone();
        let shared = Arc::clone(&self.shared);
        self.scheduler.spawn(
            "stream",
            Box::new(move || read_stream(&client, url, &shared, &stop, sink)),
        );
    }

    fn disconnect(&self) {
        log::debug!(target: "flagsync", "disconnecting streaming link");
        self.shared.disconnect();
    }

    fn schedule_background_disconnect(&self, after: Duration) {
        let shared = Arc::clone(&self.shared);
        let handle = self.scheduler.schedule(
            after,
            Box::new(move || {
                log::debug!(target: "flagsync", "background grace period elapsed");
                shared.disconnect();
            }),
        );
        if let Some(previous) = self.shared.lock().scheduled_disconnect.replace(handle) {
            previous.cancel();
        }
    }

    fn cancel_scheduled_disconnect(&self) -> bool {
        self.shared
            .lock()
            .scheduled_disconnect
            .take()
            .map_or(false, |handle| handle.cancel())
    }

    fn ready_state(&self) -> ReadyState {
        self.shared.lock().state
    }
}

fn read_stream(
    client: &reqwest::blocking::Client,
    url: Url,
    shared: &Shared,
    stop: &Arc<AtomicBool>,
    mut sink: EventSink,
) {
    let fail = |sink: &mut EventSink, recoverable: bool| {
        if shared.set_state(stop, ReadyState::Closed) {
            sink(TransportEvent::Error(TransportError { recoverable }));
        }
    };

    let response = match client.get(url).header(ACCEPT, "text/event-stream").send() {
        Ok(response) => response,
        Err(err) => {
            log::warn!(target: "flagsync", "streaming connection failed: {:?}", Error::from(err));
            fail(&mut sink, true);
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        log::warn!(target: "flagsync", status = status.as_u16(); "streaming connection rejected");
        fail(&mut sink, status.is_server_error());
        return;
    }

    if !shared.set_state(stop, ReadyState::Open) {
        return;
    }
    log::debug!(target: "flagsync", "streaming connection open");
    sink(TransportEvent::Open);

    let mut parser = EventStreamParser::new();
    for line in BufReader::new(response).lines() {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        match line {
            Ok(line) => {
                log::trace!(target: "flagsync", line = line.as_str(); "streaming line");
                match parser.push_line(&line) {
                    Some(ParsedLine::Event(event)) => sink(TransportEvent::Message(event)),
                    Some(ParsedLine::KeepAlive) => sink(TransportEvent::KeepAlive),
                    None => {}
                }
            }
            Err(err) => {
                if !stop.load(Ordering::SeqCst) {
                    log::warn!(target: "flagsync", "streaming read failed: {:?}", err);
                }
                break;
            }
        }
    }

    fail(&mut sink, true);
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        io::{Read, Write},
        net::TcpListener,
        sync::{mpsc, Arc},
        time::Duration,
    };

    use super::{
        EventStreamParser, HttpStreamingTransport, HttpStreamingTransportConfig, ParsedLine,
        ReadyState, StreamingTransport, TransportEvent,
    };
    use crate::{
        connection::tests::token,
        scheduler::{ManualScheduler, ThreadScheduler},
    };

    #[test]
    fn parses_events_and_keep_alives() {
        let mut parser = EventStreamParser::new();

        assert_eq!(parser.push_line("id: 1"), None);
        assert_eq!(parser.push_line("event: message"), None);
        assert_eq!(parser.push_line(r#"data: {"a":1}"#), None);
        assert_eq!(
            parser.push_line(""),
            Some(ParsedLine::Event(HashMap::from([
                ("id".to_owned(), "1".to_owned()),
                ("event".to_owned(), "message".to_owned()),
                ("data".to_owned(), r#"{"a":1}"#.to_owned()),
            ])))
        );
        assert_eq!(parser.push_line(":keepalive"), Some(ParsedLine::KeepAlive));
        assert_eq!(parser.push_line(""), None, "blank line without fields is no event");
    }

    #[test]
    fn joins_multi_line_data_and_strips_carriage_returns() {
        let mut parser = EventStreamParser::new();

        parser.push_line("data:first\r");
        parser.push_line("data: second");
        parser.push_line("flag");

        let Some(ParsedLine::Event(event)) = parser.push_line("\r") else {
            panic!("expected an event");
        };
        assert_eq!(event["data"], "first\nsecond");
        assert_eq!(event["flag"], "");
    }

    fn transport(scheduler: Arc<ManualScheduler>) -> HttpStreamingTransport {
        HttpStreamingTransport::new(
            HttpStreamingTransportConfig {
                streaming_url: "https://streaming.example.com/sse".to_owned(),
                read_timeout: Duration::from_secs(70),
            },
            scheduler,
        )
        .unwrap()
    }

    #[test]
    fn background_disconnect_can_be_cancelled_before_it_fires() {
        let scheduler = Arc::new(ManualScheduler::new());
        let transport = transport(Arc::clone(&scheduler));

        transport.schedule_background_disconnect(Duration::from_secs(60));
        scheduler.advance(Duration::from_secs(30));

        assert!(transport.cancel_scheduled_disconnect());
        assert!(!transport.cancel_scheduled_disconnect());
        assert_eq!(scheduler.pending_timers(), 0);
    }

    #[test]
    fn cancel_after_background_disconnect_fired_fails() {
        let scheduler = Arc::new(ManualScheduler::new());
        let transport = transport(Arc::clone(&scheduler));

        transport.schedule_background_disconnect(Duration::from_secs(60));
        scheduler.advance(Duration::from_secs(61));

        assert!(!transport.cancel_scheduled_disconnect());
        assert_eq!(transport.ready_state(), ReadyState::Closed);
    }

    #[test]
    fn rescheduling_replaces_previous_disconnect() {
        let scheduler = Arc::new(ManualScheduler::new());
        let transport = transport(Arc::clone(&scheduler));

        transport.schedule_background_disconnect(Duration::from_secs(60));
        transport.schedule_background_disconnect(Duration::from_secs(90));

        assert_eq!(scheduler.pending_timers(), 1);
    }

    #[test]
    fn disconnected_reader_releases_a_silent_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).unwrap();
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n",
                )
                .unwrap();
            // Send nothing more and wait for the client to hang up.
            socket
                .set_read_timeout(Some(Duration::from_secs(10)))
                .unwrap();
            let mut buf = [0u8; 64];
            socket.read(&mut buf).map(|read| read == 0).unwrap_or(false)
        });

        let scheduler = Arc::new(ThreadScheduler::start().unwrap());
        let transport = HttpStreamingTransport::new(
            HttpStreamingTransportConfig {
                streaming_url: format!("http://127.0.0.1:{port}/sse"),
                read_timeout: Duration::from_secs(1),
            },
            scheduler,
        )
        .unwrap();
        let (sender, events) = mpsc::channel();
        transport.connect(
            &token(3_600),
            Box::new(move |event| {
                let _ = sender.send(event);
            }),
        );

        assert_eq!(
            events.recv_timeout(Duration::from_secs(10)),
            Ok(TransportEvent::Open)
        );
        assert_eq!(transport.ready_state(), ReadyState::Open);

        transport.disconnect();

        assert!(server.join().unwrap(), "socket closed by the client");
        assert!(events.recv_timeout(Duration::from_millis(500)).is_err());
        assert_eq!(transport.ready_state(), ReadyState::Closed);
    }
}
