//! Read loop for the Extech EA15.
//!
//! The meter sends a live packet roughly every 1.5 s and nothing in between,
//! so a read that times out with bytes already buffered marks the end of a
//! packet. Datalog retrieval rides on the same stream: after a live packet
//! the host answers with a trigger byte, the meter replies with the payload
//! length and then the payload itself.

use chrono::Utc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::models::{DatalogSession, Reading};
use crate::protocol::{self, Packet, REQUEST_CONTINUE, REQUEST_LENGTH};
use crate::serial::SerialLink;

/// Datalog download progress.
///
/// | from           | on                         | to             |
/// |----------------|----------------------------|----------------|
/// | `Idle`         | pending request            | `Requested`    |
/// | `Requested`    | live packet (sends 0x41)   | `Requested`    |
/// | any            | length packet, length 0    | `Idle` (empty batch) |
/// | any            | length packet, length n    | `AwaitingBulk` |
/// | `AwaitingBulk` | live packet (sends 0x55)   | `AwaitingBulk` |
/// | `AwaitingBulk` | bulk packet of n + 2 bytes | `Idle`         |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Idle,
    Requested,
    AwaitingBulk { expected: usize },
}

/// Outcome of one call to [`Ea15::read_event`].
#[derive(Debug, Clone)]
pub enum Event {
    Reading(Reading),
    /// A finished download. Empty when the meter reports no stored data.
    DatalogBatch(Vec<DatalogSession>),
    /// No bytes arrived before the abort threshold.
    NoResult,
}

#[derive(Debug, Clone, Copy)]
pub struct FramingTimeouts {
    /// Quiet time with an empty buffer before framing restarts.
    pub hang: Duration,
    /// How long a framing attempt waits for its first byte.
    pub abort: Duration,
}

impl Default for FramingTimeouts {
    fn default() -> Self {
        Self {
            hang: Duration::from_millis(500),
            abort: Duration::from_secs(5),
        }
    }
}

pub struct Ea15<L: SerialLink> {
    link: L,
    state: DownloadState,
    download_requested: bool,
    timeouts: FramingTimeouts,
}

impl<L: SerialLink> Ea15<L> {
    pub fn new(link: L) -> Self {
        Self::with_timeouts(link, FramingTimeouts::default())
    }

    pub fn with_timeouts(link: L, timeouts: FramingTimeouts) -> Self {
        Self {
            link,
            state: DownloadState::Idle,
            download_requested: false,
            timeouts,
        }
    }

    pub fn state(&self) -> DownloadState {
        self.state
    }

    /// Asks for a datalog download. Ignored while one is in progress.
    pub fn request_download(&mut self) {
        if self.state == DownloadState::Idle {
            self.download_requested = true;
        }
    }

    /// Reads until a live reading or a complete datalog is decoded, or the
    /// stream goes silent for longer than the abort threshold.
    pub fn read_event(&mut self) -> Result<Event> {
        loop {
            if self.download_requested && self.state == DownloadState::Idle {
                self.state = DownloadState::Requested;
                self.download_requested = false;
            }

            let Some(buf) = self.frame()? else {
                return Ok(Event::NoResult);
            };

            if let Some(event) = self.handle_frame(&buf)? {
                return Ok(event);
            }
        }
    }

    /// Accumulates bytes until a timed-out read ends the packet. `None` means
    /// nothing arrived before the abort threshold. Once bytes are flowing the
    /// packet is read to its end regardless of size.
    fn frame(&mut self) -> Result<Option<Vec<u8>>> {
        let started = Instant::now();
        let mut quiet_since = started;
        let mut buf = Vec::new();

        loop {
            match self.link.read_byte()? {
                Some(byte) => buf.push(byte),
                None if !buf.is_empty() => return Ok(Some(buf)),
                None => {
                    if started.elapsed() > self.timeouts.abort {
                        warn!("no bytes within {:?}, aborting read", self.timeouts.abort);
                        return Ok(None);
                    }
                    if quiet_since.elapsed() > self.timeouts.hang {
                        debug!("no bytes for {:?}, restarting framing", self.timeouts.hang);
                        quiet_since = Instant::now();
                    }
                }
            }
        }
    }

    fn expected_bulk(&self) -> usize {
        match self.state {
            DownloadState::AwaitingBulk { expected } => expected,
            _ => 0,
        }
    }

    fn send_trigger(&mut self, byte: u8) -> Result<()> {
        self.link.write_all(&[byte])?;
        self.link.flush()
    }

    fn handle_frame(&mut self, buf: &[u8]) -> Result<Option<Event>> {
        let Some(packet) = protocol::classify(buf, self.expected_bulk()) else {
            warn!("unable to decode: {}", protocol::hex(buf));
            return Ok(None);
        };

        match packet {
            Packet::Live => {
                match self.state {
                    DownloadState::Requested => self.send_trigger(REQUEST_LENGTH)?,
                    DownloadState::AwaitingBulk { .. } => self.send_trigger(REQUEST_CONTINUE)?,
                    DownloadState::Idle => {}
                }
                Ok(Some(Event::Reading(protocol::decode_reading(buf, Utc::now()))))
            }
            Packet::DatalogLength => {
                match protocol::decode_length(buf) {
                    Some(0) => {
                        info!("datalog is empty");
                        self.state = DownloadState::Idle;
                        return Ok(Some(Event::DatalogBatch(Vec::new())));
                    }
                    Some(expected) => {
                        info!("expecting {} bytes from datalog", expected);
                        self.state = DownloadState::AwaitingBulk { expected };
                    }
                    None => warn!("bad datalog length packet: {}", protocol::hex(buf)),
                }
                Ok(None)
            }
            Packet::DatalogBulk => {
                let decoded = protocol::decode_datalog(buf, Utc::now());
                self.state = DownloadState::Idle;
                if decoded.truncated {
                    warn!(
                        "datalog download incomplete, keeping {} sessions decoded before the cut",
                        decoded.sessions.len()
                    );
                } else {
                    info!("datalog downloaded: {} sessions", decoded.sessions.len());
                }
                Ok(Some(Event::DatalogBatch(decoded.sessions)))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::{ETX, SESSION_MARKER, STX};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Scripted link: `Some(b)` delivers a byte, `None` simulates a timed-out
    /// read of about 1 ms. Once the script runs out every read times out.
    #[derive(Clone, Default)]
    pub(crate) struct ScriptedLink {
        pub input: Arc<Mutex<VecDeque<Option<u8>>>>,
        pub written: Arc<Mutex<Vec<u8>>>,
    }

    impl ScriptedLink {
        pub(crate) fn push_packet(&self, bytes: &[u8]) {
            let mut input = self.input.lock().unwrap();
            input.extend(bytes.iter().map(|b| Some(*b)));
            input.push_back(None);
        }

        pub(crate) fn written(&self) -> Vec<u8> {
            self.written.lock().unwrap().clone()
        }
    }

    impl SerialLink for ScriptedLink {
        fn read_byte(&mut self) -> Result<Option<u8>> {
            let next = self.input.lock().unwrap().pop_front();
            match next {
                Some(Some(b)) => Ok(Some(b)),
                _ => {
                    std::thread::sleep(Duration::from_millis(1));
                    Ok(None)
                }
            }
        }

        fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
            self.written.lock().unwrap().extend_from_slice(bytes);
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }

    pub(crate) const LIVE: [u8; 9] = [STX, 0x00, 0x00, 0xfa, 0x00, 0x00, 0xc8, 0x00, ETX];

    fn quick() -> FramingTimeouts {
        FramingTimeouts {
            hang: Duration::from_millis(5),
            abort: Duration::from_millis(50),
        }
    }

    fn reader() -> (Ea15<ScriptedLink>, ScriptedLink) {
        let link = ScriptedLink::default();
        (Ea15::with_timeouts(link.clone(), quick()), link)
    }

    fn one_record_bulk(interval: u8) -> Vec<u8> {
        let mut buf = vec![STX];
        buf.extend_from_slice(&SESSION_MARKER);
        buf.push(interval);
        buf.extend_from_slice(&[0x00, 0x00, 0x64, 0x00, 0x00, 0x64, 0x01]);
        buf.push(ETX);
        buf
    }

    #[test]
    fn live_packet_yields_reading() {
        let (mut ea15, link) = reader();
        link.push_packet(&LIVE);

        match ea15.read_event().unwrap() {
            Event::Reading(r) => {
                assert!(r.valid);
                assert!((r.t1.c() - 25.0).abs() < 1e-9);
                assert!((r.t2.c() - 20.0).abs() < 1e-9);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(link.written().is_empty());
    }

    #[test]
    fn noise_is_skipped() {
        let (mut ea15, link) = reader();
        link.push_packet(&[0x41, 0x42, 0x43]);
        link.push_packet(&[STX, 0x01, ETX]);
        link.push_packet(&LIVE);

        assert!(matches!(ea15.read_event().unwrap(), Event::Reading(_)));
    }

    #[test]
    fn silence_aborts_with_no_result() {
        let (mut ea15, _link) = reader();
        assert!(matches!(ea15.read_event().unwrap(), Event::NoResult));
    }

    #[test]
    fn invalid_reading_is_still_delivered() {
        let (mut ea15, link) = reader();
        let mut bad = LIVE;
        bad[7] = 0x09;
        link.push_packet(&bad);

        match ea15.read_event().unwrap() {
            Event::Reading(r) => assert!(!r.valid),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn full_download_sequence() {
        let (mut ea15, link) = reader();
        ea15.request_download();
        assert_eq!(ea15.state(), DownloadState::Idle);

        link.push_packet(&LIVE);
        assert!(matches!(ea15.read_event().unwrap(), Event::Reading(_)));
        assert_eq!(ea15.state(), DownloadState::Requested);
        assert_eq!(link.written(), vec![REQUEST_LENGTH]);

        // A second request while busy is ignored.
        ea15.request_download();

        link.push_packet(&[STX, 0x00, 0x8c, 0x8c, ETX]);
        link.push_packet(&LIVE);
        assert!(matches!(ea15.read_event().unwrap(), Event::Reading(_)));
        assert_eq!(ea15.state(), DownloadState::AwaitingBulk { expected: 12 });
        assert_eq!(link.written(), vec![REQUEST_LENGTH, REQUEST_CONTINUE]);

        link.push_packet(&one_record_bulk(5));
        match ea15.read_event().unwrap() {
            Event::DatalogBatch(sessions) => {
                assert_eq!(sessions.len(), 1);
                assert_eq!(sessions[0].interval, 5);
                assert_eq!(sessions[0].readings.len(), 1);
                assert_eq!(sessions[0].readings[0].sensor, Some(crate::models::SensorType::J));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(ea15.state(), DownloadState::Idle);

        link.push_packet(&LIVE);
        assert!(matches!(ea15.read_event().unwrap(), Event::Reading(_)));
        assert_eq!(link.written().len(), 2);
    }

    #[test]
    fn empty_datalog_yields_empty_batch() {
        let (mut ea15, link) = reader();
        ea15.request_download();
        link.push_packet(&LIVE);
        ea15.read_event().unwrap();

        link.push_packet(&[STX, 0x00, 0x8c, 0x80, ETX]);
        link.push_packet(&LIVE);
        match ea15.read_event().unwrap() {
            Event::DatalogBatch(sessions) => assert!(sessions.is_empty()),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(ea15.state(), DownloadState::Idle);

        assert!(matches!(ea15.read_event().unwrap(), Event::Reading(_)));
        assert_eq!(link.written(), vec![REQUEST_LENGTH]);
    }

    #[test]
    fn packet_after_hang_still_frames() {
        let link = ScriptedLink::default();
        let mut ea15 = Ea15::with_timeouts(
            link.clone(),
            FramingTimeouts {
                hang: Duration::from_millis(5),
                abort: Duration::from_millis(500),
            },
        );
        // About 20 ms of timed-out reads: past the hang threshold, well short
        // of the abort threshold.
        for _ in 0..20 {
            link.input.lock().unwrap().push_back(None);
        }
        link.push_packet(&LIVE);

        match ea15.read_event().unwrap() {
            Event::Reading(r) => assert!((r.t1.c() - 25.0).abs() < 1e-9),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn bulk_of_wrong_length_is_noise() {
        let (mut ea15, link) = reader();
        ea15.request_download();
        link.push_packet(&LIVE);
        ea15.read_event().unwrap();

        link.push_packet(&[STX, 0x00, 0x8c, 0x93, ETX]);
        link.push_packet(&one_record_bulk(5));
        link.push_packet(&LIVE);
        assert!(matches!(ea15.read_event().unwrap(), Event::Reading(_)));
        assert_eq!(ea15.state(), DownloadState::AwaitingBulk { expected: 19 });
    }
}
