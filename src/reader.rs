//! Background thread that owns the serial link.
//!
//! Readings and datalog batches flow out on two unbounded channels and
//! download requests flow in on a third. Nothing else is shared with the
//! foreground task.

use std::thread;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};
use tracing::{debug, error};

use crate::ea15::{Ea15, Event};
use crate::error::{Error, Result};
use crate::models::{DatalogSession, Reading};
use crate::serial::SerialLink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderRequest {
    DownloadDatalog,
}

pub struct ReaderHandle {
    pub readings: UnboundedReceiver<Reading>,
    pub batches: UnboundedReceiver<Vec<DatalogSession>>,
    requests: UnboundedSender<ReaderRequest>,
}

impl ReaderHandle {
    pub fn request_datalog(&self) {
        if self.requests.send(ReaderRequest::DownloadDatalog).is_err() {
            error!("reader thread has stopped, datalog request dropped");
        }
    }

    /// Drains the reading queue and keeps only the newest entry.
    ///
    /// Fails once the reader thread has exited and every queued reading has
    /// been taken.
    pub fn latest_reading(&mut self) -> Result<Option<Reading>> {
        let mut latest = None;
        loop {
            match self.readings.try_recv() {
                Ok(reading) => latest = Some(reading),
                Err(TryRecvError::Empty) => return Ok(latest),
                Err(TryRecvError::Disconnected) => {
                    return latest.map(Some).ok_or(Error::ReaderStopped);
                }
            }
        }
    }
}

pub fn spawn<L>(mut ea15: Ea15<L>) -> ReaderHandle
where
    L: SerialLink + Send + 'static,
{
    let (reading_tx, readings) = mpsc::unbounded_channel();
    let (batch_tx, batches) = mpsc::unbounded_channel();
    let (requests, mut request_rx) = mpsc::unbounded_channel();

    thread::spawn(move || {
        loop {
            loop {
                match request_rx.try_recv() {
                    Ok(ReaderRequest::DownloadDatalog) => ea15.request_download(),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        debug!("reader handle dropped, stopping");
                        return;
                    }
                }
            }

            let sent = match ea15.read_event() {
                Ok(Event::Reading(reading)) => reading_tx.send(reading).is_ok(),
                Ok(Event::DatalogBatch(sessions)) => batch_tx.send(sessions).is_ok(),
                Ok(Event::NoResult) => {
                    debug!("no packet this cycle, download state {:?}", ea15.state());
                    true
                }
                Err(e) => {
                    error!("serial read failed: {}", e);
                    return;
                }
            };
            if !sent {
                debug!("consumer gone, stopping reader");
                return;
            }
        }
    });

    ReaderHandle {
        readings,
        batches,
        requests,
    }
}
