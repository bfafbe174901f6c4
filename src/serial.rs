use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

pub const BY_ID_DIR: &str = "/dev/serial/by-id/";
pub const DEFAULT_DEVICE_ID: &str = "usb-Prolific_Technology_Inc._USB-Serial_Controller";

const BAUD_RATE: u32 = 9600;
// Must stay below the ~1.5 s gap between packets; the gap is what frames them.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Byte transport the EA15 reader runs on.
pub trait SerialLink {
    /// Reads one byte, or `None` when the read timeout elapsed first.
    fn read_byte(&mut self) -> Result<Option<u8>>;
    fn write_all(&mut self, bytes: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

impl SerialLink for Box<dyn SerialPort> {
    fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.read(&mut byte) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(byte[0])),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        Write::write_all(self, bytes)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Write::flush(self)?;
        Ok(())
    }
}

pub fn open(path: &Path) -> Result<Box<dyn SerialPort>> {
    let port = serialport::new(path.to_string_lossy(), BAUD_RATE)
        .timeout(READ_TIMEOUT)
        .open()?;
    Ok(port)
}

/// Finds the first entry in `dir` whose file name contains `id_filter`.
pub fn find_device(dir: &Path, id_filter: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().contains(id_filter) {
            return Some(entry.path());
        }
    }
    None
}

/// Resolves the device path: an explicit path wins, otherwise the by-id
/// directory is scanned.
pub fn resolve_device(explicit: Option<&Path>, id_filter: &str) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    find_device(Path::new(BY_ID_DIR), id_filter).ok_or_else(|| Error::NoDevice(id_filter.to_string()))
}
