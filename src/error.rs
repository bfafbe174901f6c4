use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// No serial device matched the discovery filter
    #[error("no device found matching '{0}'")]
    NoDevice(String),

    /// The power supply identified itself as something else
    #[error("unknown instrument: {0}")]
    UnknownInstrument(String),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    /// A measurement reply from the supply could not be parsed
    #[error("bad measurement reply: {0}")]
    Measurement(String),

    /// The background serial reader exited, usually after a link failure
    #[error("EA15 reader stopped")]
    ReaderStopped,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
