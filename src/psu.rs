//! Rigol DP832 programmable supply driven over SCPI.
//!
//! Channels 1 and 2 sink the TEC current in parallel. Channel 3 drives the
//! relay that reverses current direction through the TEC.

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::pid::Drive;

pub const EXPECTED_IDN_PREFIX: &str = "RIGOL TECHNOLOGIES,DP832";

/// Textual request/response command channel to an instrument.
#[async_trait]
pub trait PowerSupply: Send {
    async fn write(&mut self, command: &str) -> Result<()>;
    async fn ask(&mut self, query: &str) -> Result<String>;
}

/// SCPI over a raw TCP socket, one newline-terminated line per message.
pub struct ScpiSocket {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ScpiSocket {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer,
        })
    }
}

#[async_trait]
impl PowerSupply for ScpiSocket {
    async fn write(&mut self, command: &str) -> Result<()> {
        debug!("scpi > {}", command);
        self.writer.write_all(command.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn ask(&mut self, query: &str) -> Result<String> {
        self.write(query).await?;
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        let reply = line.trim_end().to_string();
        debug!("scpi < {}", reply);
        Ok(reply)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ChannelMeasurement {
    pub volts: f64,
    pub amps: f64,
    pub watts: f64,
}

impl ChannelMeasurement {
    /// Parses a `:MEAS:ALL?` reply of the form `volts,amps,watts`.
    pub fn parse(reply: &str) -> Result<Self> {
        let fields = reply
            .split(',')
            .map(|f| f.trim().parse::<f64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| Error::Measurement(reply.to_string()))?;

        match fields.as_slice() {
            &[volts, amps, watts] => Ok(Self { volts, amps, watts }),
            _ => Err(Error::Measurement(reply.to_string())),
        }
    }
}

pub struct Dp832<P: PowerSupply> {
    link: P,
}

impl<P: PowerSupply> Dp832<P> {
    /// Checks the instrument identity before handing out a driver.
    pub async fn connect(mut link: P) -> Result<Self> {
        let idn = link.ask("*IDN?").await?;
        info!("instrument: {}", idn);
        if !idn.starts_with(EXPECTED_IDN_PREFIX) {
            return Err(Error::UnknownInstrument(idn));
        }
        Ok(Self { link })
    }

    pub async fn setup(&mut self) -> Result<()> {
        self.link.write("*RST").await?;
        self.link.write("*CLS").await?;

        self.link.write(":APPL CH1,12,1").await?;
        self.link.write(":APPL CH2,12,1").await?;
        self.link.write(":APPL CH3,5,1").await?;

        for ch in 1..=3 {
            let volts = self.link.ask(&format!(":SOUR{}:VOLT?", ch)).await?;
            let amps = self.link.ask(&format!(":SOUR{}:CURR?", ch)).await?;
            info!("CH{} set to {} V, {} A", ch, volts, amps);
        }

        self.set_output(1, true).await?;
        self.set_output(2, true).await?;
        self.set_output(3, false).await?;
        Ok(())
    }

    pub async fn set_current(&mut self, channel: u8, amps: f64) -> Result<()> {
        self.link.write(&format!(":SOUR{}:CURR {}", channel, amps)).await
    }

    pub async fn set_output(&mut self, channel: u8, on: bool) -> Result<()> {
        let state = if on { "ON" } else { "OFF" };
        self.link.write(&format!(":OUTP CH{},{}", channel, state)).await
    }

    pub async fn apply(&mut self, drive: Drive) -> Result<()> {
        self.set_current(1, drive.channel_current).await?;
        self.set_current(2, drive.channel_current).await?;
        self.set_output(3, drive.reverse).await
    }

    pub async fn measure(&mut self, channel: u8) -> Result<ChannelMeasurement> {
        let reply = self.link.ask(&format!(":MEAS:ALL? CH{}", channel)).await?;
        ChannelMeasurement::parse(&reply)
    }

    /// Leaves the supply in a safe state: low current, all outputs off.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.set_current(1, 0.5).await?;
        self.set_current(2, 0.5).await?;
        for ch in 1..=3 {
            self.set_output(ch, false).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// Records every command and answers queries from a fixed table.
    #[derive(Clone, Default)]
    pub(crate) struct FakeSupply {
        pub sent: Arc<Mutex<Vec<String>>>,
        pub replies: Arc<Mutex<HashMap<String, String>>>,
    }

    impl FakeSupply {
        pub(crate) fn dp832() -> Self {
            let fake = Self::default();
            fake.reply("*IDN?", "RIGOL TECHNOLOGIES,DP832,DP8C000000,00.01.14");
            for ch in 1..=3 {
                fake.reply(&format!(":MEAS:ALL? CH{}", ch), "12.000,0.500,6.000");
            }
            fake
        }

        pub(crate) fn reply(&self, query: &str, answer: &str) {
            self.replies
                .lock()
                .unwrap()
                .insert(query.to_string(), answer.to_string());
        }

        pub(crate) fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PowerSupply for FakeSupply {
        async fn write(&mut self, command: &str) -> Result<()> {
            self.sent.lock().unwrap().push(command.to_string());
            Ok(())
        }

        async fn ask(&mut self, query: &str) -> Result<String> {
            self.sent.lock().unwrap().push(query.to_string());
            Ok(self
                .replies
                .lock()
                .unwrap()
                .get(query)
                .cloned()
                .unwrap_or_else(|| "0".to_string()))
        }
    }

    #[test]
    fn parses_measurement() {
        let m = ChannelMeasurement::parse("12.001,1.250,15.001\n").unwrap();
        assert_eq!(m.volts, 12.001);
        assert_eq!(m.amps, 1.25);
        assert_eq!(m.watts, 15.001);
        assert!(ChannelMeasurement::parse("12.0,1.0").is_err());
        assert!(ChannelMeasurement::parse("a,b,c").is_err());
    }

    #[tokio::test]
    async fn rejects_unknown_instrument() {
        let fake = FakeSupply::default();
        fake.reply("*IDN?", "KEITHLEY INSTRUMENTS,2230");
        assert!(matches!(
            Dp832::connect(fake).await,
            Err(Error::UnknownInstrument(_))
        ));
    }

    #[tokio::test]
    async fn drive_maps_to_commands() {
        let fake = FakeSupply::dp832();
        let mut psu = Dp832::connect(fake.clone()).await.unwrap();

        psu.apply(Drive::from_output(-3.0)).await.unwrap();
        psu.apply(Drive::from_output(1.0)).await.unwrap();

        let sent = fake.sent();
        assert_eq!(
            &sent[1..],
            &[
                ":SOUR1:CURR 1.5",
                ":SOUR2:CURR 1.5",
                ":OUTP CH3,ON",
                ":SOUR1:CURR 0.5",
                ":SOUR2:CURR 0.5",
                ":OUTP CH3,OFF",
            ]
        );
    }

    #[tokio::test]
    async fn setup_and_shutdown_sequence() {
        let fake = FakeSupply::dp832();
        let mut psu = Dp832::connect(fake.clone()).await.unwrap();
        psu.setup().await.unwrap();
        psu.shutdown().await.unwrap();

        let sent = fake.sent();
        assert_eq!(sent[1], "*RST");
        assert!(sent.contains(&":APPL CH3,5,1".to_string()));
        assert!(sent.contains(&":OUTP CH1,ON".to_string()));
        assert_eq!(sent.last().unwrap(), ":OUTP CH3,OFF");
    }
}
