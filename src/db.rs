use chrono::Utc;
use rusqlite::Connection;
use std::io::Write;
use std::path::Path;

use crate::error::Result;
use crate::models::{DatalogSession, TempUnit};

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                downloaded_at TEXT NOT NULL,
                interval_code INTEGER NOT NULL,
                reading_count INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS datalog_readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL REFERENCES sessions(id),
                timestamp TEXT NOT NULL,
                t1_c REAL NOT NULL,
                t2_c REAL NOT NULL,
                t1_unit TEXT,
                t2_unit TEXT,
                sensor TEXT,
                valid INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_datalog_readings_session
            ON datalog_readings(session_id);
            ",
        )?;
        Ok(())
    }

    /// Stores one download in a single transaction. Returns the number of
    /// readings written.
    pub fn insert_batch(&mut self, sessions: &[DatalogSession]) -> Result<usize> {
        let downloaded_at = Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        let mut count = 0;
        {
            let mut insert_session = tx.prepare(
                "INSERT INTO sessions (downloaded_at, interval_code, reading_count)
                 VALUES (?1, ?2, ?3)",
            )?;
            let mut insert_reading = tx.prepare(
                "INSERT INTO datalog_readings (session_id, timestamp, t1_c, t2_c, t1_unit, t2_unit, sensor, valid)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;

            for session in sessions {
                let session_id = insert_session.insert((
                    &downloaded_at,
                    session.interval,
                    session.readings.len() as i64,
                ))?;
                for r in &session.readings {
                    insert_reading.execute((
                        session_id,
                        r.timestamp.to_rfc3339(),
                        r.t1.c(),
                        r.t2.c(),
                        r.t1_unit.map(unit_str),
                        r.t2_unit.map(unit_str),
                        r.sensor.map(|s| s.to_string()),
                        r.valid,
                    ))?;
                    count += 1;
                }
            }
        }
        tx.commit()?;
        Ok(count)
    }

    /// Writes every stored datalog reading as CSV. Returns the row count.
    pub fn export_csv<W: Write>(&self, out: &mut W) -> Result<usize> {
        let mut stmt = self.conn.prepare(
            "SELECT r.session_id, s.interval_code, r.timestamp, r.t1_c, r.t2_c, r.sensor, r.valid
             FROM datalog_readings r JOIN sessions s ON s.id = r.session_id
             ORDER BY r.session_id, r.id",
        )?;

        writeln!(out, "session,interval,timestamp,t1_c,t2_c,sensor,valid")?;
        let mut rows = stmt.query([])?;
        let mut count = 0;
        while let Some(row) = rows.next()? {
            let session: i64 = row.get(0)?;
            let interval: i64 = row.get(1)?;
            let timestamp: String = row.get(2)?;
            let t1: f64 = row.get(3)?;
            let t2: f64 = row.get(4)?;
            let sensor: Option<String> = row.get(5)?;
            let valid: bool = row.get(6)?;
            writeln!(
                out,
                "{},{},{},{:.1},{:.1},{},{}",
                session,
                interval,
                timestamp,
                t1,
                t2,
                sensor.unwrap_or_default(),
                valid
            )?;
            count += 1;
        }
        Ok(count)
    }
}

fn unit_str(unit: TempUnit) -> String {
    unit.as_char().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Reading, SensorType, Temperature};

    fn session(interval: u8, n: usize) -> DatalogSession {
        let readings = (0..n)
            .map(|i| Reading {
                timestamp: Utc::now(),
                t1: Temperature::new(20.0 + i as f64, 'C'),
                t1_unit: Some(TempUnit::C),
                t2: Temperature::new(68.0, 'F'),
                t2_unit: Some(TempUnit::F),
                sensor: Some(SensorType::T),
                valid: true,
            })
            .collect();
        DatalogSession { interval, readings }
    }

    #[test]
    fn stores_and_exports_batches() {
        let mut db = Database::open(":memory:").unwrap();
        let written = db.insert_batch(&[session(2, 3), session(10, 1)]).unwrap();
        assert_eq!(written, 4);

        let mut out = Vec::new();
        let rows = db.export_csv(&mut out).unwrap();
        assert_eq!(rows, 4);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "session,interval,timestamp,t1_c,t2_c,sensor,valid");
        assert!(lines[1].starts_with("1,2,"));
        assert!(lines[1].ends_with(",20.0,20.0,T,true"));
        assert!(lines[4].starts_with("2,10,"));
    }

    #[test]
    fn empty_export_has_header_only() {
        let db = Database::open(":memory:").unwrap();
        let mut out = Vec::new();
        assert_eq!(db.export_csv(&mut out).unwrap(), 0);
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 1);
    }
}
