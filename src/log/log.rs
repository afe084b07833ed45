// SPDX-License-Identifier: GPL-2.0-or-later

use common::{CameraId, ILogger, LogEntry, LogLevel, LogMessage, LogSource};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    ops::Deref,
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::sync::broadcast;

/// Logger used everywhere across the application.
pub struct Logger {
    /// Internal logging feed.
    feed: broadcast::Sender<LogEntryWithTime>,

    sources: Vec<LogSource>,

    /// Entries below this severity are not printed.
    print_level: LogLevel,
}

impl Logger {
    /// Creates a new logger.
    #[must_use]
    #[allow(clippy::unwrap_used)]
    pub fn new(sources: Vec<LogSource>, print_level: LogLevel) -> Self {
        let (feed, _) = broadcast::channel(64);

        let mut sources = sources;
        sources.push("app".parse().unwrap());
        sources.push("camera".parse().unwrap());
        sources.push("nvr".parse().unwrap());
        sources.push("fragmenter".parse().unwrap());
        sources.push("filedb".parse().unwrap());
        sources.push("tiers".parse().unwrap());
        sources.sort();

        Self {
            feed,
            sources,
            print_level,
        }
    }

    /// Subscribes to the log feed and returns a channel that receives all log entries.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntryWithTime> {
        self.feed.subscribe()
    }

    #[must_use]
    pub fn sources(&self) -> &Vec<LogSource> {
        &self.sources
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(Vec::new(), LogLevel::Info)
    }
}

impl ILogger for Logger {
    /// Sends log entry to all subscribers. The timestamp is applied now.
    fn log(&self, log: LogEntry) {
        let log = LogEntryWithTime {
            level: log.level,
            source: log.source,
            camera_id: log.camera_id,
            message: log.message,
            time: UnixMicro::now(),
        };

        if log.level.as_u8() <= self.print_level.as_u8() {
            println!("{log}");
        }

        // Only returns an error if there are no subscribers.
        self.feed.send(log).ok();
    }
}

/// Microseconds since the `UNIX_EPOCH`.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnixMicro(u64);

impl UnixMicro {
    /// Current time as `UnixMicro`.
    fn now() -> Self {
        UnixMicro(
            u64::try_from(
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .expect("broken system clock")
                    .as_micros(),
            )
            .expect("really broken system clock"),
        )
    }

    #[must_use]
    pub fn checked_add(&self, rhs: Self) -> Option<Self> {
        Some(Self(self.0.checked_add(rhs.0)?))
    }
}

impl From<u64> for UnixMicro {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl Deref for UnixMicro {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Log entry with time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LogEntryWithTime {
    /// Severity.
    pub level: LogLevel,

    /// Source.
    pub source: LogSource,

    /// Optional camera ID if the message can be tied to a camera.
    #[serde(rename = "cameraID", skip_serializing_if = "Option::is_none")]
    pub camera_id: Option<CameraId>,

    /// Message.
    pub message: LogMessage,

    // Timestamp.
    pub time: UnixMicro,
}

impl fmt::Display for LogEntryWithTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.level {
            LogLevel::Error => write!(f, "[ERROR] ")?,
            LogLevel::Warning => write!(f, "[WARNING] ")?,
            LogLevel::Info => write!(f, "[INFO] ")?,
            LogLevel::Debug => write!(f, "[DEBUG] ")?,
        };

        if let Some(camera_id) = &self.camera_id {
            write!(f, "{camera_id}: ")?;
        };

        let mut src_title = self.source.to_string();
        make_ascii_titlecase(&mut src_title);

        write!(f, "{}: {}", src_title, self.message)?;

        Ok(())
    }
}

/// Make the first character in a string uppercase.
fn make_ascii_titlecase(s: &mut str) {
    if let Some(r) = s.get_mut(0..1) {
        r.make_ascii_uppercase();
    }
}

#[allow(clippy::needless_pass_by_value, clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use common::{ParseLogMessageError, ParseLogSourceError};
    use pretty_assertions::assert_eq;
    use std::str::FromStr;
    use test_case::test_case;

    #[tokio::test]
    async fn logger_messages() {
        let logger = Logger::new(Vec::new(), LogLevel::Error);
        let mut feed = logger.subscribe();

        logger.log(LogEntry {
            level: LogLevel::Info,
            source: "s1".parse().unwrap(),
            camera_id: Some("m1".parse().unwrap()),
            message: "1".parse().unwrap(),
        });
        logger.log(LogEntry {
            level: LogLevel::Warning,
            source: "s2".parse().unwrap(),
            camera_id: None,
            message: "2".parse().unwrap(),
        });

        let mut actual = vec![feed.recv().await.unwrap(), feed.recv().await.unwrap()];
        actual.iter_mut().for_each(|v| v.time = UnixMicro(0));

        let expected = vec![
            LogEntryWithTime {
                level: LogLevel::Info,
                source: "s1".parse().unwrap(),
                camera_id: Some("m1".parse().unwrap()),
                message: "1".parse().unwrap(),
                time: UnixMicro(0),
            },
            LogEntryWithTime {
                level: LogLevel::Warning,
                source: "s2".parse().unwrap(),
                camera_id: None,
                message: "2".parse().unwrap(),
                time: UnixMicro(0),
            },
        ];

        assert_eq!(actual, expected);
    }

    #[test]
    fn test_display() {
        let entry = LogEntryWithTime {
            level: LogLevel::Info,
            source: "camera".parse().unwrap(),
            camera_id: Some("cam1".parse().unwrap()),
            message: "connected".parse().unwrap(),
            time: UnixMicro(0),
        };
        assert_eq!("[INFO] cam1: Camera: connected", entry.to_string());
    }

    #[test_case("", ParseLogSourceError::Empty; "empty")]
    #[test_case("@", ParseLogSourceError::InvalidChars("@".to_owned()); "invalid_chars")]
    fn source_parse(input: &str, want: ParseLogSourceError) {
        assert_eq!(want, LogSource::from_str(input).expect_err("expected error"));
    }

    #[test_case("", ParseLogMessageError::Empty; "empty")]
    fn message_parse(input: &str, want: ParseLogMessageError) {
        assert_eq!(
            want,
            LogMessage::from_str(input).expect_err("expected error")
        );
    }
}
