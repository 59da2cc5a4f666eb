//! G-code line handling for job streaming.
//!
//! Only what the job runner needs: dropping comments and blank lines,
//! terminating lines for the firmware, spotting the blocking heat-up
//! commands (`M109` hotend, `M190` bed) and reading `M105` temperature reports.

use thiserror::Error;

/// Terminator the firmware expects after every command.
pub const LINE_TERMINATOR: &str = "\n";

/// Temperature report request.
pub const STATUS_QUERY: &str = "M105";

#[derive(Debug, Error, PartialEq)]
pub enum GCodeError {
    #[error("malformed temperature reading {0:?}")]
    MalformedReading(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensor {
    Hotend,
    Bed,
}

impl Sensor {
    /// Prefix of this sensor's reading in an `M105` report.
    pub fn prefix(self) -> &'static str {
        match self {
            Sensor::Hotend => "T:",
            Sensor::Bed => "B:",
        }
    }
}

impl std::fmt::Display for Sensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sensor::Hotend => write!(f, "hotend"),
            Sensor::Bed => write!(f, "bed"),
        }
    }
}

/// A pending heat-up wait.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaitTarget {
    pub sensor: Sensor,
    /// `None` when the command carried no usable `S`/`R` value; any reading
    /// then satisfies the wait.
    pub target: Option<f64>,
}

impl WaitTarget {
    pub fn reached(&self, reading: f64) -> bool {
        self.target.is_none_or(|t| reading >= t)
    }
}

/// Strips comments and whitespace, returning the terminated command or
/// `None` if nothing is left to send.
pub fn normalize(line: &str) -> Option<String> {
    let code = match line.find(';') {
        Some(idx) => &line[..idx],
        None => line,
    };
    let code = code.trim();
    if code.is_empty() {
        return None;
    }
    let mut cmd = String::with_capacity(code.len() + LINE_TERMINATOR.len());
    cmd.push_str(code);
    cmd.push_str(LINE_TERMINATOR);
    Some(cmd)
}

/// The status query, terminated.
pub fn status_query() -> String {
    format!("{STATUS_QUERY}{LINE_TERMINATOR}")
}

/// Returns the wait implied by `line` if it is an `M109` or `M190`.
pub fn temperature_wait(line: &str) -> Option<WaitTarget> {
    let mut words = line.split_whitespace();
    let sensor = match words.next()? {
        w if w.eq_ignore_ascii_case("M109") => Sensor::Hotend,
        w if w.eq_ignore_ascii_case("M190") => Sensor::Bed,
        _ => return None,
    };
    let target = words
        .filter(|w| w.starts_with(['S', 's', 'R', 'r']))
        .find_map(|w| w[1..].parse::<f64>().ok());
    Some(WaitTarget { sensor, target })
}

/// Reads `sensor`'s current temperature from an `M105` style report.
///
/// Accepts `T:200.0 /210.0` and `T:200.0/210.0`. `Ok(None)` means the report
/// has no reading for the sensor.
pub fn read_temperature(report: &str, sensor: Sensor) -> Result<Option<f64>, GCodeError> {
    let prefix = sensor.prefix();
    for token in report.split_whitespace() {
        let Some(value) = token.strip_prefix(prefix) else {
            continue;
        };
        let current = value.split('/').next().unwrap_or(value);
        return current
            .parse::<f64>()
            .map(Some)
            .map_err(|_| GCodeError::MalformedReading(token.to_string()));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_and_blank_lines_are_dropped() {
        assert_eq!(normalize("; layer 1"), None);
        assert_eq!(normalize("   "), None);
        assert_eq!(normalize("\r"), None);
        assert_eq!(normalize(""), None);
    }

    #[test]
    fn commands_are_trimmed_and_terminated() {
        assert_eq!(normalize("G1 X10\r").as_deref(), Some("G1 X10\n"));
        assert_eq!(normalize("G28 ; home").as_deref(), Some("G28\n"));
    }

    #[test]
    fn heat_and_wait_commands_select_the_sensor() {
        assert_eq!(
            temperature_wait("M109 S200"),
            Some(WaitTarget { sensor: Sensor::Hotend, target: Some(200.0) })
        );
        assert_eq!(
            temperature_wait("M190 S60 ; bed"),
            Some(WaitTarget { sensor: Sensor::Bed, target: Some(60.0) })
        );
        assert_eq!(
            temperature_wait("M109 T0 R215.5"),
            Some(WaitTarget { sensor: Sensor::Hotend, target: Some(215.5) })
        );
        assert_eq!(temperature_wait("M104 S200"), None);
        assert_eq!(temperature_wait("M1090 S1"), None);
    }

    #[test]
    fn wait_without_value_accepts_any_reading() {
        let wait = temperature_wait("M190").unwrap();
        assert_eq!(wait.target, None);
        assert!(wait.reached(21.0));
    }

    #[test]
    fn reads_marlin_reports() {
        let report = "ok T:187.3 /200.0 B:60.1 /60.0 @:127 B@:0";
        assert_eq!(read_temperature(report, Sensor::Hotend), Ok(Some(187.3)));
        assert_eq!(read_temperature(report, Sensor::Bed), Ok(Some(60.1)));
        assert_eq!(read_temperature("T:200/200", Sensor::Hotend), Ok(Some(200.0)));
        assert_eq!(read_temperature("ok", Sensor::Hotend), Ok(None));
        assert!(read_temperature("T:hot", Sensor::Hotend).is_err());
    }
}
