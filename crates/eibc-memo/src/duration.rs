//! Go-style duration strings (`"300s"`, `"1h30m"`, `"1.5h"`).

use std::time::Duration;

const UNITS: [(&str, f64); 7] = [
	("ns", 1.0),
	("us", 1e3),
	("µs", 1e3),
	("ms", 1e6),
	("s", 1e9),
	("m", 60e9),
	("h", 3600e9),
];

/// Parses a non-negative Go duration. `"0"` is accepted without a unit.
pub fn parse_go_duration(input: &str) -> Result<Duration, String> {
	let s = input.strip_prefix('+').unwrap_or(input);
	if s == "0" {
		return Ok(Duration::ZERO);
	}
	if s.is_empty() || s.starts_with('-') {
		return Err(format!("invalid duration {:?}", input));
	}

	let mut rest = s;
	let mut total_nanos = 0f64;

	while !rest.is_empty() {
		let number_len = rest
			.find(|c: char| !(c.is_ascii_digit() || c == '.'))
			.unwrap_or(rest.len());
		if number_len == 0 {
			return Err(format!("invalid duration {:?}", input));
		}
		let value: f64 = rest[..number_len]
			.parse()
			.map_err(|_| format!("invalid duration {:?}", input))?;
		rest = &rest[number_len..];

		let unit_len = rest
			.find(|c: char| c.is_ascii_digit() || c == '.')
			.unwrap_or(rest.len());
		let unit = &rest[..unit_len];
		let (_, scale) = UNITS
			.iter()
			.find(|(name, _)| *name == unit)
			.ok_or_else(|| format!("unknown unit {:?} in duration {:?}", unit, input))?;
		rest = &rest[unit_len..];

		total_nanos += value * scale;
	}

	if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
		return Err(format!("duration {:?} overflows", input));
	}
	Ok(Duration::from_nanos(total_nanos.round() as u64))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_go_durations() {
		assert_eq!(parse_go_duration("5m").unwrap(), Duration::from_secs(300));
		assert_eq!(parse_go_duration("300s").unwrap(), Duration::from_secs(300));
		assert_eq!(parse_go_duration("1h30m").unwrap(), Duration::from_secs(5400));
		assert_eq!(parse_go_duration("1.5h").unwrap(), Duration::from_secs(5400));
		assert_eq!(parse_go_duration("250ms").unwrap(), Duration::from_millis(250));
		assert_eq!(parse_go_duration("0").unwrap(), Duration::ZERO);
	}

	#[test]
	fn test_reject_bad_durations() {
		for bad in ["", "5", "-5m", "5x", "m", "1h-3m"] {
			assert!(parse_go_duration(bad).is_err(), "{} should fail", bad);
		}
	}
}
