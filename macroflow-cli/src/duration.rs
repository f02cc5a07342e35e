use anyhow::{anyhow, Result};
use std::time::Duration;

/// Parses "500", "500ms", "1.5s", "2m" or "1h". A bare number is milliseconds.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();

    if let Ok(ms) = input.parse::<u64>() {
        return Ok(Duration::from_millis(ms));
    }

    let (number_part, unit_part) = split_number_and_unit(input)?;
    let value: f64 = number_part
        .parse()
        .map_err(|_| anyhow!("Invalid number in duration: {}", number_part))?;
    if !value.is_finite() || value < 0.0 {
        return Err(anyhow!("Duration must be a non-negative number: {}", input));
    }

    let multiplier = match unit_part {
        "ms" | "millis" | "milliseconds" => 1.0,
        "s" | "sec" | "secs" | "second" | "seconds" => 1000.0,
        "m" | "min" | "mins" | "minute" | "minutes" => 60_000.0,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600_000.0,
        "" => 1.0,
        _ => return Err(anyhow!("Unknown time unit: {}", unit_part)),
    };

    Ok(Duration::from_millis((value * multiplier).round() as u64))
}

/// `value_parser` adapter returning whole milliseconds.
pub fn parse_millis(input: &str) -> Result<u64, String> {
    parse_duration(input)
        .map(|d| d.as_millis() as u64)
        .map_err(|e| e.to_string())
}

fn split_number_and_unit(input: &str) -> Result<(&str, &str)> {
    let split_pos = input.find(|c: char| c.is_alphabetic()).unwrap_or(input.len());
    let number_part = input[..split_pos].trim();
    let unit_part = input[split_pos..].trim();

    if number_part.is_empty() {
        return Err(anyhow!("No numeric value in duration: {}", input));
    }

    Ok((number_part, unit_part))
}
