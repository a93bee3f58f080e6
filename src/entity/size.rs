use crate::Error;
use crate::Result;

const MB: u64 = 1_000_000;

/// Parses a human readable size in decimal units ("10MB", "1.5 GB", "512k")
/// into bytes. A bare number is a byte count.
pub fn parse_human_size(input: &str) -> Result<u64> {
    let s = input.trim();
    let invalid = || Error::InvalidVolume(format!("invalid size: {input:?}"));

    let split = s.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    if number.is_empty() || number.starts_with('.') || number.ends_with('.') {
        return Err(invalid());
    }

    let value: f64 = number.parse().map_err(|_| invalid())?;

    let mut unit = unit.strip_prefix(' ').unwrap_or(unit).chars().peekable();
    let multiplier = match unit.peek().map(|c| c.to_ascii_lowercase()) {
        Some('k') => 1e3,
        Some('m') => 1e6,
        Some('g') => 1e9,
        Some('t') => 1e12,
        Some('p') => 1e15,
        _ => 1.0,
    };
    if multiplier > 1.0 {
        unit.next();
    }
    if matches!(unit.peek(), Some('i' | 'I')) {
        unit.next();
    }
    if matches!(unit.peek(), Some('b' | 'B')) {
        unit.next();
    }
    if unit.next().is_some() {
        return Err(invalid());
    }

    Ok((value * multiplier) as u64)
}

/// Size in whole megabytes; an empty string means zero.
pub fn size_in_megabytes(size: &str) -> Result<u64> {
    if size.trim().is_empty() {
        return Ok(0);
    }
    Ok(parse_human_size(size)? / MB)
}
