//! Load address recovery for Intel HEX firmware images
//!
//! Only the first one or two records are looked at. A file has to start with
//! either an extended address record followed by a data record, or with a
//! 16 byte data record. Anything else is rejected instead of guessed.

use std::{fs, path::Path};

use crate::Error;

const DATA: u8 = 0x00;
const EXTENDED_SEGMENT_ADDRESS: u8 = 0x02;
const EXTENDED_LINEAR_ADDRESS: u8 = 0x04;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Record {
    kind: u8,
    offset: u16,
    data: Vec<u8>,
}

/// Recover the absolute load address of the Intel HEX file at `path`
pub fn start_address(path: &Path) -> Result<u32, Error> {
    let text = fs::read_to_string(path).map_err(|_| Error::FileNotFound(path.to_owned()))?;

    parse_start_address(&text).map_err(|reason| Error::InvalidHex {
        path: path.to_owned(),
        reason,
    })
}

fn parse_start_address(text: &str) -> Result<u32, String> {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

    let first = lines
        .next()
        .ok_or_else(|| "file is empty".to_string())
        .and_then(parse_record)?;

    let base = match (first.kind, first.data.as_slice()) {
        (EXTENDED_SEGMENT_ADDRESS, &[hi, lo]) => u32::from(u16::from_be_bytes([hi, lo])) << 4,
        (EXTENDED_LINEAR_ADDRESS, &[hi, lo]) => u32::from(u16::from_be_bytes([hi, lo])) << 16,
        (DATA, data) if data.len() == 16 => return Ok(u32::from(first.offset)),
        (kind, data) => {
            return Err(format!(
                "unexpected first record (type {kind:#04x}, {} bytes)",
                data.len()
            ))
        }
    };

    let data = lines
        .next()
        .ok_or_else(|| "missing data record after address record".to_string())
        .and_then(parse_record)?;

    if data.kind != DATA {
        return Err(format!(
            "expected a data record after the address record, found type {:#04x}",
            data.kind
        ));
    }

    Ok(base + u32::from(data.offset))
}

fn parse_record(line: &str) -> Result<Record, String> {
    let hex = line
        .strip_prefix(':')
        .ok_or_else(|| format!("record doesn't start with ':': {line}"))?;

    if !hex.is_ascii() || hex.len() % 2 != 0 || hex.len() < 10 {
        return Err(format!("record has an invalid length: {line}"));
    }

    let bytes = (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| format!("record contains non-hex characters: {line}"))?;

    let length = bytes[0] as usize;
    if bytes.len() != length + 5 {
        return Err(format!(
            "record declares {length} data bytes but carries {}",
            bytes.len() - 5
        ));
    }

    let checksum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if checksum != 0 {
        return Err(format!("record checksum mismatch: {line}"));
    }

    Ok(Record {
        kind: bytes[3],
        offset: u16::from_be_bytes([bytes[1], bytes[2]]),
        data: bytes[4..4 + length].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_linear_address() {
        let text = ":020000040800F2\n\
                    :10000000C0FF0120990100089D0100089F01000820\n";
        assert_eq!(parse_start_address(text).unwrap(), 0x0800_0000);
    }

    #[test]
    fn extended_segment_address() {
        let text = ":020000021000EC\n\
                    :10400000C0FF0120990100089D0100089F010008E0\n";
        assert_eq!(parse_start_address(text).unwrap(), 0x0001_4000);
    }

    #[test]
    fn plain_data_record() {
        let text = ":10C00000C0FF0120990100089D0100089F01000860\n";
        assert_eq!(parse_start_address(text).unwrap(), 0xC000);
    }

    #[test]
    fn rejects_unknown_first_record() {
        // start linear address record
        let text = ":040000050800019955\n";
        assert!(parse_start_address(text).is_err());

        // data record that is not 16 bytes long
        let text = ":0400000001020304F2\n";
        assert!(parse_start_address(text).is_err());

        assert!(parse_start_address("").is_err());
        assert!(parse_start_address("not a hex file").is_err());
    }

    #[test]
    fn rejects_bad_checksum() {
        let text = ":020000040800F3\n\
                    :10000000C0FF0120990100089D0100089F01000820\n";
        assert!(parse_start_address(text).is_err());
    }
}
