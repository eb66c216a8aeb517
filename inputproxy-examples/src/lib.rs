// SPDX-License-Identifier: MIT

//! Shared helpers for the example consumers: parsing the identity
//! triples and key specs that `inputproxyd --detect` hands out.

use anyhow::{bail, Context, Result};
use input_ioctls::keys;

fn parse_hex_field(field: &str) -> Result<u32> {
    let digits = field.strip_prefix("0x").unwrap_or(field);
    u32::from_str_radix(digits, 16).with_context(|| format!("bad hex value '{field}'"))
}

/// Parses the `vendor:product:uid` triple printed by detection mode.
pub fn parse_device(spec: &str) -> Result<(u16, u16, u32)> {
    let parts: Vec<&str> = spec.split(':').collect();
    if parts.len() != 3 {
        bail!("device spec '{spec}' is not vendor:product:uid");
    }
    let vendor = parse_hex_field(parts[0])?;
    let product = parse_hex_field(parts[1])?;
    if vendor > u16::MAX.into() || product > u16::MAX.into() {
        bail!("vendor/product in '{spec}' exceed 16 bits");
    }
    Ok((vendor as u16, product as u16, parse_hex_field(parts[2])?))
}

/// Parses a key given as a decimal evdev code or a symbolic name like
/// `BTN_EXTRA`.
pub fn parse_key(spec: &str) -> Result<i32> {
    if let Ok(code) = spec.parse::<i32>() {
        return Ok(code);
    }
    keys::key_code(spec)
        .map(i32::from)
        .with_context(|| format!("unknown key '{spec}' (see --list-keys)"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_spec_parsing() {
        assert_eq!(
            parse_device("0x046d:0xc077:0xdeadbeef").unwrap(),
            (0x046d, 0xc077, 0xdead_beef)
        );
        assert_eq!(parse_device("46d:c077:deadbeef").unwrap().0, 0x046d);
        assert!(parse_device("0x046d:0xc077").is_err());
        assert!(parse_device("0x12345:0x1:0x1").is_err());
        assert!(parse_device("zz:1:2").is_err());
    }

    #[test]
    fn key_spec_parsing() {
        assert_eq!(parse_key("276").unwrap(), 276);
        assert_eq!(parse_key("BTN_EXTRA").unwrap(), 276);
        assert_eq!(parse_key("key_f13").unwrap(), 183);
        assert!(parse_key("KEY_NOPE").is_err());
    }
}
