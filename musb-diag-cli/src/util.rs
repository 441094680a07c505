/// Parse an address such as `0x1120_0000` or `11200000`.
///
/// The `0x` prefix is optional and `_` separators are ignored, so addresses can
/// be copied straight from a device tree or a datasheet.
pub(crate) fn u64_from_hex(value: &str) -> Result<u64, String> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
        .replace('_', "");
    u64::from_str_radix(&digits, 16).map_err(|e| format!("{value:?} is not a hex address: {e}"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prefix_and_separators_are_optional() {
        assert_eq!(u64_from_hex("0x11200000"), Ok(0x1120_0000));
        assert_eq!(u64_from_hex("0x1120_0000"), Ok(0x1120_0000));
        assert_eq!(u64_from_hex("0X400"), Ok(0x400));
        assert_eq!(u64_from_hex("ff"), Ok(0xff));
    }

    #[test]
    fn bad_or_oversized_addresses_are_rejected() {
        assert!(u64_from_hex("0xzz").is_err());
        assert!(u64_from_hex("").is_err());
        assert!(u64_from_hex("0x1_0000_0000_0000_0000").is_err());
    }
}
