/// Parse a hex number with or without a `0x` prefix. The trace tooling
/// prints some offset fields without the prefix even though they are hex.
pub(crate) fn parse_hex(s: &str) -> Option<u64> {
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u64::from_str_radix(s, 16).ok()
}
