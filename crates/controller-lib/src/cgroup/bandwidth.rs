//! Parsing and formatting for `io.max` bandwidth values.
//!
//! Values are either the literal `"max"` or a decimal integer with an
//! optional SI suffix (`K`, `M`, `G`), per the cgroup v2 `io.max` format.

/// Parse a bandwidth value into bytes/sec. `"max"` parses to `None`
/// (meaning unlimited); anything else must be a decimal integer with an
/// optional `K`/`M`/`G` suffix (powers of 1024).
pub fn parse_bandwidth_value(raw: &str) -> Result<Option<u64>, String> {
    let raw = raw.trim();
    if raw == "max" {
        return Ok(None);
    }

    let (digits, multiplier) = match raw.as_bytes().last() {
        Some(b'K') | Some(b'k') => (&raw[..raw.len() - 1], 1024u64),
        Some(b'M') | Some(b'm') => (&raw[..raw.len() - 1], 1024 * 1024),
        Some(b'G') | Some(b'g') => (&raw[..raw.len() - 1], 1024 * 1024 * 1024),
        _ => (raw, 1u64),
    };

    digits
        .parse::<u64>()
        .map(|n| Some(n * multiplier))
        .map_err(|_| format!("invalid bandwidth value: {raw}"))
}

/// Render a byte count back into the `K`/`M`/`G`-suffixed form the kernel
/// accepts, choosing the largest suffix that divides evenly, falling back
/// to a bare decimal integer. `None` renders as `"max"`.
pub fn format_bandwidth_value(value: Option<u64>) -> String {
    let Some(bytes) = value else {
        return "max".to_string();
    };

    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;
    const KIB: u64 = 1024;

    if bytes != 0 && bytes % GIB == 0 {
        format!("{}G", bytes / GIB)
    } else if bytes != 0 && bytes % MIB == 0 {
        format!("{}M", bytes / MIB)
    } else if bytes != 0 && bytes % KIB == 0 {
        format!("{}K", bytes / KIB)
    } else {
        bytes.to_string()
    }
}
