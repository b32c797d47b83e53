use rand::RngCore;

use crate::error::ManagerError;

/// Parse a human-readable size string into bytes.
///
/// Accepts `"64G"`, `"512M"`, `"4GiB"`, `"100kb"`, `"1073741824"`.
/// Suffixes are binary units (1G = 1024³); an optional trailing `B` or
/// `iB` is ignored.
pub fn parse_size(s: &str) -> Result<u64, ManagerError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ManagerError::ConfigurationError(
            "size cannot be empty".into(),
        ));
    }

    let (num_str, suffix) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(i) => (&s[..i], s[i..].to_ascii_uppercase()),
        None => (s, String::new()),
    };

    let num: u64 = num_str.parse().map_err(|_| {
        ManagerError::ConfigurationError(format!("invalid size number: '{num_str}'"))
    })?;

    let unit = suffix
        .strip_suffix("IB")
        .or_else(|| suffix.strip_suffix('B'))
        .unwrap_or(&suffix);

    let multiplier: u64 = match unit {
        "" => 1,
        "K" => 1 << 10,
        "M" => 1 << 20,
        "G" => 1 << 30,
        "T" => 1 << 40,
        _ => {
            return Err(ManagerError::ConfigurationError(format!(
                "unknown size suffix: '{suffix}' (use K, M, G, or T)"
            )));
        }
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| ManagerError::ConfigurationError(format!("size overflows: '{s}'")))
}

/// Format a byte count using the largest binary unit that divides it evenly,
/// so `parse_size(format_size(n))` round-trips exactly.
pub fn format_size(bytes: u64) -> String {
    for (shift, suffix) in [(40u32, "T"), (30, "G"), (20, "M"), (10, "K")] {
        let unit = 1u64 << shift;
        if bytes >= unit && bytes % unit == 0 {
            return format!("{}{}", bytes / unit, suffix);
        }
    }
    bytes.to_string()
}

/// Generate a random MAC address, locally administered and unicast:
/// byte 0 satisfies `(b0 & 0x03) == 0x02`.
pub fn generate_mac_address() -> String {
    let mut octets = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut octets);
    octets[0] = (octets[0] & 0xFC) | 0x02;
    octets
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Check that a MAC string is six `:`-separated hex octets with the
/// locally-administered unicast bits set.
pub fn is_valid_mac_address(mac: &str) -> bool {
    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return false;
    }
    let mut octets = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        if part.len() != 2 {
            return false;
        }
        match u8::from_str_radix(part, 16) {
            Ok(b) => octets[i] = b,
            Err(_) => return false,
        }
    }
    octets[0] & 0x03 == 0x02
}

/// Number of logical CPUs on the host.
pub fn host_cpu_count() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

/// Total physical memory in bytes, from /proc/meminfo.
pub fn host_memory_bytes() -> u64 {
    let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
        return u64::MAX;
    };
    meminfo
        .lines()
        .find_map(|line| {
            let rest = line.strip_prefix("MemTotal:")?;
            let kib: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
            Some(kib * 1024)
        })
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_binary_units() {
        assert_eq!(parse_size("64G").unwrap(), 64 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("512M").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_size("100K").unwrap(), 100 * 1024);
        assert_eq!(parse_size("2T").unwrap(), 2 * (1u64 << 40));
        assert_eq!(parse_size("1073741824").unwrap(), 1073741824);
    }

    #[test]
    fn parse_size_accepts_b_and_ib_tails() {
        assert_eq!(parse_size("4GB").unwrap(), 4 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("4GiB").unwrap(), 4 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("4gib").unwrap(), 4 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("512mb").unwrap(), 512 * 1024 * 1024);
    }

    #[test]
    fn parse_size_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("10X").is_err());
        assert!(parse_size("G10").is_err());
        assert!(parse_size("-5G").is_err());
        assert!(parse_size("999999999999T").is_err());
    }

    #[test]
    fn format_parse_round_trip() {
        for i in 0..4u32 {
            for n in [1u64, 3, 64, 500] {
                let bytes = n * 1024u64.pow(i);
                assert_eq!(parse_size(&format_size(bytes)).unwrap(), bytes);
            }
        }
    }

    #[test]
    fn format_size_picks_largest_even_unit() {
        assert_eq!(format_size(64 * 1024 * 1024 * 1024), "64G");
        assert_eq!(format_size(1536 * 1024 * 1024), "1536M");
        assert_eq!(format_size(1000), "1000");
    }

    #[test]
    fn generated_macs_are_local_unicast() {
        for _ in 0..64 {
            let mac = generate_mac_address();
            assert!(is_valid_mac_address(&mac), "bad mac: {mac}");
            let b0 = u8::from_str_radix(&mac[..2], 16).unwrap();
            assert_eq!(b0 & 0x03, 0x02);
        }
    }

    #[test]
    fn mac_validation_rejects_malformed() {
        assert!(!is_valid_mac_address(""));
        assert!(!is_valid_mac_address("02:00:00:00:00"));
        assert!(!is_valid_mac_address("02:00:00:00:00:zz"));
        // universally administered
        assert!(!is_valid_mac_address("00:11:22:33:44:55"));
        // multicast bit set
        assert!(!is_valid_mac_address("03:00:00:00:00:01"));
    }
}
