//! Hardware vendor lookup from the OUI prefix of a MAC address.

pub const UNKNOWN: &str = "Unknown";

/// Label for locally administered (randomized or virtual) addresses.
pub const RANDOMIZED: &str = "Private Device (Randomized MAC)";

/// Known OUI prefixes (first three octets, uppercase hex, no separators).
const OUI_VENDORS: &[(&str, &str)] = &[
    ("000C29", "VMware"),
    ("005056", "VMware"),
    ("080027", "Oracle VirtualBox"),
    ("001A11", "Google"),
    ("F4F5D8", "Google"),
    ("000C41", "Cisco"),
    ("00000C", "Cisco"),
    ("001122", "Xerox"),
    ("00037F", "Tektronix"),
    ("002272", "American Micro-Fuel Device Corp"),
    ("B827EB", "Raspberry Pi Foundation"),
    ("DCA632", "Raspberry Pi Trading"),
    ("E45F01", "Raspberry Pi Trading"),
    ("3C22FB", "Apple"),
    ("A45E60", "Apple"),
    ("F01898", "Apple"),
    ("001DD8", "Microsoft"),
    ("7CED8D", "Microsoft Xbox"),
    ("00D9D1", "Sony PlayStation"),
    ("709E29", "Sony PlayStation"),
    ("F8461C", "Sony PlayStation"),
    ("0009BF", "Nintendo"),
    ("0017AB", "Nintendo"),
    ("98B6E9", "Nintendo"),
    ("E84E06", "Nintendo"),
    ("14CC20", "TP-Link"),
    ("50C7BF", "TP-Link"),
    ("C83A35", "Tenda"),
    ("00E04C", "Realtek"),
    ("001E58", "D-Link"),
    ("2C3AFD", "AVM"),
];

/// Contiguous OUI ranges assigned to gaming consoles (inclusive).
const CONSOLE_RANGES: &[(u32, u32, &str)] = &[(0x001B63, 0x001BFF, "Microsoft Xbox")];

/// Hostname fragments that identify a console when the OUI is not known.
const HOSTNAME_HINTS: &[(&str, &str)] = &[
    ("ps5", "Sony PlayStation"),
    ("ps4", "Sony PlayStation"),
    ("playstation", "Sony PlayStation"),
    ("xbox", "Microsoft Xbox"),
    ("nintendo", "Nintendo Switch"),
    ("switch", "Nintendo Switch"),
];

fn oui_hex(mac: &str) -> Option<String> {
    let hex: String = mac
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .take(6)
        .collect::<String>()
        .to_ascii_uppercase();
    (hex.len() == 6).then_some(hex)
}

/// Check whether the locally-administered bit (0x02 of the first octet) is set.
pub fn is_locally_administered(mac: &str) -> bool {
    oui_hex(mac)
        .and_then(|hex| u8::from_str_radix(&hex[..2], 16).ok())
        .is_some_and(|first| first & 0x02 != 0)
}

/// Vendor name for `mac`, `"Unknown"` when the prefix is not in the table.
pub fn lookup_vendor(mac: &str) -> String {
    let Some(oui) = oui_hex(mac) else {
        return UNKNOWN.to_string();
    };

    if let Some((_, vendor)) = OUI_VENDORS.iter().find(|(prefix, _)| *prefix == oui) {
        return vendor.to_string();
    }

    if let Ok(value) = u32::from_str_radix(&oui, 16) {
        if let Some((_, _, vendor)) = CONSOLE_RANGES
            .iter()
            .find(|(lo, hi, _)| (*lo..=*hi).contains(&value))
        {
            return vendor.to_string();
        }
    }

    if is_locally_administered(mac) {
        return RANDOMIZED.to_string();
    }
    UNKNOWN.to_string()
}

/// Console vendor implied by the hostname, applied only when the OUI gave nothing useful.
pub fn refine_from_hostname(vendor: &str, hostname: &str) -> Option<&'static str> {
    if vendor != UNKNOWN && vendor != RANDOMIZED {
        return None;
    }
    let host = hostname.to_ascii_lowercase();
    let label = host.split('.').next().unwrap_or_default();
    HOSTNAME_HINTS
        .iter()
        .find(|(hint, _)| label.contains(hint))
        .map(|(_, vendor)| *vendor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known_prefix_any_separator() {
        assert_eq!(lookup_vendor("00:0C:29:12:34:56"), "VMware");
        assert_eq!(lookup_vendor("b8-27-eb-00-11-22"), "Raspberry Pi Foundation");
    }

    #[test]
    fn test_console_range_lookup() {
        assert_eq!(lookup_vendor("00:1B:63:00:00:01"), "Microsoft Xbox");
        assert_eq!(lookup_vendor("00:1B:FF:00:00:01"), "Microsoft Xbox");
        assert_eq!(lookup_vendor("00:1B:62:00:00:01"), UNKNOWN);
    }

    #[test]
    fn test_locally_administered_detection() {
        assert!(is_locally_administered("02:00:00:00:00:01"));
        assert!(is_locally_administered("DA:A1:19:00:00:01"));
        assert!(!is_locally_administered("00:0C:29:12:34:56"));
        assert_eq!(lookup_vendor("DA:A1:19:00:00:01"), RANDOMIZED);
    }

    #[test]
    fn test_garbage_is_unknown() {
        assert_eq!(lookup_vendor(""), UNKNOWN);
        assert_eq!(lookup_vendor("zz:zz"), UNKNOWN);
        assert!(!is_locally_administered("q"));
    }

    #[test]
    fn test_hostname_refines_only_unknown_vendor() {
        assert_eq!(refine_from_hostname(UNKNOWN, "PS5-123.lan"), Some("Sony PlayStation"));
        assert_eq!(refine_from_hostname(RANDOMIZED, "xboxone"), Some("Microsoft Xbox"));
        assert_eq!(refine_from_hostname(UNKNOWN, "Nintendo-Switch"), Some("Nintendo Switch"));
        assert_eq!(refine_from_hostname("Apple", "ps5"), None);
        assert_eq!(refine_from_hostname(UNKNOWN, "laptop.lan"), None);
    }
}
