//! Typed view over an agent's registration metadata
//!
//! Agents describe themselves with lines such as
//! `CPU | Model: X | Physical CPUs: 2` or `Memory | 16000MB`. A leading
//! segment without a colon names the section; `Key: value` segments become
//! fields, and bare segments become the value of the section itself.

use std::collections::HashMap;

/// Parsed registration metadata
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemInfo {
    /// The blob exactly as received
    raw: String,
    /// First occurrence of each key anywhere in the blob
    fields: HashMap<String, String>,
    /// First occurrence of each key within a named section
    sections: HashMap<(String, String), String>,
}

impl SystemInfo {
    /// Parse a metadata blob. Never fails; unrecognised text is kept in
    /// [`SystemInfo::raw`] for searching.
    pub fn parse(raw: &str) -> Self {
        let mut info = Self {
            raw: raw.to_string(),
            ..Default::default()
        };

        for line in raw.lines() {
            let segments: Vec<&str> = line
                .split('|')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect();

            let (section, rest) = match segments.split_first() {
                Some((first, rest)) if !first.contains(':') && !rest.is_empty() => (Some(*first), rest),
                _ => (None, segments.as_slice()),
            };

            for segment in rest {
                let (key, value) = match segment.split_once(':') {
                    Some((key, value)) => (key.trim(), value.trim()),
                    None => match section {
                        Some(section) => (section, *segment),
                        None => continue,
                    },
                };
                info.insert(section, key, value);
            }
        }

        info
    }

    fn insert(&mut self, section: Option<&str>, key: &str, value: &str) {
        self.fields
            .entry(key.to_string())
            .or_insert_with(|| value.to_string());
        if let Some(section) = section {
            self.sections
                .entry((section.to_string(), key.to_string()))
                .or_insert_with(|| value.to_string());
        }
    }

    /// The blob exactly as received
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Whether the agent sent no metadata at all
    pub fn is_empty(&self) -> bool {
        self.raw.trim().is_empty()
    }

    /// First value recorded for `key`, in any section
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// First value recorded for `key` inside `section`
    pub fn get_in(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(&(section.to_string(), key.to_string()))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE: &str = "\
CPU | Model: Intel(R) Xeon(R) Gold 6230 | Physical CPUs: 2 | Logical CPUs: 80 | Frequency: 2.10GHz
Memory | 385434MB
Disk | 446GB
Product | Family: PowerEdge | Name: R740 | Serial Number: 7XQ1 | UUID: 4c4c-4544 | SKU: SKU=0715 | Vendor: Dell Inc. | Version: 1.0
Disk Types | Name: sda | Type: SSD | Size: 446GB
Name: sdb | Type: HDD | Size: 3726GB
Network Interfaces | Name: eno1 MAC: d0:94:66:aa:bb:cc IPs: [10.0.0.5/24]
";

    #[test]
    fn test_parse_sectioned_fields() {
        let info = SystemInfo::parse(SAMPLE);

        assert_eq!(info.get("Model"), Some("Intel(R) Xeon(R) Gold 6230"));
        assert_eq!(info.get("Physical CPUs"), Some("2"));
        assert_eq!(info.get("Vendor"), Some("Dell Inc."));
        assert_eq!(info.get("Serial Number"), Some("7XQ1"));
        assert_eq!(info.get("SKU"), Some("SKU=0715"));
    }

    #[test]
    fn test_bare_segments_belong_to_their_section() {
        let info = SystemInfo::parse(SAMPLE);

        assert_eq!(info.get("Memory"), Some("385434MB"));
        assert_eq!(info.get("Disk"), Some("446GB"));
    }

    #[test]
    fn test_section_scoped_lookup_disambiguates() {
        let info = SystemInfo::parse(SAMPLE);

        assert_eq!(info.get_in("Product", "Name"), Some("R740"));
        assert_eq!(info.get_in("Disk Types", "Name"), Some("sda"));
        assert_eq!(info.get_in("CPU", "Name"), None);
    }

    #[test]
    fn test_values_keep_inner_colons() {
        let info = SystemInfo::parse(SAMPLE);
        assert_eq!(
            info.get_in("Network Interfaces", "Name"),
            Some("eno1 MAC: d0:94:66:aa:bb:cc IPs: [10.0.0.5/24]")
        );
    }

    #[test]
    fn test_unsectioned_line() {
        let info = SystemInfo::parse("Model: X | Physical CPUs: 2\n");

        assert_eq!(info.get("Model"), Some("X"));
        assert_eq!(info.get("Physical CPUs"), Some("2"));
        assert_eq!(info.get("Vendor"), None);
    }

    #[test]
    fn test_error_lines_are_kept_raw() {
        let info = SystemInfo::parse("Error getting RAID info: lshw not found\n");
        assert!(info.raw().contains("lshw not found"));
        assert!(!info.is_empty());
    }

    #[test]
    fn test_empty_blob() {
        let info = SystemInfo::parse("");
        assert!(info.is_empty());
        assert_eq!(info.get("Model"), None);
    }

    proptest! {
        #[test]
        fn test_key_value_segments_are_recovered(
            pairs in prop::collection::btree_map("[A-Za-z][A-Za-z ]{0,10}[A-Za-z]", "[A-Za-z0-9.]{1,12}", 1..6),
        ) {
            let line = pairs
                .iter()
                .map(|(k, v)| format!("{}: {}", k, v))
                .collect::<Vec<_>>()
                .join(" | ");
            let info = SystemInfo::parse(&line);

            for (key, value) in &pairs {
                prop_assert_eq!(info.get(key), Some(value.as_str()));
            }
        }
    }
}
