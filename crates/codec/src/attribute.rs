//! TLV attribute walk over the region following the 20-byte header.
//!
//! Each attribute is `type(1) length(1) value(length-2)`, `length` in
//! `2..=255` and covering the type/length bytes themselves. Vendor-Specific
//! attributes (type 26) nest a 4-byte vendor id followed by one or more
//! sub-TLVs in the same shape; this module exposes both the flat walk and a
//! vendor-aware lookup.

use crate::{Error, Result};

pub const VENDOR_SPECIFIC: u8 = 26;
pub const MESSAGE_AUTHENTICATOR: u8 = 80;

/// A single top-level attribute's position within the buffer it was scanned
/// from: `(type, value_range)`, where `value_range` excludes the type/length
/// bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub kind: u8,
    pub start: usize,
    pub end: usize,
}

/// A scanned, validated cache of a packet's attribute region.
///
/// Built once per inbound packet by [`Attributes::scan`]; subsequent lookups
/// are linear scans of this small in-memory index rather than re-walking the
/// wire bytes.
#[derive(Debug, Default, Clone)]
pub struct Attributes {
    entries: Vec<Entry>,
}

impl Attributes {
    /// Walks `region` (the bytes after the 20-byte header) validating every
    /// TLV's length and bounds, and records `(type, value_range)` for each.
    pub fn scan(region: &[u8]) -> Result<Self> {
        let mut entries = Vec::new();
        let mut offset = 0usize;

        while offset < region.len() {
            if region.len() - offset < 2 {
                // A single trailing byte after the last complete TLV is
                // tolerated, not a hard error (§4.1, §8 property 5).
                log::warn!("attribute region has {} trailing byte(s) after the last TLV, ignoring", region.len() - offset);
                break;
            }

            let kind = region[offset];
            let length = region[offset + 1];

            if length < 2 {
                return Err(Error::AttributeTooShort { offset, length });
            }

            let end = offset + length as usize;
            if end > region.len() {
                return Err(Error::AttributeOverrun { offset });
            }

            entries.push(Entry {
                kind,
                start: offset + 2,
                end,
            });

            offset = end;
        }

        Ok(Self { entries })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    /// Value bytes of the first attribute of the given type, if present.
    pub fn find<'a>(&self, region: &'a [u8], kind: u8) -> Option<&'a [u8]> {
        self.entries
            .iter()
            .find(|e| e.kind == kind)
            .map(|e| &region[e.start..e.end])
    }

    pub fn find_all<'a>(&self, region: &'a [u8], kind: u8) -> Vec<&'a [u8]> {
        self.entries
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| &region[e.start..e.end])
            .collect()
    }

    pub fn has(&self, kind: u8) -> bool {
        self.entries.iter().any(|e| e.kind == kind)
    }

    /// Finds the value of a Vendor-Specific sub-attribute for the given
    /// vendor id and sub-type, scanning every Vendor-Specific (26) top-level
    /// attribute that carries it.
    pub fn find_vendor<'a>(
        &self,
        region: &'a [u8],
        vendor_id: u32,
        sub_type: u8,
    ) -> Result<Option<&'a [u8]>> {
        Ok(self
            .find_vendor_range(region, vendor_id, sub_type)?
            .map(|(start, end)| &region[start..end]))
    }

    /// Same as [`Attributes::find_vendor`] but returns the sub-attribute
    /// value's `(start, end)` range within `region`, for callers that need
    /// to splice a same-length replacement in place.
    pub fn find_vendor_range(
        &self,
        region: &[u8],
        vendor_id: u32,
        sub_type: u8,
    ) -> Result<Option<(usize, usize)>> {
        for entry in self.entries.iter().filter(|e| e.kind == VENDOR_SPECIFIC) {
            let value = &region[entry.start..entry.end];
            if value.len() < 4 {
                return Err(Error::VendorIdTruncated);
            }
            let id = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
            if id != vendor_id {
                continue;
            }

            let mut offset = 4usize;
            while offset < value.len() {
                if value.len() - offset < 2 {
                    return Err(Error::AttributeTooShort {
                        offset: entry.start + offset,
                        length: (value.len() - offset) as u8,
                    });
                }
                let sub_kind = value[offset];
                let sub_len = value[offset + 1];
                if sub_len < 2 {
                    return Err(Error::AttributeTooShort {
                        offset: entry.start + offset,
                        length: sub_len,
                    });
                }
                let sub_end = offset + sub_len as usize;
                if sub_end > value.len() {
                    return Err(Error::AttributeOverrun {
                        offset: entry.start + offset,
                    });
                }
                if sub_kind == sub_type {
                    return Ok(Some((entry.start + offset + 2, entry.start + sub_end)));
                }
                offset = sub_end;
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tlv(kind: u8, value: &[u8]) -> Vec<u8> {
        let mut out = vec![kind, (value.len() + 2) as u8];
        out.extend_from_slice(value);
        out
    }

    #[test]
    fn scans_flat_attributes() {
        let mut region = tlv(1, b"bob");
        region.extend(tlv(4, &[192, 0, 2, 1]));

        let attrs = Attributes::scan(&region).unwrap();
        assert_eq!(attrs.find(&region, 1), Some(&b"bob"[..]));
        assert_eq!(attrs.find(&region, 4), Some(&[192, 0, 2, 1][..]));
        assert!(!attrs.has(99));
    }

    #[test]
    fn rejects_length_below_two() {
        let region = vec![1u8, 1u8];
        assert!(matches!(
            Attributes::scan(&region),
            Err(Error::AttributeTooShort { .. })
        ));
    }

    #[test]
    fn tolerates_a_single_trailing_byte() {
        let mut region = tlv(1, b"bob");
        region.push(0);

        let attrs = Attributes::scan(&region).unwrap();
        assert_eq!(attrs.find(&region, 1), Some(&b"bob"[..]));
    }

    #[test]
    fn rejects_overrun() {
        let region = vec![1u8, 10u8, 0, 0];
        assert!(matches!(
            Attributes::scan(&region),
            Err(Error::AttributeOverrun { .. })
        ));
    }

    #[test]
    fn finds_vendor_sub_attribute() {
        let mut vendor_value = 311u32.to_be_bytes().to_vec();
        vendor_value.extend(tlv(16, b"mppe-send-key-bytes"));
        let region = tlv(VENDOR_SPECIFIC, &vendor_value);

        let attrs = Attributes::scan(&region).unwrap();
        let value = attrs.find_vendor(&region, 311, 16).unwrap();
        assert_eq!(value, Some(&b"mppe-send-key-bytes"[..]));
        assert_eq!(attrs.find_vendor(&region, 311, 99).unwrap(), None);
        assert_eq!(attrs.find_vendor(&region, 99, 16).unwrap(), None);
    }
}
