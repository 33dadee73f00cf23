//! Property tokens and typed accessors.

use crate::node::{TOKEN_NOP, TOKEN_PROP, align4, str_at};
use crate::be32_at;

/// A single property of a device-tree node.
#[derive(Debug, Clone, Copy)]
pub struct DtbProperty<'a> {
    name: &'a str,
    data: &'a [u8],
}

impl<'a> DtbProperty<'a> {
    pub(crate) fn new(name: &'a str, data: &'a [u8]) -> Self {
        Self { name, data }
    }

    /// Returns the property name.
    #[must_use]
    pub fn name(&self) -> &'a str {
        self.name
    }

    /// Returns the raw property bytes.
    #[must_use]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Returns the length of the property data in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the property carries no data (a boolean flag).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Interprets the property as a big-endian `u32`.
    #[must_use]
    pub fn as_u32(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.data.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// Interprets the property as a big-endian `u64`.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        let bytes: [u8; 8] = self.data.get(..8)?.try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    /// Interprets the property as a null-terminated UTF-8 string.
    #[must_use]
    pub fn as_str(&self) -> Option<&'a str> {
        let bytes = if self.data.last() == Some(&0) {
            &self.data[..self.data.len() - 1]
        } else {
            self.data
        };
        core::str::from_utf8(bytes).ok()
    }

    /// Returns an iterator over a null-separated string list (the layout of
    /// `compatible` and friends).
    #[must_use]
    pub fn as_str_list(&self) -> StringListIter<'a> {
        StringListIter { data: self.data }
    }
}

/// Iterator over a null-separated string list property.
pub struct StringListIter<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for StringListIter<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        let end = self
            .data
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.data.len());
        let s = core::str::from_utf8(&self.data[..end]).ok()?;
        self.data = if end < self.data.len() {
            &self.data[end + 1..]
        } else {
            &[]
        };
        if s.is_empty() {
            return None;
        }
        Some(s)
    }
}

/// Iterator over the properties of a node.
///
/// Scans `TOKEN_PROP` entries from a given structure-block offset, stopping
/// at the first non-property token.
pub struct PropertyIter<'a> {
    struct_block: &'a [u8],
    strings_block: &'a [u8],
    offset: usize,
}

impl<'a> PropertyIter<'a> {
    pub(crate) fn new(struct_block: &'a [u8], strings_block: &'a [u8], offset: usize) -> Self {
        Self {
            struct_block,
            strings_block,
            offset,
        }
    }

    /// Returns the current byte offset into the structure block.
    pub(crate) fn offset(&self) -> usize {
        self.offset
    }
}

impl<'a> Iterator for PropertyIter<'a> {
    type Item = DtbProperty<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let tag = be32_at(self.struct_block, self.offset)?;
            match tag {
                TOKEN_PROP => {
                    let len = be32_at(self.struct_block, self.offset + 4)? as usize;
                    let name_off = be32_at(self.struct_block, self.offset + 8)? as usize;
                    let data_start = self.offset + 12;
                    let data = self.struct_block.get(data_start..data_start + len)?;
                    let name = str_at(self.strings_block, name_off)?;
                    self.offset = align4(data_start + len);
                    return Some(DtbProperty::new(name, data));
                }
                TOKEN_NOP => self.offset += 4,
                // BEGIN_NODE, END_NODE, END: properties are over.
                _ => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::Dtb;
    use crate::testblob::*;

    fn single_prop_dtb(name: &str, data: &[u8]) -> Vec<u8> {
        let (strings, offs) = build_strings(&[name]);
        let mut st = Vec::new();
        emit_begin_node(&mut st, "");
        emit_prop(&mut st, offs[0], data);
        emit_end_node(&mut st);
        emit_end(&mut st);
        build_dtb(&st, &strings, &[], 0)
    }

    #[test]
    fn u64_property() {
        let blob = single_prop_dtb("reg", &be64(0x4000_0000_0000_0000));
        let dtb = Dtb::parse(&blob).unwrap();
        let reg = dtb.root().property("reg").unwrap();
        assert_eq!(reg.as_u64(), Some(0x4000_0000_0000_0000));
    }

    #[test]
    fn empty_property_is_flag() {
        let blob = single_prop_dtb("dma-coherent", &[]);
        let dtb = Dtb::parse(&blob).unwrap();
        let p = dtb.root().property("dma-coherent").unwrap();
        assert!(p.is_empty());
        assert_eq!(p.as_u32(), None);
        assert_eq!(p.as_str(), Some(""));
    }

    #[test]
    fn short_data_rejected_by_typed_reads() {
        let blob = single_prop_dtb("val", &[0xAB, 0xCD]);
        let dtb = Dtb::parse(&blob).unwrap();
        let p = dtb.root().property("val").unwrap();
        assert_eq!(p.as_u32(), None);
        assert_eq!(p.as_u64(), None);
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn iteration_preserves_order() {
        let (strings, offs) = build_strings(&["aaa", "bbb", "ccc"]);
        let mut st = Vec::new();
        emit_begin_node(&mut st, "");
        emit_prop(&mut st, offs[0], &be32(1));
        emit_prop(&mut st, offs[1], &be32(2));
        emit_prop(&mut st, offs[2], &be32(3));
        emit_end_node(&mut st);
        emit_end(&mut st);

        let blob = build_dtb(&st, &strings, &[], 0);
        let dtb = Dtb::parse(&blob).unwrap();
        let props: Vec<(&str, u32)> = dtb
            .root()
            .properties()
            .map(|p| (p.name(), p.as_u32().unwrap()))
            .collect();
        assert_eq!(props, &[("aaa", 1), ("bbb", 2), ("ccc", 3)]);
    }
}
