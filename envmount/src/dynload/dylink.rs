//! Decoder for the dynamic-linking custom section of a binary module.
//!
//! # Layout
//!
//! ```text
//! module   = magic(00 61 73 6d) version(u32 LE) section*
//! section  = id(u8) size(uleb32) payload
//! custom   = name_len(uleb32) name payload          (id 0)
//!
//! "dylink.0" payload = subsection*
//!   subsection = kind(u8) size(uleb32) body
//!   kind 1 MEM_INFO: mem_size mem_align table_size table_align (uleb32 each)
//!   kind 2 NEEDED:   count(uleb32) (len(uleb32) utf8)*
//!
//! "dylink" (legacy) payload =
//!   mem_size mem_align table_size table_align count (len utf8)*
//! ```

use thiserror::Error;

use crate::installer::LIBRARY_MAGIC;

const CUSTOM_SECTION: u8 = 0;
const DYLINK_SECTION: &str = "dylink.0";
const LEGACY_DYLINK_SECTION: &str = "dylink";
const SUBSECTION_MEM_INFO: u8 = 1;
const SUBSECTION_NEEDED: u8 = 2;
const HEADER_LEN: usize = 8;

/// Result type for section decoding.
pub type DylinkResult<T> = Result<T, DylinkError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DylinkError {
    #[error("not a loadable module (bad magic)")]
    BadMagic,

    #[error("module truncated at byte {offset}")]
    Truncated { offset: usize },

    #[error("malformed LEB128 integer at byte {offset}")]
    InvalidLeb { offset: usize },

    #[error("library name at byte {offset} is not UTF-8")]
    InvalidName { offset: usize },

    #[error("module has no dynamic-linking section")]
    MissingSection,
}

/// Dynamic-linking metadata of one module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DylinkInfo {
    pub memory_size: u32,
    pub memory_align: u32,
    pub table_size: u32,
    pub table_align: u32,
    /// Libraries this module needs, by file name.
    pub needed: Vec<String>,
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn u8(&mut self) -> DylinkResult<u8> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or(DylinkError::Truncated { offset: self.pos })?;
        self.pos += 1;
        Ok(byte)
    }

    fn uleb32(&mut self) -> DylinkResult<u32> {
        let start = self.pos;
        let mut result: u32 = 0;
        let mut shift = 0;
        loop {
            let byte = self.u8()?;
            if shift >= 32 || (shift == 28 && byte & 0x70 != 0) {
                return Err(DylinkError::InvalidLeb { offset: start });
            }
            result |= u32::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    fn bytes(&mut self, len: usize) -> DylinkResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(DylinkError::Truncated {
                offset: self.data.len(),
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn name(&mut self) -> DylinkResult<String> {
        let len = self.uleb32()? as usize;
        let offset = self.pos;
        let raw = self.bytes(len)?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| DylinkError::InvalidName { offset })
    }

    fn needed_list(&mut self) -> DylinkResult<Vec<String>> {
        let count = self.uleb32()?;
        (0..count).map(|_| self.name()).collect()
    }
}

/// Decode the dynamic-linking section of `module`.
pub fn parse_dylink(module: &[u8]) -> DylinkResult<DylinkInfo> {
    if !module.starts_with(&LIBRARY_MAGIC) {
        return Err(DylinkError::BadMagic);
    }
    if module.len() < HEADER_LEN {
        return Err(DylinkError::Truncated {
            offset: module.len(),
        });
    }

    let mut reader = Reader::new(module, HEADER_LEN);
    while !reader.at_end() {
        let id = reader.u8()?;
        let size = reader.uleb32()? as usize;
        let payload = reader.bytes(size)?;
        if id != CUSTOM_SECTION {
            continue;
        }

        let payload_start = reader.pos - size;
        let mut section = Reader::new(payload, 0);
        let name = section.name()?;
        let body = &payload[section.pos..];
        let body_offset = payload_start + section.pos;

        match name.as_str() {
            DYLINK_SECTION => return parse_subsections(body, body_offset),
            LEGACY_DYLINK_SECTION => return parse_legacy(body, body_offset),
            _ => {}
        }
    }
    Err(DylinkError::MissingSection)
}

fn with_offset(err: DylinkError, base: usize) -> DylinkError {
    match err {
        DylinkError::Truncated { offset } => DylinkError::Truncated { offset: base + offset },
        DylinkError::InvalidLeb { offset } => DylinkError::InvalidLeb { offset: base + offset },
        DylinkError::InvalidName { offset } => DylinkError::InvalidName { offset: base + offset },
        other => other,
    }
}

fn parse_subsections(body: &[u8], base: usize) -> DylinkResult<DylinkInfo> {
    let mut info = DylinkInfo::default();
    let mut reader = Reader::new(body, 0);
    while !reader.at_end() {
        let kind = reader.u8().map_err(|e| with_offset(e, base))?;
        let size = reader.uleb32().map_err(|e| with_offset(e, base))? as usize;
        let start = base + reader.pos;
        let sub = reader.bytes(size).map_err(|e| with_offset(e, base))?;
        let mut sub_reader = Reader::new(sub, 0);
        let rebase = |e| with_offset(e, start);
        match kind {
            SUBSECTION_MEM_INFO => {
                info.memory_size = sub_reader.uleb32().map_err(rebase)?;
                info.memory_align = sub_reader.uleb32().map_err(rebase)?;
                info.table_size = sub_reader.uleb32().map_err(rebase)?;
                info.table_align = sub_reader.uleb32().map_err(rebase)?;
            }
            SUBSECTION_NEEDED => {
                info.needed = sub_reader.needed_list().map_err(rebase)?;
            }
            _ => {}
        }
    }
    Ok(info)
}

fn parse_legacy(body: &[u8], base: usize) -> DylinkResult<DylinkInfo> {
    let mut reader = Reader::new(body, 0);
    let parse = |reader: &mut Reader<'_>| -> DylinkResult<DylinkInfo> {
        Ok(DylinkInfo {
            memory_size: reader.uleb32()?,
            memory_align: reader.uleb32()?,
            table_size: reader.uleb32()?,
            table_align: reader.uleb32()?,
            needed: reader.needed_list()?,
        })
    };
    parse(&mut reader).map_err(|e| with_offset(e, base))
}

/// Encoders for building modules in tests.
#[cfg(test)]
pub(crate) mod encode {
    pub fn uleb(mut value: u32, out: &mut Vec<u8>) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                out.push(byte);
                return;
            }
            out.push(byte | 0x80);
        }
    }

    fn name(s: &str, out: &mut Vec<u8>) {
        uleb(s.len() as u32, out);
        out.extend_from_slice(s.as_bytes());
    }

    fn custom_section(section: &str, body: &[u8], out: &mut Vec<u8>) {
        let mut payload = Vec::new();
        name(section, &mut payload);
        payload.extend_from_slice(body);
        out.push(0);
        uleb(payload.len() as u32, out);
        out.extend_from_slice(&payload);
    }

    fn header() -> Vec<u8> {
        vec![0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00]
    }

    /// A module whose `dylink.0` section lists `needed`.
    pub fn module(needed: &[&str]) -> Vec<u8> {
        let mut body = Vec::new();

        let mut mem = Vec::new();
        for v in [1024, 4, 2, 0] {
            uleb(v, &mut mem);
        }
        body.push(1);
        uleb(mem.len() as u32, &mut body);
        body.extend_from_slice(&mem);

        let mut list = Vec::new();
        uleb(needed.len() as u32, &mut list);
        for lib in needed {
            name(lib, &mut list);
        }
        body.push(2);
        uleb(list.len() as u32, &mut body);
        body.extend_from_slice(&list);

        let mut out = header();
        custom_section("dylink.0", &body, &mut out);
        out
    }

    /// A module with the legacy `dylink` section.
    pub fn legacy_module(needed: &[&str]) -> Vec<u8> {
        let mut body = Vec::new();
        for v in [64, 2, 0, 0] {
            uleb(v, &mut body);
        }
        uleb(needed.len() as u32, &mut body);
        for lib in needed {
            name(lib, &mut body);
        }
        let mut out = header();
        custom_section("dylink", &body, &mut out);
        out
    }

    /// A module with a non-custom section before `dylink.0`.
    pub fn module_after_type_section(needed: &[&str]) -> Vec<u8> {
        let mut out = header();
        out.extend_from_slice(&[1, 1, 0]);
        out.extend_from_slice(&module(needed)[8..]);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_needed_libraries() {
        let info = parse_dylink(&encode::module(&["libz.so", "libc++.so"])).unwrap();
        assert_eq!(info.needed, vec!["libz.so", "libc++.so"]);
        assert_eq!(info.memory_size, 1024);
        assert_eq!(info.memory_align, 4);
        assert_eq!(info.table_size, 2);
    }

    #[test]
    fn test_parse_legacy_section() {
        let info = parse_dylink(&encode::legacy_module(&["libfoo.so"])).unwrap();
        assert_eq!(info.needed, vec!["libfoo.so"]);
        assert_eq!(info.memory_size, 64);
    }

    #[test]
    fn test_skips_other_sections() {
        let info = parse_dylink(&encode::module_after_type_section(&["liba.so"])).unwrap();
        assert_eq!(info.needed, vec!["liba.so"]);
    }

    #[test]
    fn test_rejects_non_modules() {
        assert_eq!(parse_dylink(b"\x7fELF\x02\x01"), Err(DylinkError::BadMagic));
        assert!(matches!(
            parse_dylink(&[0x00, 0x61, 0x73, 0x6d, 0x01]),
            Err(DylinkError::Truncated { .. })
        ));
        assert_eq!(
            parse_dylink(&[0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00]),
            Err(DylinkError::MissingSection)
        );
    }

    #[test]
    fn test_truncated_section() {
        let mut module = encode::module(&["libz.so"]);
        module.truncate(module.len() - 3);
        assert!(matches!(parse_dylink(&module), Err(DylinkError::Truncated { .. })));
    }

    #[test]
    fn test_overlong_leb_is_rejected() {
        let mut module = vec![0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, 0x00];
        module.extend_from_slice(&[0xff, 0xff, 0xff, 0xff, 0x7f]);
        assert!(matches!(parse_dylink(&module), Err(DylinkError::InvalidLeb { .. })));
    }

    proptest! {
        #[test]
        fn test_uleb_round_trip(value in any::<u32>()) {
            let mut bytes = Vec::new();
            encode::uleb(value, &mut bytes);
            let mut reader = Reader::new(&bytes, 0);
            prop_assert_eq!(reader.uleb32().unwrap(), value);
            prop_assert!(reader.at_end());
        }

        #[test]
        fn test_needed_names_survive(names in proptest::collection::vec("[a-z]{1,8}\\.so", 0..6)) {
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let info = parse_dylink(&encode::module(&refs)).unwrap();
            prop_assert_eq!(info.needed, names);
        }
    }
}
