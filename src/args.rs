use crate::arch::{self, Regs};
use crate::log::LogLevel::LogWarn;
use crate::thread::{RecordFlags, ThreadData};
use crate::util::align;

/// Spec index standing for "the return value" rather than a positional
/// argument.
pub const RETVAL_IDX: i32 = 0;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ArgFormat {
    Auto,
    Signed,
    Unsigned,
    Hex,
    Char,
    Str,
}

/// How to fetch and encode one captured value.
#[derive(Copy, Clone, Debug)]
pub struct ArgSpec {
    /// 1-based argument position, or RETVAL_IDX.
    pub idx: i32,
    pub fmt: ArgFormat,
    /// Copied size in bytes for scalar formats.
    pub size: usize,
}

impl ArgSpec {
    pub fn arg(idx: i32) -> ArgSpec {
        ArgSpec {
            idx,
            fmt: ArgFormat::Auto,
            size: 8,
        }
    }

    pub fn retval() -> ArgSpec {
        ArgSpec {
            idx: RETVAL_IDX,
            fmt: ArgFormat::Auto,
            size: 8,
        }
    }

    pub fn is_retval(&self) -> bool {
        self.idx == RETVAL_IDX
    }

    /// Parse one spec token: `argN` or `retval`, optionally followed by
    /// `/<fmt><bits>` as in `arg1/i32`, `arg2/s`, `retval/x64`. Argument
    /// positions beyond the captured register file are rejected here;
    /// recording a made-up value would be indistinguishable from a real
    /// zero argument.
    pub fn parse(token: &str) -> Option<ArgSpec> {
        let mut parts = token.splitn(2, '/');
        let name = parts.next()?;

        let mut spec = if name == "retval" {
            ArgSpec::retval()
        } else if let Some(n) = name.strip_prefix("arg") {
            let idx = n.parse::<i32>().ok()?;
            if idx < 1 || idx > crate::arch::NR_ARG_REGS {
                return None;
            }
            ArgSpec::arg(idx)
        } else {
            return None;
        };

        if let Some(fmt) = parts.next() {
            let mut chars = fmt.chars();
            match chars.next()? {
                'd' | 'i' => spec.fmt = ArgFormat::Signed,
                'u' => spec.fmt = ArgFormat::Unsigned,
                'x' => spec.fmt = ArgFormat::Hex,
                'c' => {
                    spec.fmt = ArgFormat::Char;
                    spec.size = 1;
                }
                's' => {
                    spec.fmt = ArgFormat::Str;
                    spec.size = 0;
                }
                _ => return None,
            }
            let bits = chars.as_str();
            if !bits.is_empty() {
                match bits.parse::<usize>().ok()? {
                    b @ 8 | b @ 16 | b @ 32 | b @ 64 => spec.size = b / 8,
                    _ => return None,
                }
            }
        }

        Some(spec)
    }
}

/// Where a captured value comes from: the entry register file or the
/// saved return register.
pub enum ArgSource<'a> {
    Args(&'a Regs),
    Retval(i64),
}

/// Encode the matching spec entries into `slot` as the wire payload: a
/// u16 total-length prefix, scalars in declared size advanced 4-aligned,
/// strings as `u16 len` plus NUL-terminated bytes advanced 4-aligned.
/// Returns the total (prefix excluded), or None when the payload does
/// not fit.
pub fn save_to_argbuf(slot: &mut [u8], specs: &[ArgSpec], source: &ArgSource) -> Option<u16> {
    let for_retval = matches!(source, ArgSource::Retval(_));
    let mut offset = 2usize;

    for spec in specs {
        if for_retval != spec.is_retval() {
            continue;
        }

        let value: i64 = match source {
            ArgSource::Args(regs) => arch::get_arg(regs, spec),
            ArgSource::Retval(v) => *v,
        };

        if spec.fmt == ArgFormat::Str {
            if value != 0 {
                // Bounded scan for the NUL; a string that cannot fit in
                // the remaining slot space overflows the payload anyway.
                if slot.len() - offset < 4 {
                    return None;
                }
                let cap = slot.len() - offset - 3;
                let bytes = unsafe { std::slice::from_raw_parts(value as *const u8, cap) };
                let len = match memchr::memchr(0, bytes) {
                    Some(len) => len,
                    None => return None,
                };

                let block = 2 + align(len + 1, 4);
                if offset + block > slot.len() {
                    return None;
                }
                slot[offset..offset + 2].copy_from_slice(&(len as u16).to_le_bytes());
                slot[offset + 2..offset + 2 + len + 1].copy_from_slice(&bytes[..len + 1]);
                for pad in &mut slot[offset + 2 + len + 1..offset + block] {
                    *pad = 0;
                }
                offset += block;
            } else {
                // null pointer: length 4 and an all-ones marker
                if offset + 6 > slot.len() {
                    return None;
                }
                slot[offset..offset + 2].copy_from_slice(&4u16.to_le_bytes());
                for b in &mut slot[offset + 2..offset + 6] {
                    *b = 0xff;
                }
                offset += 6;
            }
        } else {
            let block = align(spec.size, 4);
            if offset + block > slot.len() {
                return None;
            }
            let bytes = value.to_le_bytes();
            slot[offset..offset + spec.size].copy_from_slice(&bytes[..spec.size]);
            for pad in &mut slot[offset + spec.size..offset + block] {
                *pad = 0;
            }
            offset += block;
        }
    }

    let total = (offset - 2) as u16;
    slot[0..2].copy_from_slice(&total.to_le_bytes());
    Some(total)
}

/// Stage the entry arguments for a frame; marks the frame ARGUMENT only
/// when everything fit.
pub fn save_argument(mtdp: &mut ThreadData, frame_idx: usize, specs: &[ArgSpec], regs: &Regs) {
    let slot = mtdp.argbuf_slot_mut(frame_idx);
    match save_to_argbuf(slot, specs, &ArgSource::Args(regs)) {
        Some(_) => mtdp.rstack[frame_idx].flags.insert(RecordFlags::ARGUMENT),
        None => log!(LogWarn, "argument data is too big"),
    }
}

/// Stage the return value for a frame about to be recorded; an overflow
/// drops the payload by clearing RETVAL.
pub fn save_retval(mtdp: &mut ThreadData, frame_idx: usize, retval: i64) {
    let specs = match mtdp.rstack[frame_idx].pargs.clone() {
        Some(specs) => specs,
        None => return,
    };
    let slot = mtdp.argbuf_slot_mut(frame_idx);
    if save_to_argbuf(slot, &specs, &ArgSource::Retval(retval)).is_none() {
        log!(LogWarn, "retval data is too big");
        mtdp.rstack[frame_idx].flags.remove(RecordFlags::RETVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ARGBUF_SIZE;
    use std::ffi::CString;

    fn slot() -> Vec<u8> {
        vec![0xaau8; ARGBUF_SIZE]
    }

    #[test]
    fn parse_specs() {
        let s = ArgSpec::parse("arg1").unwrap();
        assert_eq!(s.idx, 1);
        assert_eq!(s.fmt, ArgFormat::Auto);
        assert_eq!(s.size, 8);

        let s = ArgSpec::parse("arg2/i32").unwrap();
        assert_eq!(s.fmt, ArgFormat::Signed);
        assert_eq!(s.size, 4);

        let s = ArgSpec::parse("arg3/s").unwrap();
        assert_eq!(s.fmt, ArgFormat::Str);

        let s = ArgSpec::parse("retval/x64").unwrap();
        assert!(s.is_retval());
        assert_eq!(s.fmt, ArgFormat::Hex);
        assert_eq!(s.size, 8);

        // the last register-held argument is fine, anything past it is
        // not servable and must not parse
        assert_eq!(ArgSpec::parse("arg6").unwrap().idx, 6);
        assert!(ArgSpec::parse("arg7").is_none());

        assert!(ArgSpec::parse("arg0").is_none());
        assert!(ArgSpec::parse("bogus").is_none());
        assert!(ArgSpec::parse("arg1/q").is_none());
        assert!(ArgSpec::parse("arg1/i12").is_none());
    }

    #[test]
    fn scalar_and_string_payload() {
        // p(7, "hi") captured as [i32, string]
        let mut spec_int = ArgSpec::arg(1);
        spec_int.fmt = ArgFormat::Signed;
        spec_int.size = 4;
        let mut spec_str = ArgSpec::arg(2);
        spec_str.fmt = ArgFormat::Str;

        let hi = CString::new("hi").unwrap();
        let mut regs = Regs::default();
        regs.rdi = 7;
        regs.rsi = hi.as_ptr() as u64;

        let mut buf = slot();
        let total =
            save_to_argbuf(&mut buf, &[spec_int, spec_str], &ArgSource::Args(&regs)).unwrap();

        assert_eq!(total, 10);
        assert_eq!(&buf[0..2], &10u16.to_le_bytes());
        assert_eq!(&buf[2..6], &[0x07, 0x00, 0x00, 0x00]);
        assert_eq!(&buf[6..12], &[0x02, 0x00, b'h', b'i', 0x00, 0x00]);
    }

    #[test]
    fn null_string_payload() {
        let mut spec = ArgSpec::arg(1);
        spec.fmt = ArgFormat::Str;
        let regs = Regs::default();

        let mut buf = slot();
        let total = save_to_argbuf(&mut buf, &[spec], &ArgSource::Args(&regs)).unwrap();

        assert_eq!(total, 6);
        assert_eq!(&buf[2..4], &4u16.to_le_bytes());
        assert_eq!(&buf[4..8], &[0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn retval_only_picks_retval_specs() {
        let mut arg = ArgSpec::arg(1);
        arg.fmt = ArgFormat::Signed;
        arg.size = 4;
        let ret = ArgSpec::retval();

        let mut buf = slot();
        let total = save_to_argbuf(&mut buf, &[arg, ret], &ArgSource::Retval(-1)).unwrap();

        // only the 8-byte retval, not the 4-byte argument
        assert_eq!(total, 8);
        assert_eq!(&buf[2..10], &(-1i64).to_le_bytes());
    }

    #[test]
    fn oversized_string_overflows() {
        let mut spec = ArgSpec::arg(1);
        spec.fmt = ArgFormat::Str;

        let big = CString::new("x".repeat(2 * ARGBUF_SIZE)).unwrap();
        let mut regs = Regs::default();
        regs.rdi = big.as_ptr() as u64;

        let mut buf = slot();
        assert!(save_to_argbuf(&mut buf, &[spec], &ArgSource::Args(&regs)).is_none());
    }

    #[test]
    fn char_scalar_is_padded() {
        let mut spec = ArgSpec::arg(1);
        spec.fmt = ArgFormat::Char;
        spec.size = 1;
        let mut regs = Regs::default();
        regs.rdi = b'Z' as u64;

        let mut buf = slot();
        let total = save_to_argbuf(&mut buf, &[spec], &ArgSource::Args(&regs)).unwrap();
        assert_eq!(total, 4);
        assert_eq!(&buf[2..6], &[b'Z', 0x00, 0x00, 0x00]);
    }
}
