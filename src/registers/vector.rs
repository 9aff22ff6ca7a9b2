//! x86-64 vector register (`ymm`/`zmm`) views over the XSAVE area (spec.md
//! §4.2, §6). Grounded on
//! `examples/original_source/libdebug/architectures/amd64/amd64_ptrace_register_holder.py`'s
//! `_handle_fpregs_896`/`_handle_fpregs_2560`, which slice the raw FXSAVE/
//! XSAVE buffer at fixed byte offsets rather than interpreting it as a
//! typed struct.
//!
//! All I/O is little-endian (spec.md §4.2). These methods never invoke the
//! get/set callbacks themselves — per the "explicit `fetch_fp()`/
//! `flush_fp()`" design note (spec.md §9), callers (`Thread::ymm`,
//! `Thread::set_ymm`, ...) are responsible for fetching fresh XSAVE bytes
//! before a read and flushing after a write.

use super::FpRegisterFile;
use crate::error::{EngineError, EngineResult};

const XMM_OFFSET: usize = 160;

fn read_le_128(buf: &[u8], offset: usize) -> u128 {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&buf[offset..offset + 16]);
    u128::from_le_bytes(bytes)
}

fn write_le_128(buf: &mut [u8], offset: usize, value: u128) {
    buf[offset..offset + 16].copy_from_slice(&value.to_le_bytes());
}

fn read_le_256(buf: &[u8], offset: usize) -> (u128, u128) {
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&buf[offset..offset + 32]);
    let mut lo = [0u8; 16];
    let mut hi = [0u8; 16];
    lo.copy_from_slice(&bytes[0..16]);
    hi.copy_from_slice(&bytes[16..32]);
    (u128::from_le_bytes(lo), u128::from_le_bytes(hi))
}

fn write_le_256(buf: &mut [u8], offset: usize, low: u128, high: u128) {
    buf[offset..offset + 16].copy_from_slice(&low.to_le_bytes());
    buf[offset + 16..offset + 32].copy_from_slice(&high.to_le_bytes());
}

fn read_le_512(buf: &[u8], offset: usize) -> [u128; 4] {
    let mut out = [0u128; 4];
    for (i, chunk) in out.iter_mut().enumerate() {
        *chunk = read_le_128(buf, offset + i * 16);
    }
    out
}

fn write_le_512(buf: &mut [u8], offset: usize, value: [u128; 4]) {
    for (i, chunk) in value.iter().enumerate() {
        write_le_128(buf, offset + i * 16, *chunk);
    }
}

/// A 256-bit value, as the low 128 bits (XMM half) and the high 128 bits
/// (AVX component half).
pub type Ymm = (u128, u128);
/// A 512-bit value as four little-endian 128-bit limbs, limb 0 least
/// significant.
pub type Zmm = [u128; 4];

impl FpRegisterFile {
    fn require_avx(&self) -> EngineResult<()> {
        match self.component_size {
            FpRegisterFile::STANDARD_AVX_SIZE | FpRegisterFile::AVX512_SIZE => Ok(()),
            size => Err(EngineError::UnsupportedFpLayout { size }),
        }
    }

    fn require_avx512(&self) -> EngineResult<()> {
        if self.component_size == FpRegisterFile::AVX512_SIZE {
            Ok(())
        } else {
            Err(EngineError::UnsupportedFpLayout { size: self.component_size })
        }
    }

    fn ymm_offset(&self) -> usize {
        8 + self.avx_offset
    }

    /// Reads `ymm_i` as (xmm_low, avx_high). Valid for any supported
    /// `component_size` (896 or 2560).
    pub fn ymm(&self, i: u8) -> EngineResult<Ymm> {
        self.require_avx()?;
        assert!(i <= 15, "ymm{i} out of range [0, 15]");
        let offset = i as usize * 16;
        let xmm_val = read_le_128(&self.raw, XMM_OFFSET + offset);
        let ymm_val = read_le_128(&self.raw, self.ymm_offset() + offset);
        Ok((xmm_val, ymm_val))
    }

    pub fn set_ymm(&mut self, i: u8, value: Ymm) -> EngineResult<()> {
        self.require_avx()?;
        assert!(i <= 15, "ymm{i} out of range [0, 15]");
        let offset = i as usize * 16;
        write_le_128(&mut self.raw, XMM_OFFSET + offset, value.0);
        let ymm_offset = self.ymm_offset();
        write_le_128(&mut self.raw, ymm_offset + offset, value.1);
        Ok(())
    }

    /// The low 128 bits of `ymm_i`, i.e. the XMM view (spec.md testable
    /// property 5/6).
    pub fn xmm(&self, i: u8) -> EngineResult<u128> {
        self.require_avx()?;
        assert!(i <= 15, "xmm{i} out of range [0, 15]");
        Ok(read_le_128(&self.raw, XMM_OFFSET + i as usize * 16))
    }

    pub fn set_xmm(&mut self, i: u8, value: u128) -> EngineResult<()> {
        self.require_avx()?;
        assert!(i <= 15, "xmm{i} out of range [0, 15]");
        write_le_128(&mut self.raw, XMM_OFFSET + i as usize * 16, value);
        Ok(())
    }

    /// Reads `zmm_i`. Requires `component_size == 2560` (AVX-512).
    pub fn zmm(&self, i: u8) -> EngineResult<Zmm> {
        self.require_avx512()?;
        assert!(i <= 31, "zmm{i} out of range [0, 31]");
        if i <= 15 {
            let offset = i as usize * 16;
            let low = read_le_128(&self.raw, XMM_OFFSET + offset);
            let mid = read_le_128(&self.raw, 576 + offset);
            let (hi0, hi1) = read_le_256(&self.raw, 1024 + offset * 2);
            Ok([low, mid, hi0, hi1])
        } else {
            let local = (i - 16) as usize;
            let quad = read_le_512(&self.raw, 1536 + local * 64);
            Ok(quad)
        }
    }

    pub fn set_zmm(&mut self, i: u8, value: Zmm) -> EngineResult<()> {
        self.require_avx512()?;
        assert!(i <= 31, "zmm{i} out of range [0, 31]");
        if i <= 15 {
            let offset = i as usize * 16;
            write_le_128(&mut self.raw, XMM_OFFSET + offset, value[0]);
            write_le_128(&mut self.raw, 576 + offset, value[1]);
            write_le_256(&mut self.raw, 1024 + offset * 2, value[2], value[3]);
        } else {
            let local = (i - 16) as usize;
            write_le_512(&mut self.raw, 1536 + local * 64, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn avx_file() -> FpRegisterFile {
        FpRegisterFile::new(FpRegisterFile::STANDARD_AVX_SIZE, 576)
    }

    fn avx512_file() -> FpRegisterFile {
        FpRegisterFile::new(FpRegisterFile::AVX512_SIZE, 576)
    }

    #[test]
    fn ymm_round_trip_and_xmm_alias() {
        let mut fp = avx_file();
        let v: Ymm = (0x1111_2222_3333_4444_5555_6666_7777_8888, 0xAAAA_BBBB_CCCC_DDDD_EEEE_FFFF_0000_1111);
        fp.set_ymm(3, v).unwrap();
        assert_eq!(fp.ymm(3).unwrap(), v);
        assert_eq!(fp.xmm(3).unwrap(), v.0);
    }

    #[test]
    fn zmm_round_trip_low_bank() {
        let mut fp = avx512_file();
        let v: Zmm = [
            0x8BAD_F00D_F00D_BABE_DEAD_BEEF_CAFE_BABE,
            0xFEDC_BA98_7654_3210_0123_4567_89AB_CDEF,
            0x1111_1111_1111_1111_2222_2222_2222_2222,
            0x3333_3333_3333_3333_4444_4444_4444_4444,
        ];
        fp.set_zmm(3, v).unwrap();
        assert_eq!(fp.zmm(3).unwrap(), v);
        // ymm3/xmm3 observe the low 256/128 bits of zmm3.
        assert_eq!(fp.ymm(3).unwrap(), (v[0], v[1]));
        assert_eq!(fp.xmm(3).unwrap(), v[0]);
    }

    #[test]
    fn zmm_round_trip_high_bank_independent_of_low_bank_offsets() {
        let mut fp = avx512_file();
        let low_untouched: Zmm = [1, 2, 3, 4];
        fp.set_zmm(5, low_untouched).unwrap();

        let high: Zmm = [0xdead, 0xbeef, 0xcafe, 0xbabe];
        fp.set_zmm(20, high).unwrap();

        assert_eq!(fp.zmm(5).unwrap(), low_untouched);
        assert_eq!(fp.zmm(20).unwrap(), high);
    }

    #[test]
    fn unsupported_layout_rejected() {
        let fp = FpRegisterFile::new(1234, 0);
        assert!(matches!(
            fp.ymm(0),
            Err(EngineError::UnsupportedFpLayout { size: 1234 })
        ));
    }

    #[test]
    fn zmm_requires_avx512() {
        let fp = avx_file();
        assert!(matches!(
            fp.zmm(0),
            Err(EngineError::UnsupportedFpLayout { size: 896 })
        ));
    }
}
