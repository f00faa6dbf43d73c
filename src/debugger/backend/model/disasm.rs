use crate::debugger::backend::{Address, Instruction};
use crate::debugger::Error;
use capstone::prelude::*;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

const CACHE_SIZE: usize = 256;

/// x86-64 disassembler over a memory image.
///
/// Decoded instruction runs are cached by (start address, count) pair,
/// cache must be reset when the code memory is modified.
pub struct Disassembler {
    cache: Mutex<LruCache<(Address, usize), Vec<Instruction>>>,
}

impl Default for Disassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Disassembler {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_SIZE).expect("infallible"),
            )),
        }
    }

    fn capstone() -> Result<Capstone, Error> {
        Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode64)
            .syntax(arch::x86::ArchSyntax::Att)
            .build()
            .map_err(Error::DisAsmInit)
    }

    /// Decode at most `count` instructions from `code`, first byte of `code` is located at `address`.
    pub fn disasm(
        &self,
        code: &[u8],
        address: Address,
        count: usize,
    ) -> Result<Vec<Instruction>, Error> {
        let mut cache = self.cache.lock().map_err(|_| {
            Error::Backend("disassembler cache is poisoned".to_string())
        })?;
        let instructions = cache.try_get_or_insert((address, count), || -> Result<_, Error> {
            let cs = Self::capstone()?;
            let decoded = cs
                .disasm_count(code, address, count)
                .map_err(Error::DisAsm)?;
            Ok(decoded
                .iter()
                .map(|insn| Instruction {
                    address: insn.address(),
                    bytes: insn.bytes().to_vec(),
                    mnemonic: insn.mnemonic().unwrap_or_default().to_string(),
                    operands: insn.op_str().unwrap_or_default().to_string(),
                })
                .collect())
        })?;
        Ok(instructions.clone())
    }

    pub fn reset(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_disasm_nop_sled() {
        let disasm = Disassembler::new();
        let code = [0x90u8; 8];
        let instructions = disasm.disasm(&code, 0x1000, 4).unwrap();
        assert_eq!(instructions.len(), 4);
        for (i, insn) in instructions.iter().enumerate() {
            assert_eq!(insn.address, 0x1000 + i as u64);
            assert_eq!(insn.mnemonic, "nop");
            assert_eq!(insn.bytes, vec![0x90]);
        }
    }

    #[test]
    fn test_disasm_cache() {
        let disasm = Disassembler::new();
        let first = disasm.disasm(&[0x90, 0xc3], 0x2000, 2).unwrap();
        // same key, cached result
        let second = disasm.disasm(&[], 0x2000, 2).unwrap();
        assert_eq!(first, second);
        assert_eq!(second[1].mnemonic, "ret");

        disasm.reset();
        let third = disasm.disasm(&[0xc3], 0x2000, 2).unwrap();
        assert_eq!(third.len(), 1);
    }
}
