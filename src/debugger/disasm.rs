//! Synthetic disassembly documents for code without usable source.
//!
//! A document covers a contiguous instruction run (a whole function when the symbol is known),
//! one instruction per line: line `N` is instruction `N - 1`. Documents are never evicted,
//! so a source reference stays valid for the whole session.

use crate::debugger::backend::{Address, Backend, Instruction, Symbol};
use crate::debugger::Error;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;

/// Instructions decoded around an address without a known symbol.
const ANONYMOUS_RUN: usize = 64;
/// Upper bound of a function document length.
const MAX_FUNCTION_RUN: usize = 4096;

/// When stack frames show disassembly instead of source.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ShowDisassembly {
    /// Only for frames without source.
    #[default]
    Auto,
    Always,
    Never,
}

#[derive(Debug)]
pub struct Document {
    pub reference: i64,
    /// Display name, `@symbol` or `@0x...`.
    pub name: String,
    instructions: Vec<Instruction>,
}

impl Document {
    pub fn start(&self) -> Address {
        self.instructions.first().map_or(0, |insn| insn.address)
    }

    /// First address after the document.
    pub fn end(&self) -> Address {
        self.instructions
            .last()
            .map_or(0, |insn| insn.address + insn.bytes.len() as u64)
    }

    pub fn contains(&self, address: Address) -> bool {
        (self.start()..self.end()).contains(&address)
    }

    /// 1-based line of the instruction starting at `address`.
    pub fn line_of(&self, address: Address) -> Option<u32> {
        self.instructions
            .binary_search_by_key(&address, |insn| insn.address)
            .ok()
            .map(|idx| idx as u32 + 1)
    }

    pub fn address_of(&self, line: u32) -> Option<Address> {
        let idx = (line as usize).checked_sub(1)?;
        self.instructions.get(idx).map(|insn| insn.address)
    }

    /// Document text, one instruction per line.
    pub fn text(&self) -> String {
        let width = self
            .instructions
            .iter()
            .map(|insn| insn.bytes.len() * 3)
            .max()
            .unwrap_or_default();
        let mut text = String::new();
        for insn in &self.instructions {
            let bytes = insn
                .bytes
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(" ");
            _ = writeln!(
                text,
                "{:016x}: {bytes:<width$} {:<6} {}",
                insn.address, insn.mnemonic, insn.operands
            );
        }
        text
    }
}

/// Store of synthetic disassembly documents of a session.
pub struct Synthesizer {
    next_reference: i64,
    /// Documents by start address.
    documents: BTreeMap<Address, Document>,
    references: HashMap<i64, Address>,
}

impl Default for Synthesizer {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Synthesizer {
    /// Create a store, references are allocated starting from `first_reference`.
    pub fn new(first_reference: i64) -> Self {
        Self {
            next_reference: first_reference,
            documents: BTreeMap::new(),
            references: HashMap::new(),
        }
    }

    pub fn get(&self, reference: i64) -> Option<&Document> {
        let start = self.references.get(&reference)?;
        self.documents.get(start)
    }

    /// Document containing an instruction starting at `address`.
    fn find(&self, address: Address) -> Option<&Document> {
        self.documents
            .range(..=address)
            .next_back()
            .map(|(_, doc)| doc)
            .filter(|doc| doc.line_of(address).is_some())
    }

    /// Return (reference, line) of an address, disassemble a new document if needed.
    pub fn locate(&mut self, backend: &dyn Backend, address: Address) -> Result<(i64, u32), Error> {
        if let Some(doc) = self.find(address) {
            if let Some(line) = doc.line_of(address) {
                return Ok((doc.reference, line));
            }
        }

        let symbol = backend.symbol_at(address);
        let (start, count, name) = match symbol {
            Some(ref sym) => (
                sym.start,
                symbol_run(sym),
                format!("@{}", sym.display_name()),
            ),
            None => (address, ANONYMOUS_RUN, format!("@{address:#x}")),
        };

        let mut instructions = backend.disassemble(start, count)?;
        if let Some(ref sym) = symbol {
            instructions.retain(|insn| insn.address < sym.end);
        }
        // decoding from a symbol start may not land on `address` (data in code), restart at it
        if instructions.binary_search_by_key(&address, |insn| insn.address).is_err() {
            instructions = backend.disassemble(address, ANONYMOUS_RUN)?;
        }
        if instructions.is_empty() {
            return Err(Error::InvalidAddress(address));
        }

        // do not overlap with already known documents
        let start = instructions[0].address;
        if let Some((&next, _)) = self.documents.range(start + 1..).next() {
            instructions.retain(|insn| insn.address < next);
        }

        let reference = self.next_reference;
        self.next_reference += 1;
        let document = Document {
            reference,
            name,
            instructions,
        };
        let line = document.line_of(address).ok_or(Error::InvalidAddress(address))?;
        log::debug!(
            target: "session",
            "disassembly document {reference} ({}) covers {:#x}..{:#x}",
            document.name,
            document.start(),
            document.end()
        );
        self.references.insert(reference, start);
        self.documents.insert(start, document);
        Ok((reference, line))
    }

    /// Address of a document line.
    pub fn address_of(&self, reference: i64, line: u32) -> Result<Option<Address>, Error> {
        let doc = self.get(reference).ok_or(Error::UnknownSource(reference))?;
        Ok(doc.address_of(line))
    }

    pub fn text(&self, reference: i64) -> Result<String, Error> {
        self.get(reference)
            .map(Document::text)
            .ok_or(Error::UnknownSource(reference))
    }
}

/// Number of instructions to decode for a symbol, a malformed symbol range gives one.
fn symbol_run(sym: &Symbol) -> usize {
    usize::try_from(sym.end.saturating_sub(sym.start))
        .unwrap_or(MAX_FUNCTION_RUN)
        .clamp(1, MAX_FUNCTION_RUN)
}
