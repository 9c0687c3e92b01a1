//! Bytecode image format: little-endian structures mirrored
//! onto the binary layout [`emit`]/[`disasm`] write and read back.
//!
//! `code_function`/`code_debug_function` carry every documented field
//! (including `code_debug_function` nested *inside* its owning
//! `code_function`, since debug info is per-function and optional) but pack
//! each op as a header word plus one trailing word per operand rather than
//! a guessed opcode-specific `a`/`b`/`c`/`i`/`j` punning scheme — see
//! `emit`'s module doc for the operand word format.

pub const MAGIC: [u8; 4] = *b"KBC1";

/// The 32-bit op-word encoding shared by `emit` (which writes it) and
/// `disasm` (which reads it back), kept in one place so the two can't drift.
///
/// Every instruction is a header word followed by one word per operand:
/// `header = opcode:8 | r:8 | operand_count:8 | 0:8`, `operand = tag:8 |
/// payload:24` (payload sign-extended for the immediate/offset tags).
pub mod word {
    pub const TAG_REG: u8 = 0;
    pub const TAG_CONST_INDEX: u8 = 1;
    pub const TAG_SELECTOR_INDEX: u8 = 2;
    pub const TAG_IMMEDIATE: u8 = 3;
    pub const TAG_BLOCK_OFFSET: u8 = 4;
    pub const TAG_UPSTACK: u8 = 5;
    pub const TAG_OUTENV: u8 = 6;
    pub const TAG_UPVAL: u8 = 7;
    pub const TAG_FUNCTION: u8 = 8;
    pub const TAG_NULL: u8 = 9;
    pub const TAG_TRUE: u8 = 10;
    pub const TAG_FALSE: u8 = 11;

    pub fn header_word(opcode: kbc_ir::Opcode, r: u8, operand_count: u8) -> u32 {
        (opcode.to_u8() as u32) | ((r as u32) << 8) | ((operand_count as u32) << 16)
    }

    pub fn decode_header(word: u32) -> (Option<kbc_ir::Opcode>, u8, u8) {
        let opcode = kbc_ir::Opcode::from_u8((word & 0xff) as u8);
        let r = ((word >> 8) & 0xff) as u8;
        let operand_count = ((word >> 16) & 0xff) as u8;
        (opcode, r, operand_count)
    }

    pub fn operand_word(tag: u8, payload: i32) -> u32 {
        ((tag as u32) << 24) | ((payload as u32) & 0x00FF_FFFF)
    }

    pub fn decode_operand(word: u32) -> (u8, i32) {
        let tag = (word >> 24) as u8;
        let raw = word & 0x00FF_FFFF;
        let signed = ((raw << 8) as i32) >> 8;
        (tag, signed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaggedConstant {
    Number(u64),
    StringRef(u32),
}

impl TaggedConstant {
    const STRING_TAG: u64 = 1 << 63;

    fn to_u64(self) -> u64 {
        match self {
            TaggedConstant::Number(bits) => bits & !Self::STRING_TAG,
            TaggedConstant::StringRef(offset) => Self::STRING_TAG | offset as u64,
        }
    }

    fn from_u64(bits: u64) -> Self {
        if bits & Self::STRING_TAG != 0 {
            TaggedConstant::StringRef((bits & !Self::STRING_TAG) as u32)
        } else {
            TaggedConstant::Number(bits)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeSelector {
    pub key_heap_offset: u32,
    pub reserved: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableSpan {
    pub variable_index: u32,
    pub lower: u32,
    pub upper: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugVariable {
    pub name_offset: u32,
    pub r: u8,
}

/// Per-function debug table, nested inside its `code_function`. Absent when a function is emitted without debug info (`code_size
/// = 0`, mirroring the top-level sentinel convention).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeDebugFunction {
    pub function_name: Option<u32>,
    pub slocs: Vec<u32>,
    pub variables: Vec<DebugVariable>,
    pub var_spans: Vec<VariableSpan>,
}

/// One compiled function: flat 32-bit-packed ops plus its constant/selector
/// pools.
#[derive(Debug, Clone, Default)]
pub struct CodeFunction {
    pub ops: Vec<u32>,
    pub constants: Vec<TaggedConstant>,
    pub selectors: Vec<CodeSelector>,
    pub outenv_count: u16,
    pub param_count: u8,
    pub stack_size: u8,
    pub flags: u8,
    pub debug: Option<CodeDebugFunction>,
}

pub mod flags {
    pub const HAS_VARARGS: u8 = 1 << 0;
    pub const IS_METHOD: u8 = 1 << 1;
}

#[derive(Debug, Clone, Default)]
pub struct CodeScript {
    pub heap: Vec<u8>,
    pub functions: Vec<CodeFunction>,
    pub debug_newlines: Vec<u32>,
    pub debug_heap: Vec<u8>,
    pub debug_script_name: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated image")]
    Truncated,
    #[error("bad magic number")]
    BadMagic,
}

impl CodeScript {
    /// Pack the whole image into the little-endian byte layout from
    /// the bytecode contract's `code_script` header.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC);
        push_u32(&mut out, self.heap.len() as u32);

        let mut function_bytes = Vec::new();
        for func in &self.functions {
            write_function(&mut function_bytes, func);
        }
        push_u32(&mut function_bytes, 0); // code_size = 0 sentinel
        push_u32(&mut out, function_bytes.len() as u32);
        push_u32(&mut out, self.debug_newlines.len() as u32);
        push_u32(&mut out, self.debug_script_name.unwrap_or(u32::MAX));

        out.extend_from_slice(&function_bytes);
        out.extend_from_slice(&self.heap);
        for &line_offset in &self.debug_newlines {
            push_u32(&mut out, line_offset);
        }
        out.extend_from_slice(&self.debug_heap);

        out
    }

    /// Parse an image written by [`CodeScript::to_bytes`]. Used for the
    /// round-trip check in ("emitting, re-parsing the image,
    /// and disassembling it yields the same ... debug tables").
    pub fn from_bytes(bytes: &[u8]) -> Result<CodeScript, DecodeError> {
        let mut r = Reader::new(bytes);
        if r.take(4)? != MAGIC {
            return Err(DecodeError::BadMagic);
        }
        let heap_size = r.u32()?;
        let function_size = r.u32()?;
        let debug_newline_count = r.u32()?;
        let debug_script_name = r.u32()?;

        let function_bytes = r.take(function_size as usize)?;
        let functions = read_functions(function_bytes)?;

        let heap = r.take(heap_size as usize)?.to_vec();

        let mut debug_newlines = Vec::with_capacity(debug_newline_count as usize);
        for _ in 0..debug_newline_count {
            debug_newlines.push(r.u32()?);
        }

        let debug_heap = r.rest().to_vec();

        Ok(CodeScript {
            heap,
            functions,
            debug_newlines,
            debug_heap,
            debug_script_name: if debug_script_name == u32::MAX { None } else { Some(debug_script_name) },
        })
    }
}

fn write_function(out: &mut Vec<u8>, func: &CodeFunction) {
    let mut body = Vec::new();
    push_u16(&mut body, func.ops.len() as u16);
    push_u16(&mut body, func.constants.len() as u16);
    push_u16(&mut body, func.selectors.len() as u16);
    push_u16(&mut body, func.outenv_count);
    body.push(func.param_count);
    body.push(func.stack_size);
    body.push(func.flags);
    body.push(0); // padding to a 4-byte boundary

    for &op in &func.ops {
        push_u32(&mut body, op);
    }
    for constant in &func.constants {
        push_u64(&mut body, constant.to_u64());
    }
    for selector in &func.selectors {
        push_u32(&mut body, selector.key_heap_offset);
        push_u32(&mut body, selector.reserved);
    }

    match &func.debug {
        Some(debug_fn) => write_debug_function(&mut body, debug_fn),
        None => push_u32(&mut body, 0),
    }

    push_u32(out, 4 + body.len() as u32); // code_size includes itself
    out.extend_from_slice(&body);
}

fn write_debug_function(out: &mut Vec<u8>, debug_fn: &CodeDebugFunction) {
    let mut body = Vec::new();
    push_u32(&mut body, debug_fn.function_name.unwrap_or(u32::MAX));
    push_u32(&mut body, debug_fn.slocs.len() as u32);
    push_u32(&mut body, debug_fn.variables.len() as u32);
    push_u32(&mut body, debug_fn.var_spans.len() as u32);
    for &sloc in &debug_fn.slocs {
        push_u32(&mut body, sloc);
    }
    for var in &debug_fn.variables {
        push_u32(&mut body, var.name_offset);
        body.push(var.r);
        body.extend_from_slice(&[0, 0, 0]);
    }
    for span in &debug_fn.var_spans {
        push_u32(&mut body, span.variable_index);
        push_u32(&mut body, span.lower);
        push_u32(&mut body, span.upper);
    }
    push_u32(out, 4 + body.len() as u32);
    out.extend_from_slice(&body);
}

fn read_functions(mut bytes: &[u8]) -> Result<Vec<CodeFunction>, DecodeError> {
    let mut functions = Vec::new();
    loop {
        let mut r = Reader::new(bytes);
        let code_size = r.u32()?;
        if code_size == 0 {
            break;
        }
        let body = r.take(code_size as usize - 4)?;
        functions.push(read_function(body)?);
        bytes = r.rest();
    }
    Ok(functions)
}

fn read_function(body: &[u8]) -> Result<CodeFunction, DecodeError> {
    let mut r = Reader::new(body);
    let op_count = r.u16()?;
    let constant_count = r.u16()?;
    let selector_count = r.u16()?;
    let outenv_count = r.u16()?;
    let param_count = r.u8()?;
    let stack_size = r.u8()?;
    let flags = r.u8()?;
    r.u8()?; // padding

    let mut ops = Vec::with_capacity(op_count as usize);
    for _ in 0..op_count {
        ops.push(r.u32()?);
    }
    let mut constants = Vec::with_capacity(constant_count as usize);
    for _ in 0..constant_count {
        constants.push(TaggedConstant::from_u64(r.u64()?));
    }
    let mut selectors = Vec::with_capacity(selector_count as usize);
    for _ in 0..selector_count {
        selectors.push(CodeSelector { key_heap_offset: r.u32()?, reserved: r.u32()? });
    }

    let debug_code_size = r.u32()?;
    let debug = if debug_code_size == 0 {
        None
    } else {
        Some(read_debug_function(r.take(debug_code_size as usize - 4)?)?)
    };

    Ok(CodeFunction { ops, constants, selectors, outenv_count, param_count, stack_size, flags, debug })
}

fn read_debug_function(body: &[u8]) -> Result<CodeDebugFunction, DecodeError> {
    let mut r = Reader::new(body);
    let function_name = r.u32()?;
    let sloc_count = r.u32()?;
    let variable_count = r.u32()?;
    let var_span_count = r.u32()?;

    let mut slocs = Vec::with_capacity(sloc_count as usize);
    for _ in 0..sloc_count {
        slocs.push(r.u32()?);
    }
    let mut variables = Vec::with_capacity(variable_count as usize);
    for _ in 0..variable_count {
        let name_offset = r.u32()?;
        let reg = r.u8()?;
        r.take(3)?;
        variables.push(DebugVariable { name_offset, r: reg });
    }
    let mut var_spans = Vec::with_capacity(var_span_count as usize);
    for _ in 0..var_span_count {
        var_spans.push(VariableSpan { variable_index: r.u32()?, lower: r.u32()?, upper: r.u32()? });
    }

    Ok(CodeDebugFunction {
        function_name: if function_name == u32::MAX { None } else { Some(function_name) },
        slocs,
        variables,
        var_spans,
    })
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.pos + n > self.bytes.len() {
            return Err(DecodeError::Truncated);
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.bytes[self.pos..];
        self.pos = self.bytes.len();
        out
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_script_round_trips() {
        let script = CodeScript::default();
        let bytes = script.to_bytes();
        let back = CodeScript::from_bytes(&bytes).unwrap();
        assert!(back.functions.is_empty());
        assert_eq!(back.heap, script.heap);
    }

    #[test]
    fn function_with_debug_info_round_trips() {
        let mut script = CodeScript::default();
        script.functions.push(CodeFunction {
            ops: vec![0x0000_0001, 0x1020_0304],
            constants: vec![TaggedConstant::Number(14f64.to_bits()), TaggedConstant::StringRef(3)],
            selectors: vec![CodeSelector { key_heap_offset: 0, reserved: 0 }],
            outenv_count: 1,
            param_count: 2,
            stack_size: 5,
            flags: flags::HAS_VARARGS,
            debug: Some(CodeDebugFunction {
                function_name: Some(7),
                slocs: vec![0, 4],
                variables: vec![DebugVariable { name_offset: 2, r: 1 }],
                var_spans: vec![VariableSpan { variable_index: 0, lower: 0, upper: 2 }],
            }),
        });
        script.heap = b"abc\0\0\0\0\0".to_vec();
        script.debug_newlines = vec![0, 9];
        script.debug_heap = b"main\0\0\0\0\0".to_vec();
        script.debug_script_name = Some(0);

        let bytes = script.to_bytes();
        let back = CodeScript::from_bytes(&bytes).unwrap();
        assert_eq!(back.functions.len(), 1);
        assert_eq!(back.functions[0].ops, script.functions[0].ops);
        assert_eq!(back.functions[0].constants, script.functions[0].constants);
        assert_eq!(back.functions[0].debug, script.functions[0].debug);
        assert_eq!(back.debug_newlines, script.debug_newlines);
        assert_eq!(back.debug_heap, script.debug_heap);
        assert_eq!(back.debug_script_name, script.debug_script_name);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let bytes = vec![0u8; 32];
        assert_eq!(CodeScript::from_bytes(&bytes), Err(DecodeError::BadMagic));
    }
}
