//! Human-readable disassembly of a [`CodeScript`], mirroring `emit.rs`'s
//! word format exactly.

use crate::bytecode::word::*;
use crate::bytecode::{CodeFunction, CodeScript, TaggedConstant};
use kbc_ir::Opcode;

pub fn disassemble(script: &CodeScript) -> String {
    let mut out = String::new();
    for (index, func) in script.functions.iter().enumerate() {
        let name = func
            .debug
            .as_ref()
            .and_then(|d| d.function_name)
            .map(|offset| heap_str(&script.debug_heap, offset))
            .unwrap_or("<anonymous>");
        out.push_str(&format!(
            "function #{index} {name} (params={}, stack={}, flags={:#04x})\n",
            func.param_count, func.stack_size, func.flags
        ));
        disassemble_function(func, script, &mut out);
        out.push('\n');
    }
    out
}

fn disassemble_function(func: &CodeFunction, script: &CodeScript, out: &mut String) {
    let mut word = 0usize;
    let mut instr = 0usize;
    while word < func.ops.len() {
        let (opcode, r, operand_count) = decode_header(func.ops[word]);
        let operand_count = operand_count as usize;
        let mnemonic = opcode.map(mnemonic_of).unwrap_or("<bad opcode>");

        let mut operand_strs = Vec::with_capacity(operand_count);
        for slot in 0..operand_count {
            let operand_word_index = word + 1 + slot;
            if operand_word_index >= func.ops.len() {
                operand_strs.push("<truncated>".to_string());
                continue;
            }
            operand_strs.push(format_operand(func.ops[operand_word_index], func, script));
        }

        out.push_str(&format!("  [{instr:4}] r{r:<3} {mnemonic:<12} {}\n", operand_strs.join(", ")));

        word += 1 + operand_count;
        instr += 1;
    }
}

fn format_operand(word: u32, func: &CodeFunction, script: &CodeScript) -> String {
    let (tag, signed) = decode_operand(word);
    let raw = signed as u32;
    match tag {
        TAG_REG => format!("r{raw}"),
        TAG_CONST_INDEX => format_constant(func, raw),
        TAG_SELECTOR_INDEX => format_selector(func, script, raw),
        TAG_IMMEDIATE => format!("#{signed}"),
        TAG_BLOCK_OFFSET => format!("{signed:+}"),
        TAG_UPSTACK => format!("upstack[{raw}]"),
        TAG_OUTENV => format!("outenv[{raw}]"),
        TAG_UPVAL => format!("upval[{raw}]"),
        TAG_FUNCTION => format!("fn#{raw}"),
        TAG_NULL => "null".to_string(),
        TAG_TRUE => "true".to_string(),
        TAG_FALSE => "false".to_string(),
        _ => format!("<bad operand tag {tag}>"),
    }
}

fn format_constant(func: &CodeFunction, index: u32) -> String {
    match func.constants.get(index as usize) {
        Some(TaggedConstant::Number(bits)) => format!("k{index}={}", f64::from_bits(*bits)),
        Some(TaggedConstant::StringRef(_)) => format!("k{index}(str)"),
        None => format!("k{index}(?)"),
    }
}

fn format_selector(func: &CodeFunction, script: &CodeScript, index: u32) -> String {
    match func.selectors.get(index as usize) {
        Some(sel) => format!("s{index}.{}", heap_str(&script.heap, sel.key_heap_offset)),
        None => format!("s{index}(?)"),
    }
}

fn heap_str(heap: &[u8], offset: u32) -> &str {
    let start = offset as usize;
    if start > heap.len() {
        return "";
    }
    let end = heap[start..].iter().position(|&b| b == 0).map(|p| start + p).unwrap_or(heap.len());
    std::str::from_utf8(&heap[start..end]).unwrap_or("")
}

fn mnemonic_of(opcode: Opcode) -> &'static str {
    match opcode {
        Opcode::Const => "CONST",
        Opcode::Mov => "MOV",
        Opcode::Nop => "NOP",
        Opcode::Neg => "NEG",
        Opcode::Pos => "POS",
        Opcode::BitNot => "BNOT",
        Opcode::Not => "NOT",
        Opcode::Length => "LEN",
        Opcode::Mul => "MUL",
        Opcode::Div => "DIV",
        Opcode::IntDiv => "IDIV",
        Opcode::Mod => "MOD",
        Opcode::Add => "ADD",
        Opcode::Sub => "SUB",
        Opcode::Concat => "CONCAT",
        Opcode::LShift => "SHL",
        Opcode::RShift => "SHR",
        Opcode::AShift => "ASHR",
        Opcode::BitAnd => "BAND",
        Opcode::BitXor => "BXOR",
        Opcode::BitOr => "BOR",
        Opcode::Eq => "EQ",
        Opcode::Ne => "NE",
        Opcode::Lt => "LT",
        Opcode::Le => "LE",
        Opcode::Is => "IS",
        Opcode::BAnd => "B_AND",
        Opcode::BCut => "B_CUT",
        Opcode::BDef => "B_DEF",
        Opcode::BPhi => "B_PHI",
        Opcode::Phi => "PHI",
        Opcode::Ref => "REF",
        Opcode::GetGlobal => "GET_GLOBAL",
        Opcode::GetKey => "GET_KEY",
        Opcode::SetKey => "SET_KEY",
        Opcode::GetIndex => "GET_INDEX",
        Opcode::SetIndex => "SET_INDEX",
        Opcode::GetUpval => "GET_UPVAL",
        Opcode::SetUpval => "SET_UPVAL",
        Opcode::GetVarenv => "GET_VARENV",
        Opcode::SetVarenv => "SET_VARENV",
        Opcode::GetOutenv => "GET_OUTENV",
        Opcode::SetOutenv => "SET_OUTENV",
        Opcode::Superof => "SUPEROF",
        Opcode::NewObject => "NEW_OBJECT",
        Opcode::NewArray => "NEW_ARRAY",
        Opcode::NewTable => "NEW_TABLE",
        Opcode::Append => "APPEND",
        Opcode::Extend => "EXTEND",
        Opcode::Call => "CALL",
        Opcode::YCall => "YCALL",
        Opcode::Yield => "YIELD",
        Opcode::VarargUnpack => "VARARG_UNPACK",
        Opcode::ArrayUnpack => "ARRAY_UNPACK",
        Opcode::CallUnpack => "CALL_UNPACK",
        Opcode::Block => "BLOCK",
        Opcode::Jump => "JUMP",
        Opcode::JumpTest => "JUMP_TEST",
        Opcode::JumpForEgen => "JUMP_FOR_EGEN",
        Opcode::JumpForSgen => "JUMP_FOR_SGEN",
        Opcode::JumpForEach => "JUMP_FOR_EACH",
        Opcode::JumpForStep => "JUMP_FOR_STEP",
        Opcode::JumpThrow => "JUMP_THROW",
        Opcode::JumpReturn => "JUMP_RETURN",
        Opcode::CloseUpstack => "CLOSE_UPSTACK",
        Opcode::Function => "FUNCTION",
        Opcode::FVarenv => "F_VARENV",
        Opcode::FOutenv => "F_OUTENV",
        Opcode::AddK => "ADDK",
        Opcode::AddI => "ADDI",
        Opcode::SubK => "SUBK",
        Opcode::SubI => "SUBI",
        Opcode::ConcatK => "CONCATK",
        Opcode::RConcatK => "RCONCATK",
        Opcode::JEqK => "JEQK",
        Opcode::JNeK => "JNEK",
        Opcode::JLtK => "JLTK",
        Opcode::JGtK => "JGTK",
        Opcode::JLeK => "JLEK",
        Opcode::JGeK => "JGEK",
        Opcode::GetIndexK => "GET_INDEXK",
        Opcode::GetIndexI => "GET_INDEXI",
        Opcode::SetIndexK => "SET_INDEXK",
        Opcode::SetIndexI => "SET_INDEXI",
        Opcode::MulK => "MULK",
        Opcode::MulI => "MULI",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{flags, CodeDebugFunction};

    #[test]
    fn disassembles_a_single_return_null() {
        let mut script = CodeScript::default();
        let header = (Opcode::JumpReturn.to_u8() as u32) | (0u32 << 8) | (1u32 << 16);
        let operand = (TAG_NULL as u32) << 24;
        script.functions.push(CodeFunction {
            ops: vec![header, operand],
            constants: Vec::new(),
            selectors: Vec::new(),
            outenv_count: 0,
            param_count: 1,
            stack_size: 1,
            flags: flags::HAS_VARARGS,
            debug: Some(CodeDebugFunction { function_name: None, slocs: vec![0], variables: Vec::new(), var_spans: Vec::new() }),
        });
        let text = disassemble(&script);
        assert!(text.contains("JUMP_RETURN"));
        assert!(text.contains("null"));
    }
}
