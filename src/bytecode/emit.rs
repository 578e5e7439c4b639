//! Bytecode emission: builders producing operand and opcode encodings.
//!
//! The textual assembler front-end is a separate program; this module is
//! the API it (and the test suite) uses to produce images.  Functions
//! and blocks are built instruction by instruction with function-local
//! labels, then linked into a single [Image]: label references are
//! patched to module-absolute offsets and every patched position is
//! recorded in the image's jump table.

use crate::common::Map;
use crate::registers::RsSel;

use super::codec::{pack_prefix, Access, Timeout};
use super::image::{Image, ImageKind};
use super::ops::Opcode;

/// An operand as written by the emitter.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Operand {
    Register {
        index: u32,
        rs: RsSel,
        access: Access,
    },
    Void,
}

pub fn current(index: u32) -> Operand {
    Operand::Register {
        index,
        rs: RsSel::Current,
        access: Access::Direct,
    }
}

pub fn local(index: u32) -> Operand {
    Operand::Register {
        index,
        rs: RsSel::Local,
        access: Access::Direct,
    }
}

pub fn static_reg(index: u32) -> Operand {
    Operand::Register {
        index,
        rs: RsSel::Static,
        access: Access::Direct,
    }
}

pub fn global(index: u32) -> Operand {
    Operand::Register {
        index,
        rs: RsSel::Global,
        access: Access::Direct,
    }
}

/// The register named by the Integer held in register `index`.
pub fn indirect(index: u32) -> Operand {
    Operand::Register {
        index,
        rs: RsSel::Current,
        access: Access::RegisterReference,
    }
}

/// The value behind the Pointer held in register `index`.
pub fn deref(index: u32) -> Operand {
    Operand::Register {
        index,
        rs: RsSel::Current,
        access: Access::PointerDereference,
    }
}

pub fn void() -> Operand {
    Operand::Void
}

/// Call target: a function name or a register holding a callable.
#[derive(Clone, Copy, Debug)]
pub enum Callable<'a> {
    Name(&'a str),
    Register(Operand),
}

/// Builds the body of one function or block.
pub struct BodyBuilder {
    name: String,
    code: Vec<u8>,
    labels: Map<String, usize>,
    fixups: Vec<(usize, String)>,
}

impl BodyBuilder {
    pub fn new(name: impl Into<String>) -> BodyBuilder {
        BodyBuilder {
            name: name.into(),
            code: Vec::new(),
            labels: Map::new(),
            fixups: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Define a label at the current position.
    pub fn label(&mut self, name: impl Into<String>) {
        self.labels.insert(name.into(), self.code.len());
    }

    fn opcode(&mut self, op: Opcode) -> &mut Self {
        self.code.push(op as u8);
        self
    }

    fn operand(&mut self, operand: Operand) -> &mut Self {
        match operand {
            Operand::Register { index, rs, access } => {
                self.code.push(pack_prefix(access, rs));
                self.code.extend_from_slice(&index.to_le_bytes());
            }
            Operand::Void => {
                self.code.push(pack_prefix(Access::Void, RsSel::Current));
            }
        }
        self
    }

    fn atom(&mut self, text: &str) -> &mut Self {
        self.code.push(pack_prefix(Access::Literal, RsSel::Current));
        self.code.extend_from_slice(text.as_bytes());
        self.code.push(0);
        self
    }

    fn uint(&mut self, value: u32) -> &mut Self {
        self.code.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn int(&mut self, value: i64) -> &mut Self {
        self.code.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn float(&mut self, value: f64) -> &mut Self {
        self.code.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn timeout(&mut self, timeout: Timeout) -> &mut Self {
        self.code.extend_from_slice(&timeout.encode().to_le_bytes());
        self
    }

    fn bitstring(&mut self, bytes: &[u8]) -> &mut Self {
        self.code
            .extend_from_slice(&(bytes.len() as u64).to_le_bytes());
        self.code.extend_from_slice(bytes);
        self
    }

    fn label_ref(&mut self, label: &str) -> &mut Self {
        self.fixups.push((self.code.len(), label.to_string()));
        self.code.extend_from_slice(&0u64.to_le_bytes());
        self
    }

    fn callable(&mut self, callable: Callable) -> &mut Self {
        match callable {
            Callable::Name(name) => self.atom(name),
            Callable::Register(operand) => self.operand(operand),
        }
    }

    pub fn op_nop(&mut self) {
        self.opcode(Opcode::Nop);
    }

    pub fn op_izero(&mut self, target: Operand) {
        self.opcode(Opcode::Izero).operand(target);
    }

    pub fn op_integer(&mut self, target: Operand, value: i64) {
        self.opcode(Opcode::Integer).operand(target).int(value);
    }

    pub fn op_iinc(&mut self, target: Operand) {
        self.opcode(Opcode::Iinc).operand(target);
    }

    pub fn op_idec(&mut self, target: Operand) {
        self.opcode(Opcode::Idec).operand(target);
    }

    pub fn op_float(&mut self, target: Operand, value: f64) {
        self.opcode(Opcode::Float).operand(target).float(value);
    }

    /// Any three-operand instruction of the shape `op target lhs rhs`:
    /// the arithmetic families, comparisons, bit binops, shifts and
    /// rotates.
    pub fn op_binary(&mut self, op: Opcode, target: Operand, lhs: Operand, rhs: Operand) {
        self.opcode(op).operand(target).operand(lhs).operand(rhs);
    }

    pub fn op_add(&mut self, target: Operand, lhs: Operand, rhs: Operand) {
        self.op_binary(Opcode::Add, target, lhs, rhs);
    }

    pub fn op_sub(&mut self, target: Operand, lhs: Operand, rhs: Operand) {
        self.op_binary(Opcode::Sub, target, lhs, rhs);
    }

    pub fn op_mul(&mut self, target: Operand, lhs: Operand, rhs: Operand) {
        self.op_binary(Opcode::Mul, target, lhs, rhs);
    }

    pub fn op_div(&mut self, target: Operand, lhs: Operand, rhs: Operand) {
        self.op_binary(Opcode::Div, target, lhs, rhs);
    }

    pub fn op_lt(&mut self, target: Operand, lhs: Operand, rhs: Operand) {
        self.op_binary(Opcode::Lt, target, lhs, rhs);
    }

    pub fn op_eq(&mut self, target: Operand, lhs: Operand, rhs: Operand) {
        self.op_binary(Opcode::Eq, target, lhs, rhs);
    }

    pub fn op_not(&mut self, target: Operand, source: Operand) {
        self.opcode(Opcode::Not).operand(target).operand(source);
    }

    pub fn op_string(&mut self, target: Operand, text: &str) {
        self.opcode(Opcode::String).operand(target).atom(text);
    }

    /// `text` with a literal payload.
    pub fn op_text(&mut self, target: Operand, text: &str) {
        self.opcode(Opcode::Text).operand(target).atom(text);
    }

    /// `text` stringifying a register.
    pub fn op_text_of(&mut self, target: Operand, source: Operand) {
        self.opcode(Opcode::Text).operand(target).operand(source);
    }

    pub fn op_textat(&mut self, target: Operand, source: Operand, index: Operand) {
        self.op_binary(Opcode::Textat, target, source, index);
    }

    pub fn op_textsub(&mut self, target: Operand, source: Operand, begin: Operand, end: Operand) {
        self.opcode(Opcode::Textsub)
            .operand(target)
            .operand(source)
            .operand(begin)
            .operand(end);
    }

    pub fn op_textlength(&mut self, target: Operand, source: Operand) {
        self.opcode(Opcode::Textlength).operand(target).operand(source);
    }

    pub fn op_atom(&mut self, target: Operand, name: &str) {
        self.opcode(Opcode::Atom).operand(target).atom(name);
    }

    pub fn op_atomeq(&mut self, target: Operand, lhs: Operand, rhs: Operand) {
        self.op_binary(Opcode::Atomeq, target, lhs, rhs);
    }

    pub fn op_bits(&mut self, target: Operand, bytes: &[u8]) {
        self.opcode(Opcode::Bits).operand(target).bitstring(bytes);
    }

    pub fn op_bitnot(&mut self, target: Operand, source: Operand) {
        self.opcode(Opcode::Bitnot).operand(target).operand(source);
    }

    pub fn op_bitat(&mut self, target: Operand, bits: Operand, index: Operand) {
        self.op_binary(Opcode::Bitat, target, bits, index);
    }

    pub fn op_bitset(&mut self, bits: Operand, index: Operand, value: Operand) {
        self.op_binary(Opcode::Bitset, bits, index, value);
    }

    pub fn op_move(&mut self, target: Operand, source: Operand) {
        self.opcode(Opcode::Move).operand(target).operand(source);
    }

    pub fn op_copy(&mut self, target: Operand, source: Operand) {
        self.opcode(Opcode::Copy).operand(target).operand(source);
    }

    pub fn op_ptr(&mut self, target: Operand, source: Operand) {
        self.opcode(Opcode::Ptr).operand(target).operand(source);
    }

    pub fn op_swap(&mut self, a: Operand, b: Operand) {
        self.opcode(Opcode::Swap).operand(a).operand(b);
    }

    pub fn op_delete(&mut self, target: Operand) {
        self.opcode(Opcode::Delete).operand(target);
    }

    pub fn op_isnull(&mut self, target: Operand, source: Operand) {
        self.opcode(Opcode::Isnull).operand(target).operand(source);
    }

    pub fn op_ress(&mut self, selector: u32) {
        self.opcode(Opcode::Ress).uint(selector);
    }

    pub fn op_vector(&mut self, target: Operand, start: Operand, count: u32) {
        self.opcode(Opcode::Vector)
            .operand(target)
            .operand(start)
            .uint(count);
    }

    pub fn op_vinsert(&mut self, vector: Operand, source: Operand, position: Operand) {
        self.op_binary(Opcode::Vinsert, vector, source, position);
    }

    pub fn op_vpush(&mut self, vector: Operand, source: Operand) {
        self.opcode(Opcode::Vpush).operand(vector).operand(source);
    }

    pub fn op_vpop(&mut self, target: Operand, vector: Operand, position: Operand) {
        self.op_binary(Opcode::Vpop, target, vector, position);
    }

    pub fn op_vat(&mut self, target: Operand, vector: Operand, position: Operand) {
        self.op_binary(Opcode::Vat, target, vector, position);
    }

    pub fn op_vlen(&mut self, target: Operand, vector: Operand) {
        self.opcode(Opcode::Vlen).operand(target).operand(vector);
    }

    pub fn op_struct(&mut self, target: Operand) {
        self.opcode(Opcode::Struct).operand(target);
    }

    pub fn op_structinsert(&mut self, st: Operand, key: Operand, value: Operand) {
        self.op_binary(Opcode::Structinsert, st, key, value);
    }

    pub fn op_structremove(&mut self, target: Operand, st: Operand, key: Operand) {
        self.op_binary(Opcode::Structremove, target, st, key);
    }

    pub fn op_structkeys(&mut self, target: Operand, st: Operand) {
        self.opcode(Opcode::Structkeys).operand(target).operand(st);
    }

    pub fn op_closure(&mut self, target: Operand, function: &str) {
        self.opcode(Opcode::Closure).operand(target).atom(function);
    }

    pub fn op_capture(&mut self, closure: Operand, index: u32, source: Operand) {
        self.opcode(Opcode::Capture)
            .operand(closure)
            .uint(index)
            .operand(source);
    }

    pub fn op_capturecopy(&mut self, closure: Operand, index: u32, source: Operand) {
        self.opcode(Opcode::Capturecopy)
            .operand(closure)
            .uint(index)
            .operand(source);
    }

    pub fn op_capturemove(&mut self, closure: Operand, index: u32, source: Operand) {
        self.opcode(Opcode::Capturemove)
            .operand(closure)
            .uint(index)
            .operand(source);
    }

    pub fn op_function(&mut self, target: Operand, name: &str) {
        self.opcode(Opcode::Function).operand(target).atom(name);
    }

    pub fn op_frame(&mut self, arguments: u32, locals: u32) {
        self.opcode(Opcode::Frame).uint(arguments).uint(locals);
    }

    pub fn op_param(&mut self, slot: u32, source: Operand) {
        self.opcode(Opcode::Param).operand(current(slot)).operand(source);
    }

    pub fn op_pamv(&mut self, slot: u32, source: Operand) {
        self.opcode(Opcode::Pamv).operand(current(slot)).operand(source);
    }

    pub fn op_arg(&mut self, target: Operand, slot: u32) {
        self.opcode(Opcode::Arg).operand(target).operand(current(slot));
    }

    pub fn op_argc(&mut self, target: Operand) {
        self.opcode(Opcode::Argc).operand(target);
    }

    pub fn op_call(&mut self, target: Operand, callable: Callable) {
        self.opcode(Opcode::Call).operand(target).callable(callable);
    }

    pub fn op_tailcall(&mut self, callable: Callable) {
        self.opcode(Opcode::Tailcall).callable(callable);
    }

    pub fn op_defer(&mut self, callable: Callable) {
        self.opcode(Opcode::Defer).callable(callable);
    }

    pub fn op_return(&mut self) {
        self.opcode(Opcode::Return);
    }

    pub fn op_process(&mut self, target: Operand, function: &str) {
        self.opcode(Opcode::Process).operand(target).atom(function);
    }

    pub fn op_self(&mut self, target: Operand) {
        self.opcode(Opcode::Self_).operand(target);
    }

    pub fn op_join(&mut self, target: Operand, handle: Operand, timeout: Timeout) {
        self.opcode(Opcode::Join)
            .operand(target)
            .operand(handle)
            .timeout(timeout);
    }

    pub fn op_send(&mut self, handle: Operand, source: Operand) {
        self.opcode(Opcode::Send).operand(handle).operand(source);
    }

    pub fn op_receive(&mut self, target: Operand, timeout: Timeout) {
        self.opcode(Opcode::Receive).operand(target).timeout(timeout);
    }

    pub fn op_watchdog(&mut self, function: &str) {
        self.opcode(Opcode::Watchdog).atom(function);
    }

    pub fn op_jump(&mut self, label: &str) {
        self.opcode(Opcode::Jump).label_ref(label);
    }

    pub fn op_if(&mut self, condition: Operand, if_true: &str, if_false: &str) {
        self.opcode(Opcode::If)
            .operand(condition)
            .label_ref(if_true)
            .label_ref(if_false);
    }

    pub fn op_try(&mut self) {
        self.opcode(Opcode::Try);
    }

    pub fn op_catch(&mut self, type_name: &str, block: &str) {
        self.opcode(Opcode::Catch).atom(type_name).atom(block);
    }

    pub fn op_enter(&mut self, block: &str) {
        self.opcode(Opcode::Enter).atom(block);
    }

    pub fn op_draw(&mut self, target: Operand) {
        self.opcode(Opcode::Draw).operand(target);
    }

    pub fn op_leave(&mut self) {
        self.opcode(Opcode::Leave);
    }

    pub fn op_throw(&mut self, source: Operand) {
        self.opcode(Opcode::Throw).operand(source);
    }

    pub fn op_import(&mut self, module: &str) {
        self.opcode(Opcode::Import).atom(module);
    }

    pub fn op_class(&mut self, target: Operand, name: &str) {
        self.opcode(Opcode::Class).operand(target).atom(name);
    }

    pub fn op_derive(&mut self, target: Operand, ancestor: &str) {
        self.opcode(Opcode::Derive).operand(target).atom(ancestor);
    }

    pub fn op_attach(&mut self, target: Operand, function: &str, method: &str) {
        self.opcode(Opcode::Attach)
            .operand(target)
            .atom(function)
            .atom(method);
    }

    pub fn op_register(&mut self, target: Operand) {
        self.opcode(Opcode::Register).operand(target);
    }

    pub fn op_new(&mut self, target: Operand, class: &str) {
        self.opcode(Opcode::New).operand(target).atom(class);
    }

    pub fn op_msg(&mut self, target: Operand, method: &str) {
        self.opcode(Opcode::Msg).operand(target).atom(method);
    }

    pub fn op_insert(&mut self, object: Operand, key: Operand, value: Operand) {
        self.op_binary(Opcode::Insert, object, key, value);
    }

    pub fn op_remove(&mut self, target: Operand, object: Operand, key: Operand) {
        self.op_binary(Opcode::Remove, target, object, key);
    }

    pub fn op_halt(&mut self) {
        self.opcode(Opcode::Halt);
    }
}

/// Collects function and block bodies and links them into an [Image].
pub struct ProgramBuilder {
    meta: Map<String, String>,
    functions: Vec<BodyBuilder>,
    blocks: Vec<BodyBuilder>,
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramBuilder {
    pub fn new() -> ProgramBuilder {
        ProgramBuilder {
            meta: Map::new(),
            functions: Vec::new(),
            blocks: Vec::new(),
        }
    }

    pub fn meta(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.meta.insert(key.into(), value.into());
    }

    pub fn add_function(&mut self, body: BodyBuilder) {
        self.functions.push(body);
    }

    pub fn add_block(&mut self, body: BodyBuilder) {
        self.blocks.push(body);
    }

    /// Lay out all bodies into one bytecode blob, patch label references
    /// to module-absolute offsets, and record patch positions in the
    /// jump table.
    ///
    /// Panics on a reference to an undefined label; that is a bug in the
    /// program being built, not a runtime condition.
    pub fn link(self, kind: ImageKind) -> Image {
        let mut image = Image::new(kind);
        for (key, value) in self.meta {
            image.set_meta(key, value);
        }

        let mut code: Vec<u8> = Vec::new();
        for (body, is_block) in self
            .functions
            .into_iter()
            .map(|b| (b, false))
            .chain(self.blocks.into_iter().map(|b| (b, true)))
        {
            let base = code.len() as u64;
            if is_block {
                image.add_block(body.name.clone(), base);
            } else {
                image.add_function(body.name.clone(), base);
            }
            let BodyBuilder {
                name,
                code: mut body_code,
                labels,
                fixups,
            } = body;
            for (position, label) in fixups {
                let local = *labels
                    .get(&label)
                    .unwrap_or_else(|| panic!("undefined label {:?} in {}", label, name));
                let absolute = base + local as u64;
                body_code[position..position + 8].copy_from_slice(&absolute.to_le_bytes());
                image.add_jump(base + position as u64);
            }
            code.extend_from_slice(&body_code);
        }
        image.set_bytecode(code);
        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::codec::Decoder;
    use crate::bytecode::image::ImageKind;

    #[test]
    fn emitted_operands_decode_back() {
        let mut body = BodyBuilder::new("main/0");
        body.op_integer(local(1), -9);
        body.op_add(local(2), local(1), global(3));
        body.op_call(void(), Callable::Name("helper/0"));
        body.op_receive(local(4), Timeout::Ms(500));

        let mut program = ProgramBuilder::new();
        program.add_function(body);
        let image = program.link(ImageKind::Executable);

        let mut decoder = Decoder::new(image.bytecode(), 0);
        assert_eq!(decoder.fetch_opcode().unwrap(), Opcode::Integer);
        let target = decoder.fetch_register_index().unwrap();
        assert_eq!((target.index, target.rs), (1, RsSel::Local));
        assert_eq!(decoder.fetch_primitive_int().unwrap(), -9);

        assert_eq!(decoder.fetch_opcode().unwrap(), Opcode::Add);
        decoder.fetch_register_index().unwrap();
        decoder.fetch_register_index().unwrap();
        let rhs = decoder.fetch_register_index().unwrap();
        assert_eq!(rhs.rs, RsSel::Global);

        assert_eq!(decoder.fetch_opcode().unwrap(), Opcode::Call);
        assert!(decoder.is_void());
        decoder.fetch_void().unwrap();
        assert!(decoder.is_literal());
        assert_eq!(decoder.fetch_atom().unwrap(), "helper/0");

        assert_eq!(decoder.fetch_opcode().unwrap(), Opcode::Receive);
        decoder.fetch_register_index().unwrap();
        assert_eq!(decoder.fetch_timeout().unwrap(), Timeout::Ms(500));
    }

    #[test]
    fn labels_resolve_to_module_absolute_offsets() {
        let mut first = BodyBuilder::new("first/0");
        first.op_return();

        let mut second = BodyBuilder::new("second/0");
        second.label("top");
        second.op_nop();
        second.op_jump("top");

        let mut program = ProgramBuilder::new();
        program.add_function(first);
        program.add_function(second);
        let image = program.link(ImageKind::Executable);

        let second_base = image.functions()["second/0"] as usize;
        // skip the nop and the jump opcode byte, then read the target
        let mut decoder = Decoder::new(image.bytecode(), second_base + 2);
        assert_eq!(decoder.fetch_address().unwrap(), second_base);
        // the patched position is recorded for relocation
        assert_eq!(image.jump_table(), &[(second_base + 2) as u64]);
    }

    #[test]
    #[should_panic(expected = "undefined label")]
    fn undefined_labels_are_rejected_at_link_time() {
        let mut body = BodyBuilder::new("broken/0");
        body.op_jump("nowhere");
        let mut program = ProgramBuilder::new();
        program.add_function(body);
        program.link(ImageKind::Executable);
    }
}
