//! The opcode inventory.
//!
//! One byte of opcode, followed by typed operands; see
//! [codec](super::codec) for operand encodings.

use derive_more::Display;

/// Instruction tags, one byte each.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display, derive_more::TryFrom)]
#[try_from(repr)]
#[repr(u8)]
pub enum Opcode {
    #[display("nop")]
    Nop = 0,

    // literal loads and integer steps
    #[display("izero")]
    Izero,
    #[display("integer")]
    Integer,
    #[display("iinc")]
    Iinc,
    #[display("idec")]
    Idec,
    #[display("float")]
    Float,

    // arithmetic; overflow policy is encoded in the variant
    #[display("add")]
    Add,
    #[display("sub")]
    Sub,
    #[display("mul")]
    Mul,
    #[display("div")]
    Div,
    #[display("wrapadd")]
    Wrapadd,
    #[display("wrapsub")]
    Wrapsub,
    #[display("wrapmul")]
    Wrapmul,
    #[display("wrapdiv")]
    Wrapdiv,
    #[display("checkedsadd")]
    Checkedsadd,
    #[display("checkedssub")]
    Checkedssub,
    #[display("checkedsmul")]
    Checkedsmul,
    #[display("checkedsdiv")]
    Checkedsdiv,
    #[display("checkeduadd")]
    Checkeduadd,
    #[display("checkedusub")]
    Checkedusub,
    #[display("checkedumul")]
    Checkedumul,
    #[display("checkedudiv")]
    Checkedudiv,
    #[display("saturatingsadd")]
    Saturatingsadd,
    #[display("saturatingssub")]
    Saturatingssub,
    #[display("saturatingsmul")]
    Saturatingsmul,
    #[display("saturatingsdiv")]
    Saturatingsdiv,
    #[display("saturatinguadd")]
    Saturatinguadd,
    #[display("saturatingusub")]
    Saturatingusub,
    #[display("saturatingumul")]
    Saturatingumul,
    #[display("saturatingudiv")]
    Saturatingudiv,

    // comparisons
    #[display("lt")]
    Lt,
    #[display("lte")]
    Lte,
    #[display("gt")]
    Gt,
    #[display("gte")]
    Gte,
    #[display("eq")]
    Eq,

    // boolean logic
    #[display("not")]
    Not,
    #[display("and")]
    And,
    #[display("or")]
    Or,

    // text and legacy strings
    #[display("string")]
    String,
    #[display("text")]
    Text,
    #[display("texteq")]
    Texteq,
    #[display("textat")]
    Textat,
    #[display("textsub")]
    Textsub,
    #[display("textlength")]
    Textlength,
    #[display("textcommonprefix")]
    Textcommonprefix,
    #[display("textcommonsuffix")]
    Textcommonsuffix,
    #[display("textconcat")]
    Textconcat,

    // atoms
    #[display("atom")]
    Atom,
    #[display("atomeq")]
    Atomeq,

    // bit strings
    #[display("bits")]
    Bits,
    #[display("bitand")]
    Bitand,
    #[display("bitor")]
    Bitor,
    #[display("bitxor")]
    Bitxor,
    #[display("bitnot")]
    Bitnot,
    #[display("bitat")]
    Bitat,
    #[display("bitset")]
    Bitset,
    #[display("shl")]
    Shl,
    #[display("shr")]
    Shr,
    #[display("ashl")]
    Ashl,
    #[display("ashr")]
    Ashr,
    #[display("rol")]
    Rol,
    #[display("ror")]
    Ror,

    // moves and slot lifecycle
    #[display("move")]
    Move,
    #[display("copy")]
    Copy,
    #[display("ptr")]
    Ptr,
    #[display("swap")]
    Swap,
    #[display("delete")]
    Delete,
    #[display("isnull")]
    Isnull,
    #[display("ress")]
    Ress,

    // containers
    #[display("vector")]
    Vector,
    #[display("vinsert")]
    Vinsert,
    #[display("vpush")]
    Vpush,
    #[display("vpop")]
    Vpop,
    #[display("vat")]
    Vat,
    #[display("vlen")]
    Vlen,
    #[display("struct")]
    Struct,
    #[display("structinsert")]
    Structinsert,
    #[display("structremove")]
    Structremove,
    #[display("structkeys")]
    Structkeys,

    // closures and callables
    #[display("closure")]
    Closure,
    #[display("capture")]
    Capture,
    #[display("capturecopy")]
    Capturecopy,
    #[display("capturemove")]
    Capturemove,
    #[display("function")]
    Function,

    // calls
    #[display("frame")]
    Frame,
    #[display("param")]
    Param,
    #[display("pamv")]
    Pamv,
    #[display("arg")]
    Arg,
    #[display("argc")]
    Argc,
    #[display("call")]
    Call,
    #[display("tailcall")]
    Tailcall,
    #[display("defer")]
    Defer,
    #[display("return")]
    Return,

    // processes and messaging
    #[display("process")]
    Process,
    #[display("self")]
    Self_,
    #[display("join")]
    Join,
    #[display("send")]
    Send,
    #[display("receive")]
    Receive,
    #[display("watchdog")]
    Watchdog,

    // control flow
    #[display("jump")]
    Jump,
    #[display("if")]
    If,
    #[display("try")]
    Try,
    #[display("catch")]
    Catch,
    #[display("enter")]
    Enter,
    #[display("draw")]
    Draw,
    #[display("leave")]
    Leave,
    #[display("throw")]
    Throw,

    // linking, classes and objects
    #[display("import")]
    Import,
    #[display("class")]
    Class,
    #[display("derive")]
    Derive,
    #[display("attach")]
    Attach,
    #[display("register")]
    Register,
    #[display("new")]
    New,
    #[display("msg")]
    Msg,
    #[display("insert")]
    Insert,
    #[display("remove")]
    Remove,

    #[display("halt")]
    Halt,
}
