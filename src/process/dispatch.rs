//! The big dispatch: one opcode in, one handler out.

use crate::bytecode::{Decoder, Opcode};
use crate::fault::Trap;

use super::{arith, bits, calls, classes, closures, concurrency, containers, control, slots, text};
use super::Process;

pub(super) fn execute(
    proc: &mut Process,
    opcode: Opcode,
    dec: &mut Decoder,
) -> Result<usize, Trap> {
    use Opcode::*;

    match opcode {
        Nop => control::op_nop(proc, dec),

        Izero => arith::op_izero(proc, dec),
        Integer => arith::op_integer(proc, dec),
        Iinc => arith::op_iinc(proc, dec),
        Idec => arith::op_idec(proc, dec),
        Float => arith::op_float(proc, dec),

        Add | Sub | Mul | Div | Wrapadd | Wrapsub | Wrapmul | Wrapdiv => {
            arith::op_arith(proc, dec, opcode)
        }
        Checkedsadd | Checkedssub | Checkedsmul | Checkedsdiv => {
            arith::op_checked_signed(proc, dec, opcode)
        }
        Checkeduadd | Checkedusub | Checkedumul | Checkedudiv => {
            arith::op_checked_unsigned(proc, dec, opcode)
        }
        Saturatingsadd | Saturatingssub | Saturatingsmul | Saturatingsdiv => {
            arith::op_saturating_signed(proc, dec, opcode)
        }
        Saturatinguadd | Saturatingusub | Saturatingumul | Saturatingudiv => {
            arith::op_saturating_unsigned(proc, dec, opcode)
        }

        Lt | Lte | Gt | Gte => arith::op_compare(proc, dec, opcode),
        Eq => arith::op_eq(proc, dec),
        Not => arith::op_not(proc, dec),
        And => arith::op_and(proc, dec),
        Or => arith::op_or(proc, dec),

        String => text::op_string(proc, dec),
        Text => text::op_text(proc, dec),
        Texteq => text::op_texteq(proc, dec),
        Textat => text::op_textat(proc, dec),
        Textsub => text::op_textsub(proc, dec),
        Textlength => text::op_textlength(proc, dec),
        Textcommonprefix => text::op_textcommonprefix(proc, dec),
        Textcommonsuffix => text::op_textcommonsuffix(proc, dec),
        Textconcat => text::op_textconcat(proc, dec),
        Atom => text::op_atom(proc, dec),
        Atomeq => text::op_atomeq(proc, dec),

        Bits => bits::op_bits(proc, dec),
        Bitand | Bitor | Bitxor => bits::op_bit_binop(proc, dec, opcode),
        Bitnot => bits::op_bitnot(proc, dec),
        Bitat => bits::op_bitat(proc, dec),
        Bitset => bits::op_bitset(proc, dec),
        Shl | Shr | Ashl | Ashr | Rol | Ror => bits::op_shift(proc, dec, opcode),

        Move => slots::op_move(proc, dec),
        Copy => slots::op_copy(proc, dec),
        Ptr => slots::op_ptr(proc, dec),
        Swap => slots::op_swap(proc, dec),
        Delete => slots::op_delete(proc, dec),
        Isnull => slots::op_isnull(proc, dec),
        Ress => slots::op_ress(proc, dec),

        Vector => containers::op_vector(proc, dec),
        Vinsert => containers::op_vinsert(proc, dec),
        Vpush => containers::op_vpush(proc, dec),
        Vpop => containers::op_vpop(proc, dec),
        Vat => containers::op_vat(proc, dec),
        Vlen => containers::op_vlen(proc, dec),
        Struct => containers::op_struct(proc, dec),
        Structinsert => containers::op_structinsert(proc, dec),
        Structremove => containers::op_structremove(proc, dec),
        Structkeys => containers::op_structkeys(proc, dec),

        Closure => closures::op_closure(proc, dec),
        Capture => closures::op_capture(proc, dec),
        Capturecopy => closures::op_capturecopy(proc, dec),
        Capturemove => closures::op_capturemove(proc, dec),
        Function => closures::op_function(proc, dec),

        Frame => calls::op_frame(proc, dec),
        Param => calls::op_param(proc, dec),
        Pamv => calls::op_pamv(proc, dec),
        Arg => calls::op_arg(proc, dec),
        Argc => calls::op_argc(proc, dec),
        Call => calls::op_call(proc, dec),
        Tailcall => calls::op_tailcall(proc, dec),
        Defer => calls::op_defer(proc, dec),
        Return => calls::op_return(proc, dec),

        Process => concurrency::op_process(proc, dec),
        Self_ => concurrency::op_self(proc, dec),
        Join => concurrency::op_join(proc, dec),
        Send => concurrency::op_send(proc, dec),
        Receive => concurrency::op_receive(proc, dec),
        Watchdog => concurrency::op_watchdog(proc, dec),

        Jump => control::op_jump(proc, dec),
        If => control::op_if(proc, dec),
        Try => control::op_try(proc, dec),
        Catch => control::op_catch(proc, dec),
        Enter => control::op_enter(proc, dec),
        Draw => control::op_draw(proc, dec),
        Leave => control::op_leave(proc, dec),
        Throw => control::op_throw(proc, dec),

        Import => classes::op_import(proc, dec),
        Class => classes::op_class(proc, dec),
        Derive => classes::op_derive(proc, dec),
        Attach => classes::op_attach(proc, dec),
        Register => classes::op_register(proc, dec),
        New => classes::op_new(proc, dec),
        Msg => classes::op_msg(proc, dec),
        Insert => classes::op_insert(proc, dec),
        Remove => classes::op_remove(proc, dec),

        Halt => control::op_halt(proc, dec),
    }
}
