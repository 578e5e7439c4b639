//! End-to-end machine runs: emitted programs executed by the full
//! kernel with real scheduler threads.

use std::sync::Arc;

use viua::bytecode::codec::Timeout;
use viua::bytecode::emit::{
    current, deref, indirect, local, void, BodyBuilder, Callable, ProgramBuilder,
};
use viua::bytecode::image::ImageKind;
use viua::bytecode::Opcode;
use viua::ffi::{foreign, PathLinker};
use viua::kernel::{Config, ExitStatus, Kernel};
use viua::value::Value;

fn run_with(program: ProgramBuilder, configure: impl FnOnce(&Arc<Kernel>)) -> ExitStatus {
    let kernel = Kernel::new(Config {
        vp_schedulers: 2,
        ffi_schedulers: 1,
    });
    kernel.load_image(program.link(ImageKind::Executable));
    configure(&kernel);
    kernel.launch_main(vec!["test".into()]).unwrap();
    kernel.run()
}

fn run(program: ProgramBuilder) -> ExitStatus {
    run_with(program, |_| {})
}

#[test]
fn factorial_of_five_exits_120() {
    let mut fact = BodyBuilder::new("fact/1");
    fact.op_arg(local(1), 0);
    fact.op_izero(local(2));
    fact.op_eq(local(3), local(1), local(2));
    fact.op_if(local(3), "base", "recurse");
    fact.label("recurse");
    fact.op_integer(local(4), 1);
    fact.op_binary(Opcode::Sub, local(5), local(1), local(4));
    fact.op_frame(1, 8);
    fact.op_pamv(0, local(5));
    fact.op_call(local(6), Callable::Name("fact/1"));
    fact.op_mul(local(0), local(1), local(6));
    fact.op_return();
    fact.label("base");
    fact.op_integer(local(0), 1);
    fact.op_return();

    let mut main = BodyBuilder::new("main/0");
    main.op_integer(local(1), 5);
    main.op_frame(1, 8);
    main.op_pamv(0, local(1));
    main.op_call(local(2), Callable::Name("fact/1"));
    main.op_move(local(0), local(2));
    main.op_return();

    let mut program = ProgramBuilder::new();
    program.add_function(fact);
    program.add_function(main);
    assert_eq!(run(program).code, 120);
}

#[test]
fn message_ping_pong_exits_42() {
    let mut child = BodyBuilder::new("child/0");
    child.op_receive(local(1), Timeout::Infinite);
    child.op_receive(local(2), Timeout::Infinite);
    child.op_iinc(local(2));
    child.op_send(local(1), local(2));
    child.op_return();

    let mut main = BodyBuilder::new("main/0");
    main.op_frame(0, 8);
    main.op_process(local(1), "child/0");
    main.op_self(local(2));
    main.op_send(local(1), local(2));
    main.op_integer(local(3), 41);
    main.op_send(local(1), local(3));
    main.op_receive(local(4), Timeout::Infinite);
    main.op_join(void(), local(1), Timeout::Infinite);
    main.op_move(local(0), local(4));
    main.op_return();

    let mut program = ProgramBuilder::new();
    program.add_function(child);
    program.add_function(main);
    assert_eq!(run(program).code, 42);
}

#[test]
fn uncaught_exception_exits_1_and_reports_the_message() {
    let mut main = BodyBuilder::new("main/0");
    main.op_text(local(1), "boom");
    main.op_throw(local(1));

    let mut program = ProgramBuilder::new();
    program.add_function(main);
    let status = run(program);
    assert_eq!(status.code, 1);
    let exception = status.exception.expect("terminating exception reported");
    assert!(exception.str().contains("boom"));
}

#[test]
fn derived_exceptions_match_base_class_catchers() {
    let mut main = BodyBuilder::new("main/0");
    main.op_class(local(1), "BaseError");
    main.op_register(local(1));
    main.op_class(local(2), "DerivedError");
    main.op_derive(local(2), "BaseError");
    main.op_register(local(2));
    main.op_try();
    main.op_catch("BaseError", "handlers::base");
    main.op_enter("attempt");
    main.op_izero(local(0));
    main.op_return();

    let mut attempt = BodyBuilder::new("attempt");
    attempt.op_new(local(3), "DerivedError");
    attempt.op_throw(local(3));
    attempt.op_leave();

    let mut handler = BodyBuilder::new("handlers::base");
    handler.op_draw(local(4));
    handler.op_leave();

    let mut program = ProgramBuilder::new();
    program.add_function(main);
    program.add_block(attempt);
    program.add_block(handler);
    assert_eq!(run(program).code, 0);
}

#[test]
fn deferred_calls_run_during_unwind_before_the_handler() {
    let mut cleanup = BodyBuilder::new("cleanup/0");
    cleanup.op_self(local(1));
    cleanup.op_atom(local(2), "cleanup");
    cleanup.op_send(local(1), local(2));
    cleanup.op_return();

    let mut inner = BodyBuilder::new("inner/0");
    inner.op_frame(0, 4);
    inner.op_defer(Callable::Name("cleanup/0"));
    inner.op_text(local(1), "kaboom");
    inner.op_throw(local(1));

    let mut attempt = BodyBuilder::new("attempt");
    attempt.op_frame(0, 8);
    attempt.op_call(void(), Callable::Name("inner/0"));
    attempt.op_leave();

    let mut handler = BodyBuilder::new("catcher");
    handler.op_self(local(5));
    handler.op_atom(local(6), "handler");
    handler.op_send(local(5), local(6));
    handler.op_draw(local(7));
    handler.op_leave();

    let mut main = BodyBuilder::new("main/0");
    main.op_try();
    main.op_catch("Text", "catcher");
    main.op_enter("attempt");
    // the mailbox must now hold 'cleanup' then 'handler', in that order
    main.op_receive(local(1), Timeout::Ms(2000));
    main.op_receive(local(2), Timeout::Ms(2000));
    main.op_atom(local(3), "cleanup");
    main.op_atomeq(local(4), local(1), local(3));
    main.op_if(local(4), "first_ok", "bad");
    main.label("bad");
    main.op_text(local(8), "cleanup did not run before the handler");
    main.op_throw(local(8));
    main.label("first_ok");
    main.op_atom(local(3), "handler");
    main.op_atomeq(local(4), local(2), local(3));
    main.op_if(local(4), "done", "bad");
    main.label("done");
    main.op_izero(local(0));
    main.op_return();

    let mut program = ProgramBuilder::new();
    program.add_function(cleanup);
    program.add_function(inner);
    program.add_function(main);
    program.add_block(attempt);
    program.add_block(handler);
    assert_eq!(run(program).code, 0);
}

#[test]
fn receive_timeout_raises_and_terminates() {
    let mut main = BodyBuilder::new("main/0");
    main.op_receive(local(1), Timeout::Ms(500));
    main.op_izero(local(0));
    main.op_return();

    let mut program = ProgramBuilder::new();
    program.add_function(main);
    let status = run(program);
    assert_eq!(status.code, 1);
    let exception = status.exception.expect("terminating exception reported");
    assert_eq!(exception.type_name(), "TimeoutError");
}

#[test]
fn checked_add_overflow_raises_arithmetic_error() {
    let mut main = BodyBuilder::new("main/0");
    main.op_integer(local(1), i64::MAX);
    main.op_integer(local(2), 1);
    main.op_binary(Opcode::Checkedsadd, local(3), local(1), local(2));
    main.op_izero(local(0));
    main.op_return();

    let mut program = ProgramBuilder::new();
    program.add_function(main);
    let status = run(program);
    assert_eq!(status.code, 1);
    assert_eq!(
        status.exception.expect("exception reported").type_name(),
        "ArithmeticError"
    );
}

#[test]
fn wrapping_and_saturating_arithmetic_hit_the_extremes() {
    let mut main = BodyBuilder::new("main/0");
    main.op_integer(local(1), i64::MAX);
    main.op_integer(local(2), 1);
    main.op_binary(Opcode::Wrapadd, local(3), local(1), local(2));
    main.op_integer(local(4), i64::MIN);
    main.op_eq(local(5), local(3), local(4));
    main.op_if(local(5), "wrapped", "bad");
    main.label("bad");
    main.op_text(local(9), "arithmetic extremes are off");
    main.op_throw(local(9));
    main.label("wrapped");
    main.op_binary(Opcode::Saturatingsadd, local(6), local(1), local(2));
    main.op_eq(local(7), local(6), local(1));
    main.op_if(local(7), "done", "bad");
    main.label("done");
    main.op_izero(local(0));
    main.op_return();

    let mut program = ProgramBuilder::new();
    program.add_function(main);
    assert_eq!(run(program).code, 0);
}

#[test]
fn captured_registers_are_shared_with_the_closure() {
    let mut adder = BodyBuilder::new("adder/0");
    adder.op_iinc(local(1));
    adder.op_return();

    let mut main = BodyBuilder::new("main/0");
    main.op_integer(local(1), 10);
    main.op_closure(local(2), "adder/0");
    main.op_capture(local(2), 1, local(1));
    main.op_frame(0, 1);
    main.op_call(void(), Callable::Register(local(2)));
    main.op_frame(0, 1);
    main.op_call(void(), Callable::Register(local(2)));
    // the captured cell is shared: main's register saw both increments
    main.op_izero(local(3));
    main.op_add(local(0), local(1), local(3));
    main.op_return();

    let mut program = ProgramBuilder::new();
    program.add_function(adder);
    program.add_function(main);
    assert_eq!(run(program).code, 12);
}

#[test]
fn static_registers_persist_across_calls() {
    let mut counter = BodyBuilder::new("counter/0");
    counter.op_ress(2);
    counter.op_isnull(current(2), current(1));
    counter.op_if(current(2), "init", "bump");
    counter.label("init");
    counter.op_izero(current(1));
    counter.label("bump");
    counter.op_iinc(current(1));
    counter.op_copy(local(0), current(1));
    counter.op_ress(1);
    counter.op_return();

    let mut main = BodyBuilder::new("main/0");
    for result in [1u32, 2, 3] {
        main.op_frame(0, 2);
        main.op_call(local(result), Callable::Name("counter/0"));
    }
    main.op_move(local(0), local(3));
    main.op_return();

    let mut program = ProgramBuilder::new();
    program.add_function(counter);
    program.add_function(main);
    assert_eq!(run(program).code, 3);
}

#[test]
fn isnull_tolerates_empty_static_slots() {
    let mut main = BodyBuilder::new("main/0");
    main.op_ress(2);
    main.op_isnull(current(1), current(2));
    main.op_ress(1);
    main.op_izero(local(0));
    main.op_return();

    let mut program = ProgramBuilder::new();
    program.add_function(main);
    assert_eq!(run(program).code, 0);
}

#[test]
fn foreign_calls_round_trip_through_the_ffi_scheduler() {
    let mut main = BodyBuilder::new("main/0");
    main.op_integer(local(1), 3);
    main.op_frame(1, 1);
    main.op_pamv(0, local(1));
    main.op_call(local(2), Callable::Name("host::triple/1"));
    main.op_move(local(0), local(2));
    main.op_return();

    let mut program = ProgramBuilder::new();
    program.add_function(main);
    let status = run_with(program, |kernel| {
        kernel.register_foreign_function(
            "host::triple/1",
            foreign(|frame, _statics, _globals| {
                let argument = frame
                    .arguments
                    .get(0)
                    .and_then(|v| v.as_integer())
                    .map_err(|fault| fault.into_value())?;
                frame
                    .local_register_set
                    .set(0, Value::Integer(argument * 3))
                    .map_err(|fault| fault.into_value())?;
                Ok(())
            }),
        );
    });
    assert_eq!(status.code, 9);
}

#[test]
fn a_watchdog_takes_over_a_dying_process() {
    let mut guard = BodyBuilder::new("guard/1");
    guard.op_arg(local(1), 0);
    guard.op_integer(local(0), 7);
    guard.op_return();

    let mut main = BodyBuilder::new("main/0");
    main.op_watchdog("guard/1");
    main.op_text(local(1), "die");
    main.op_throw(local(1));

    let mut program = ProgramBuilder::new();
    program.add_function(guard);
    program.add_function(main);
    assert_eq!(run(program).code, 7);
}

#[test]
fn runaway_recursion_overflows_the_stack() {
    let mut overflow = BodyBuilder::new("overflow/0");
    overflow.op_frame(0, 1);
    overflow.op_call(void(), Callable::Name("overflow/0"));
    overflow.op_return();

    let mut main = BodyBuilder::new("main/0");
    main.op_frame(0, 1);
    main.op_call(void(), Callable::Name("overflow/0"));
    main.op_izero(local(0));
    main.op_return();

    let mut program = ProgramBuilder::new();
    program.add_function(overflow);
    program.add_function(main);
    let status = run(program);
    assert_eq!(status.code, 1);
    assert_eq!(
        status.exception.expect("exception reported").type_name(),
        "StackOverflow"
    );
}

#[test]
fn move_send_empties_the_register_and_delivers_the_value() {
    let mut main = BodyBuilder::new("main/0");
    main.op_self(local(5));
    main.op_integer(local(1), 41);
    main.op_send(local(5), local(1));
    main.op_isnull(local(2), local(1));
    main.op_if(local(2), "emptied", "bad");
    main.label("bad");
    main.op_text(local(6), "sender register still holds the payload");
    main.op_throw(local(6));
    main.label("emptied");
    main.op_receive(local(3), Timeout::Infinite);
    main.op_iinc(local(3));
    main.op_move(local(0), local(3));
    main.op_return();

    let mut program = ProgramBuilder::new();
    program.add_function(main);
    assert_eq!(run(program).code, 42);
}

#[test]
fn vectors_and_structs_move_their_elements() {
    let mut main = BodyBuilder::new("main/0");
    main.op_integer(local(1), 1);
    main.op_integer(local(2), 2);
    main.op_integer(local(3), 3);
    main.op_vector(local(4), local(1), 3);
    main.op_vlen(local(5), local(4));
    main.op_vpop(local(6), local(4), void());
    main.op_integer(local(8), 0);
    main.op_vat(local(7), local(4), local(8));
    main.op_add(local(9), local(6), local(7));
    main.op_struct(local(10));
    main.op_atom(local(11), "answer");
    main.op_structinsert(local(10), local(11), local(9));
    main.op_structremove(local(12), local(10), local(11));
    main.op_move(local(0), local(12));
    main.op_return();

    let mut program = ProgramBuilder::new();
    program.add_function(main);
    // vlen 3, vpop takes the 3, vat copies the 1: exit 3 + 1 = 4
    assert_eq!(run(program).code, 4);
}

#[test]
fn pointers_and_register_references_resolve() {
    let mut main = BodyBuilder::new("main/0");
    main.op_integer(local(1), 5);
    main.op_ptr(local(2), local(1));
    main.op_iinc(deref(2));
    main.op_integer(local(3), 1);
    main.op_copy(local(4), indirect(3));
    main.op_izero(local(5));
    main.op_add(local(0), local(4), local(5));
    main.op_return();

    let mut program = ProgramBuilder::new();
    program.add_function(main);
    assert_eq!(run(program).code, 6);
}

#[test]
fn a_jump_to_itself_is_detected_as_an_infinite_loop() {
    let mut main = BodyBuilder::new("main/0");
    main.label("here");
    main.op_jump("here");

    let mut program = ProgramBuilder::new();
    program.add_function(main);
    let status = run(program);
    assert_eq!(status.code, 1);
    assert_eq!(
        status.exception.expect("exception reported").type_name(),
        "InstructionUnchanged"
    );
}

#[test]
fn import_links_modules_from_search_paths() {
    let mut five = BodyBuilder::new("mathmod::five/0");
    five.op_integer(local(0), 5);
    five.op_return();
    let mut module = ProgramBuilder::new();
    module.add_function(five);
    let image = module.link(ImageKind::Linkable);

    let dir = std::env::temp_dir().join(format!("viua-import-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    image.store_file(dir.join("mathmod.viua")).unwrap();

    let mut main = BodyBuilder::new("main/0");
    main.op_import("mathmod");
    main.op_frame(0, 1);
    main.op_call(local(1), Callable::Name("mathmod::five/0"));
    main.op_move(local(0), local(1));
    main.op_return();

    let mut program = ProgramBuilder::new();
    program.add_function(main);
    let linker_dir = dir.clone();
    let status = run_with(program, move |kernel| {
        kernel.set_linker(Box::new(PathLinker::new(vec![linker_dir])));
    });
    std::fs::remove_dir_all(&dir).ok();
    assert_eq!(status.code, 5);
}

#[test]
fn tail_calls_reuse_the_frame() {
    // loop/2-style countdown via tailcall: no stack growth
    let mut countdown = BodyBuilder::new("countdown/1");
    countdown.op_arg(local(1), 0);
    countdown.op_izero(local(2));
    countdown.op_eq(local(3), local(1), local(2));
    countdown.op_if(local(3), "base", "step");
    countdown.label("step");
    countdown.op_idec(local(1));
    countdown.op_frame(1, 8);
    countdown.op_pamv(0, local(1));
    countdown.op_tailcall(Callable::Name("countdown/1"));
    countdown.label("base");
    countdown.op_integer(local(0), 64);
    countdown.op_return();

    let mut main = BodyBuilder::new("main/0");
    main.op_integer(local(1), 50_000);
    main.op_frame(1, 8);
    main.op_pamv(0, local(1));
    main.op_call(local(2), Callable::Name("countdown/1"));
    main.op_move(local(0), local(2));
    main.op_return();

    let mut program = ProgramBuilder::new();
    program.add_function(countdown);
    program.add_function(main);
    // 50k recursion depth only terminates if the frame is reused
    assert_eq!(run(program).code, 64);
}

#[test]
fn message_dispatch_resolves_through_the_class_registry() {
    let mut answer = BodyBuilder::new("impl::answer/1");
    answer.op_integer(local(0), 21);
    answer.op_return();

    let mut main = BodyBuilder::new("main/0");
    main.op_class(local(1), "Greeter");
    main.op_attach(local(1), "impl::answer/1", "answer/1");
    main.op_register(local(1));
    main.op_new(local(2), "Greeter");
    main.op_frame(1, 4);
    main.op_param(0, local(2));
    main.op_msg(local(3), "answer/1");
    main.op_move(local(0), local(3));
    main.op_return();

    let mut program = ProgramBuilder::new();
    program.add_function(answer);
    program.add_function(main);
    assert_eq!(run(program).code, 21);
}

#[test]
fn text_instructions_operate_on_code_points() {
    let mut main = BodyBuilder::new("main/0");
    main.op_text(local(1), "hello world");
    main.op_integer(local(2), 0);
    main.op_integer(local(3), 5);
    main.op_textsub(local(4), local(1), local(2), local(3));
    main.op_textlength(local(5), local(4));
    main.op_text(local(6), "hello");
    main.op_binary(Opcode::Texteq, local(7), local(4), local(6));
    main.op_if(local(7), "good", "bad");
    main.label("bad");
    main.op_text(local(8), "substring mismatch");
    main.op_throw(local(8));
    main.label("good");
    main.op_move(local(0), local(5));
    main.op_return();

    let mut program = ProgramBuilder::new();
    program.add_function(main);
    assert_eq!(run(program).code, 5);
}

#[test]
fn halt_stops_the_machine_cleanly() {
    let mut main = BodyBuilder::new("main/0");
    main.op_halt();

    let mut program = ProgramBuilder::new();
    program.add_function(main);
    assert_eq!(run(program).code, 0);
}

#[test]
fn bitwise_and_slot_lifecycle_instructions() {
    let mut main = BodyBuilder::new("main/0");
    main.op_bits(local(1), &[0b0011]);
    main.op_bits(local(2), &[0b0101]);
    main.op_binary(Opcode::Bitand, local(3), local(1), local(2));
    main.op_integer(local(4), 1);
    main.op_binary(Opcode::Shl, local(5), local(3), local(4));
    main.op_bitat(local(6), local(5), local(4));
    main.op_not(local(7), local(6));
    main.op_if(local(7), "bad", "swap_and_delete");
    main.label("bad");
    main.op_text(local(8), "bit algebra is off");
    main.op_throw(local(8));
    main.label("swap_and_delete");
    main.op_integer(local(9), 30);
    main.op_integer(local(10), 12);
    main.op_swap(local(9), local(10));
    main.op_delete(local(10));
    main.op_isnull(local(11), local(10));
    main.op_if(local(11), "floats", "bad");
    main.label("floats");
    main.op_float(local(12), 2.5);
    main.op_float(local(13), 1.5);
    main.op_add(local(14), local(12), local(13));
    main.op_integer(local(15), 4);
    main.op_eq(local(16), local(14), local(15));
    main.op_if(local(16), "done", "bad");
    main.label("done");
    main.op_move(local(0), local(9));
    main.op_return();

    let mut program = ProgramBuilder::new();
    program.add_function(main);
    assert_eq!(run(program).code, 12);
}
