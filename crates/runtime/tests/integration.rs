//! End-to-end scenarios run against `Vm::interpret`, capturing `print`
//! output through an injected `Vec<u8>` writer instead of process stdout.

use lox_runtime::{InterpretError, Vm};

fn run(source: &str) -> String {
    let mut vm = Vm::with_writer(Vec::<u8>::new());
    vm.interpret(source).unwrap_or_else(|e| panic!("expected a clean run, got: {e}"));
    vm.take_output()
}

#[test]
fn adds_two_numbers() {
    assert_eq!(run("print 1 + 2;"), "3\n");
}

#[test]
fn string_accumulates_across_a_for_loop() {
    assert_eq!(run(r#"var s = "x"; for (var i = 0; i < 3; i = i + 1) s = s + i; print s;"#), "x012\n");
}

#[test]
fn a_closure_keeps_its_own_counter_state() {
    let source = r#"
        fun make() {
            var x = 0;
            fun inc() { x = x + 1; return x; }
            return inc;
        }
        var f = make();
        print f();
        print f();
        print f();
    "#;
    assert_eq!(run(source), "1\n2\n3\n");
}

#[test]
fn super_call_chains_through_one_level_of_inheritance() {
    let source = r#"
        class A { greet() { return "A"; } }
        class B < A { greet() { return super.greet() + "B"; } }
        print B().greet();
    "#;
    assert_eq!(run(source), "AB\n");
}

#[test]
fn initializer_sets_a_field_read_back_on_the_instance() {
    let source = r#"
        class P { init(n) { this.n = n; } }
        print P(7).n;
    "#;
    assert_eq!(run(source), "7\n");
}

#[test]
fn interpolation_lowers_through_the_str_native() {
    assert_eq!(run(r#"var x = "n=${10*2+1}!"; print x;"#), "n=21!\n");
}

#[test]
fn unbounded_recursion_reports_stack_overflow_with_a_full_trace() {
    let mut vm = Vm::with_writer(Vec::<u8>::new());
    let err = vm.interpret("fun f() { f(); } f();").unwrap_err();
    match err {
        InterpretError::Runtime(e) => {
            assert_eq!(e.message, "Stack overflow.");
            assert_eq!(e.trace.len(), 1000);
        }
        InterpretError::Compile(_) => panic!("expected a runtime error"),
    }
}
