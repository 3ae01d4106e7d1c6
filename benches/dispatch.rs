//! Dispatch overhead across extension-point states.
//!
//! The public entry always pays one indirect call through the fn slot;
//! the Extended state adds argument spilling and the evaluator walk.

use std::sync::{Arc, LazyLock};

use augmentum::ir_parse::parse_module;
use augmentum::{instrument_and_load, ExtensionPoint, PassConfig, Program, Value};
use divan::black_box;

fn main() {
    divan::main();
}

const ADD_MODULE: &str = r#"
module "bench/add.c" {
  fn @add(i32, i32) -> i32 {
  b0:
    r2 = add.i32 r0, r1
    ret r2
  }
}
"#;

fn load_plain() -> Program {
    let module = parse_module(ADD_MODULE).unwrap();
    Program::load(vec![module]).unwrap()
}

fn load_instrumented() -> Program {
    let module = parse_module(ADD_MODULE).unwrap();
    instrument_and_load(vec![module], &PassConfig::default()).unwrap()
}

static UNINSTRUMENTED: LazyLock<Program> = LazyLock::new(load_plain);
static ORIGINAL_STATE: LazyLock<Program> = LazyLock::new(load_instrumented);
static EXTENDED_STATE: LazyLock<Program> = LazyLock::new(|| {
    let program = load_instrumented();
    let pt = program
        .runtime()
        .get_extension_point("bench/add.c", "add")
        .unwrap();
    pt.extend_around(
        Arc::new(|pt: &ExtensionPoint, handle, ret, args| unsafe {
            pt.call_previous(handle, ret, args);
        }),
        0,
    );
    program
});

fn run_add(program: &Program) -> i32 {
    match program
        .call(
            "bench/add.c",
            "add",
            &[Value::I32(black_box(10)), Value::I32(black_box(20))],
        )
        .unwrap()
    {
        Some(Value::I32(v)) => v,
        _ => unreachable!(),
    }
}

#[divan::bench]
fn uninstrumented() -> i32 {
    run_add(&UNINSTRUMENTED)
}

#[divan::bench]
fn original_state() -> i32 {
    run_add(&ORIGINAL_STATE)
}

#[divan::bench]
fn extended_passthrough() -> i32 {
    run_add(&EXTENDED_STATE)
}
