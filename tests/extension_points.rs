//! End-to-end scenarios: textual IR fixtures through pass, load, advice,
//! and dispatch.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use augmentum::ir_parse::parse_module;
use augmentum::runtime::arg_ptr;
use augmentum::{instrument_and_load, ExtensionPoint, Listener, PassConfig, Program, Value};

fn load_instrumented(source: &str) -> Program {
    let module = parse_module(source).expect("fixture parses");
    instrument_and_load(vec![module], &PassConfig::default()).expect("fixture loads")
}

// ─── Scalar add ─────────────────────────────────────────────────────────────

const ADD_MODULE: &str = r#"
module "scenario/add.c" {
  fn @add(i32, i32) -> i32 {
  b0:
    r2 = add.i32 r0, r1
    ret r2
  }
}
"#;

fn call_add(program: &Program, a: i32, b: i32) -> i32 {
    match program
        .call("scenario/add.c", "add", &[Value::I32(a), Value::I32(b)])
        .unwrap()
    {
        Some(Value::I32(v)) => v,
        other => panic!("unexpected result {other:?}"),
    }
}

fn add_one_to_ret() -> augmentum::runtime::AroundAdvice {
    Arc::new(|pt: &ExtensionPoint, handle, ret, args| unsafe {
        pt.call_previous(handle, ret, args);
        *(ret as *mut i32) += 1;
    })
}

#[test]
fn scalar_add() {
    let program = load_instrumented(ADD_MODULE);
    let pt = program
        .runtime()
        .get_extension_point("scenario/add.c", "add")
        .unwrap();

    // No advice: the public entry behaves exactly like the original.
    assert!(pt.is_original());
    assert_eq!(call_add(&program, 10, 20), 30);
    assert_eq!(call_add(&program, 100, 200), 300);

    // One around adding 1 to the return after calling previous.
    let h1 = pt.extend_around(add_one_to_ret(), 0);
    assert_eq!(call_add(&program, 10, 20), 31);

    // Two stacked.
    let h2 = pt.extend_around(add_one_to_ret(), 0);
    assert_eq!(call_add(&program, 10, 20), 32);

    pt.remove_around(h2);
    pt.remove_around(h1);
    assert!(pt.is_original());
    assert_eq!(call_add(&program, 10, 20), 30);
}

#[test]
fn scalar_add_reflection_metadata() {
    let program = load_instrumented(ADD_MODULE);
    let pt = program
        .runtime()
        .get_extension_point("scenario/add.c", "add")
        .unwrap();

    assert_eq!(pt.module_name(), "scenario/add.c");
    assert_eq!(pt.name(), "add");
    assert_eq!(pt.signature(), "int32 (int32, int32)");
    assert_eq!(pt.num_args(), 2);
    assert!(std::ptr::eq(pt.return_type(), augmentum::TypeDesc::int(32)));
    assert!(std::ptr::eq(pt.arg_type(0), pt.arg_type(1)));
}

#[test]
fn before_and_after_observe_the_call() {
    let program = load_instrumented(ADD_MODULE);
    let pt = program
        .runtime()
        .get_extension_point("scenario/add.c", "add")
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::<(i32, i32)>::new()));
    let observed_ret = Arc::new(AtomicUsize::new(0));

    let s = seen.clone();
    pt.extend_before(
        Arc::new(move |_pt, args| unsafe {
            let a = *arg_ptr::<i32>(args, 0);
            let b = *arg_ptr::<i32>(args, 1);
            s.lock().unwrap().push((a, b));
        }),
        0,
    );
    let r = observed_ret.clone();
    pt.extend_after(
        Arc::new(move |_pt, ret, _args| unsafe {
            r.store(*(ret as *mut i32) as usize, Ordering::SeqCst);
        }),
        0,
    );

    assert_eq!(call_add(&program, 7, 8), 15);
    assert_eq!(*seen.lock().unwrap(), vec![(7, 8)]);
    assert_eq!(observed_ret.load(Ordering::SeqCst), 15);
}

#[test]
fn replace_and_reset() {
    let source = r#"
module "scenario/replace.c" {
  fn @add(i32, i32) -> i32 {
  b0:
    r2 = add.i32 r0, r1
    ret r2
  }
  fn @sub(i32, i32) -> i32 {
  b0:
    r2 = sub.i32 r0, r1
    ret r2
  }
}
"#;
    let program = load_instrumented(source);
    let pt = program
        .runtime()
        .get_extension_point("scenario/replace.c", "add")
        .unwrap();

    // `sub` has the same signature; its public entry is a valid
    // replacement target.
    let sub = program.function_handle("scenario/replace.c", "sub").unwrap();
    pt.replace(sub);
    assert!(pt.is_replaced());

    let result = program
        .call("scenario/replace.c", "add", &[Value::I32(10), Value::I32(3)])
        .unwrap();
    assert_eq!(result, Some(Value::I32(7)));

    pt.reset();
    assert!(pt.is_original());
    let result = program
        .call("scenario/replace.c", "add", &[Value::I32(10), Value::I32(3)])
        .unwrap();
    assert_eq!(result, Some(Value::I32(13)));
}

// ─── Pointer increment ──────────────────────────────────────────────────────

const POINTER_MODULE: &str = r#"
module "scenario/pointer.c" {
  fn @pointer_test(i32*, f64*) -> i32* {
  b0:
    r2 = load i32, r0
    r3 = const.i32 1
    r4 = add.i32 r2, r3
    store i32 r4 -> r0
    r5 = load f64, r1
    r6 = fconst.f64 1.0
    r7 = fsub.f64 r5, r6
    store f64 r7 -> r1
    ret r0
  }
}
"#;

#[test]
fn pointer_increment() {
    let program = load_instrumented(POINTER_MODULE);
    let pt = program
        .runtime()
        .get_extension_point("scenario/pointer.c", "pointer_test")
        .unwrap();

    let call = |program: &Program, i: &mut i32, d: &mut f64| -> *mut i32 {
        match program
            .call(
                "scenario/pointer.c",
                "pointer_test",
                &[Value::ptr(i as *mut i32), Value::ptr(d as *mut f64)],
            )
            .unwrap()
        {
            Some(Value::Ptr(p)) => p as *mut i32,
            other => panic!("unexpected result {other:?}"),
        }
    };

    // Uninstrumented behavior: *ret == 6, i == 6, d == 2.0.
    let (mut i, mut d) = (5i32, 3.0f64);
    let ret = call(&program, &mut i, &mut d);
    assert_eq!(unsafe { *ret }, 6);
    assert_eq!(i, 6);
    assert_eq!(d, 2.0);

    // One around bumps the int behind the returned pointer, another bumps
    // the int behind the first argument. Both point at the same cell.
    pt.extend_around(
        Arc::new(|pt: &ExtensionPoint, handle, ret, args| unsafe {
            pt.call_previous(handle, ret, args);
            let returned = *(ret as *mut *mut i32);
            *returned += 1;
        }),
        0,
    );
    pt.extend_around(
        Arc::new(|pt: &ExtensionPoint, handle, ret, args| unsafe {
            pt.call_previous(handle, ret, args);
            let first = *arg_ptr::<*mut i32>(args, 0);
            *first += 1;
        }),
        0,
    );

    let (mut i, mut d) = (5i32, 3.0f64);
    let ret = call(&program, &mut i, &mut d);
    assert_eq!(unsafe { *ret }, 8);
    assert_eq!(i, 8);
    assert_eq!(d, 2.0);
}

// ─── Void mutation ──────────────────────────────────────────────────────────

const VOID_MODULE: &str = r#"
module "scenario/void.c" {
  fn @void_test(i32*) -> void {
  b0:
    r1 = load i32, r0
    r2 = const.i32 1
    r3 = add.i32 r1, r2
    store i32 r3 -> r0
    ret
  }
}
"#;

#[test]
fn void_mutation() {
    let program = load_instrumented(VOID_MODULE);
    let pt = program
        .runtime()
        .get_extension_point("scenario/void.c", "void_test")
        .unwrap();

    pt.extend_around(
        Arc::new(|pt: &ExtensionPoint, handle, ret, args| unsafe {
            pt.call_previous(handle, ret, args);
            let cell = *arg_ptr::<*mut i32>(args, 0);
            *cell += 1;
        }),
        0,
    );

    let mut i = 10i32;
    let result = program
        .call("scenario/void.c", "void_test", &[Value::ptr(&mut i)])
        .unwrap();
    assert_eq!(result, None);
    assert_eq!(i, 12);
}

// ─── Named struct return ────────────────────────────────────────────────────

#[repr(C)]
struct Node {
    data: i32,
    next: *mut Node,
}

const LIST_MODULE: &str = r#"
module "scenario/list.c" {
  struct %Node = { i32, %Node* }
  fn @list_append(%Node*, i32) -> %Node* {
  b0:
    r2 = field %Node, r0, 0
    store i32 r1 -> r2
    ret r0
  }
}
"#;

#[test]
fn named_struct_return() {
    let program = load_instrumented(LIST_MODULE);
    let pt = program
        .runtime()
        .get_extension_point("scenario/list.c", "list_append")
        .unwrap();

    // The descriptor tree reflects the self-referential struct with a
    // single struct descriptor and a single pointer descriptor.
    let node_ptr = pt.return_type();
    let node = node_ptr.as_pointer().unwrap().element();
    let st = node.as_struct().unwrap();
    assert_eq!(st.name(), Some("Node"));
    assert!(!st.is_forward());
    assert!(std::ptr::eq(st.elem_type(1), node_ptr));
    assert!(std::ptr::eq(pt.arg_type(0), node_ptr));

    pt.extend_around(
        Arc::new(|pt: &ExtensionPoint, handle, ret, args| unsafe {
            pt.call_previous(handle, ret, args);
            let appended = *(ret as *mut *mut Node);
            (*appended).data += 1;
        }),
        0,
    );

    let mut head = Node {
        data: 1,
        next: std::ptr::null_mut(),
    };
    let result = program
        .call(
            "scenario/list.c",
            "list_append",
            &[Value::ptr(&mut head as *mut Node), Value::I32(2)],
        )
        .unwrap();
    let returned = match result {
        Some(Value::Ptr(p)) => p as *mut Node,
        other => panic!("unexpected result {other:?}"),
    };
    assert_eq!(unsafe { (*returned).data }, 3);
    assert_eq!(head.data, 3);
}

// ─── By-value aggregate argument ────────────────────────────────────────────

#[repr(C)]
struct Container {
    factor: i32,
    data: [i32; 10],
}

const ARRAY_MODULE: &str = r#"
module "scenario/array.c" {
  struct %Container = { i32, [10 x i32] }
  fn @array_op(%Container* byval) -> void {
  b0:
    r1 = field %Container, r0, 0
    r2 = load i32, r1
    r3 = alloca i32
    r4 = const.i32 0
    store i32 r4 -> r3
    jmp b1
  b1:
    r5 = load i32, r3
    r6 = const.i32 10
    r7 = cmp.slt.i32 r5, r6
    br r7, b2, b3
  b2:
    r8 = field %Container, r0, 1
    r9 = load i32, r3
    r10 = elem i32, r8, r9
    r11 = load i32, r10
    r12 = mul.i32 r11, r2
    store i32 r12 -> r10
    r13 = const.i32 1
    r14 = add.i32 r9, r13
    store i32 r14 -> r3
    jmp b1
  b3:
    ret
  }
}
"#;

#[test]
fn byval_aggregate_argument() {
    let program = load_instrumented(ARRAY_MODULE);
    let pt = program
        .runtime()
        .get_extension_point("scenario/array.c", "array_op")
        .unwrap();

    // The advice sees the caller-owned aggregate directly: args[0] points
    // at the Container itself, not at a cell holding its address.
    pt.extend_around(
        Arc::new(|pt: &ExtensionPoint, handle, ret, args| unsafe {
            let container = arg_ptr::<Container>(args, 0);
            (*container).factor += 1;
            pt.call_previous(handle, ret, args);
        }),
        0,
    );

    let mut container = Container {
        factor: 2,
        data: [1, 2, 3, 4, 5, 6, 7, 8, 9, 10],
    };
    program
        .call(
            "scenario/array.c",
            "array_op",
            &[Value::ptr(&mut container as *mut Container)],
        )
        .unwrap();
    assert_eq!(container.factor, 3);
    assert_eq!(container.data, [3, 6, 9, 12, 15, 18, 21, 24, 27, 30]);
}

// ─── Listener replay ────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingListener {
    registered: Mutex<Vec<String>>,
    unregistered: Mutex<Vec<String>>,
}

impl Listener for RecordingListener {
    fn on_register(&self, pt: &ExtensionPoint) {
        self.registered.lock().unwrap().push(pt.name().to_string());
    }
    fn on_unregister(&self, pt: &ExtensionPoint) {
        self.unregistered.lock().unwrap().push(pt.name().to_string());
    }
}

const MULTI_MODULE: &str = r#"
module "scenario/multi.c" {
  fn @first(i32) -> i32 {
  b0:
    ret r0
  }
  fn @second(i32) -> i32 {
  b0:
    ret r0
  }
  fn @third(i32) -> i32 {
  b0:
    ret r0
  }
}
"#;

#[test]
fn listener_replay_matches_registered_set() {
    let program = load_instrumented(MULTI_MODULE);

    let listener = Arc::new(RecordingListener::default());
    let as_dyn: Arc<dyn Listener> = listener.clone();

    program.runtime().attach(as_dyn.clone(), true);
    let mut seen = listener.registered.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, vec!["first", "second", "third"]);

    program.runtime().detach(&as_dyn, true);
    let mut gone = listener.unregistered.lock().unwrap().clone();
    gone.sort();
    assert_eq!(gone, vec!["first", "second", "third"]);
}

#[test]
fn listener_can_install_and_clean_up_advice() {
    // The classic use: a listener that extends matching points on
    // register and removes its advice by id on unregister.
    struct AddOneListener {
        id: u32,
    }

    impl Listener for AddOneListener {
        fn on_register(&self, pt: &ExtensionPoint) {
            if pt.return_type().as_int().is_some_and(|t| t.bits() == 32) {
                pt.extend_around(
                    Arc::new(|pt: &ExtensionPoint, handle, ret, args| unsafe {
                        pt.call_previous(handle, ret, args);
                        *(ret as *mut i32) += 1;
                    }),
                    self.id,
                );
            }
        }
        fn on_unregister(&self, pt: &ExtensionPoint) {
            pt.remove_around_id(self.id);
        }
    }

    let program = load_instrumented(ADD_MODULE);
    let listener = Arc::new(AddOneListener {
        id: augmentum::unique_advice_id(),
    });
    let as_dyn: Arc<dyn Listener> = listener.clone();

    program.runtime().attach(as_dyn.clone(), true);
    assert_eq!(call_add(&program, 10, 20), 31);

    let pt = program
        .runtime()
        .get_extension_point("scenario/add.c", "add")
        .unwrap();
    assert!(pt.is_extended());

    program.runtime().detach(&as_dyn, true);
    assert!(pt.is_original());
    assert_eq!(call_add(&program, 10, 20), 30);
}

// ─── Original-state equivalence ─────────────────────────────────────────────

#[test]
fn instrumentation_preserves_uninstrumented_behavior() {
    // The same module, with and without the pass, observed through
    // identical inputs.
    let plain = parse_module(POINTER_MODULE).unwrap();
    let plain = augmentum::exec::Program::load(vec![plain]).unwrap();
    let instrumented = load_instrumented(POINTER_MODULE);

    for (i0, d0) in [(5i32, 3.0f64), (-7, 0.5), (0, -2.0)] {
        let run = |program: &Program| {
            let (mut i, mut d) = (i0, d0);
            let ret = program
                .call(
                    "scenario/pointer.c",
                    "pointer_test",
                    &[Value::ptr(&mut i), Value::ptr(&mut d)],
                )
                .unwrap();
            let ret = match ret {
                Some(Value::Ptr(p)) => unsafe { *(p as *mut i32) },
                other => panic!("unexpected result {other:?}"),
            };
            (ret, i, d)
        };
        assert_eq!(run(&plain), run(&instrumented));
    }
}
