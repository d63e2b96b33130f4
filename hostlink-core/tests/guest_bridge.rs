//! End-to-end tests against a hand-written WAT guest.

use hostlink_core::table::{SLOT_FALSE, SLOT_NULL, SLOT_TRUE, SLOT_UNDEFINED};
use hostlink_core::{BridgeConfig, BridgeError, HostValue, HostlinkRuntime, Sandbox};

const GUEST: &str = r#"
(module
  (import "env" "hostlink_init_externref_table" (func $init))
  (import "env" "hostlink_string_new" (func $string_new (param i32 i32) (result i32)))
  (import "env" "hostlink_string_get" (func $string_get (param i32 i32)))
  (import "env" "hostlink_number_get" (func $number_get (param i32 i32)))
  (import "env" "hostlink_closure_new" (func $closure_new (param i32 i32 i32 i32 i32) (result i32)))
  (import "env" "hostlink_cb_drop" (func $cb_drop (param i32) (result i32)))
  (import "env" "hostlink_externref_drop" (func $drop (param i32)))
  (import "env" "hostlink_exn_take" (func $exn_take (result i32)))
  (import "env" "hostlink_throw" (func $throw (param i32 i32)))
  (import "env" "hostlink_debug_string" (func $debug_string (param i32 i32)))
  (import "env" "hostlink_is_function" (func $is_function (param i32) (result i32)))
  (import "env" "hostlink_is_null" (func $is_null (param i32) (result i32)))
  (import "env" "hostlink_is_object" (func $is_object (param i32) (result i32)))
  (import "env" "hostlink_is_undefined" (func $is_undefined (param i32) (result i32)))
  (import "env" "hostlink_number_new" (func $number_new (param f64) (result i32)))
  (import "env" "hostlink_boolean_get" (func $boolean_get (param i32) (result i32)))
  (import "env" "hostlink_object_clone_ref" (func $clone_ref (param i32) (result i32)))
  (import "env" "host_parse" (func $host_parse (param i32) (result i32)))

  (memory (export "memory") 1)
  (global $top (mut i32) (i32.const 1024))

  ;; 1: destructor, 2: unary invoke shim
  (table (export "__indirect_function_table") 4 funcref)
  (elem (i32.const 1) $dtor $invoke)

  ;; Bookkeeping words: 0 destructor calls, 4 last capture word, 8 last argument, 12 invoke calls.
  (func $bump (param $addr i32)
    local.get $addr
    local.get $addr i32.load
    i32.const 1 i32.add
    i32.store)

  (func $malloc (export "hostlink_malloc") (param $size i32) (param $align i32) (result i32)
    (local $ptr i32)
    global.get $top
    local.get $align i32.add
    i32.const 1 i32.sub
    i32.const 0 local.get $align i32.sub
    i32.and
    local.set $ptr
    local.get $ptr local.get $size i32.add
    global.set $top
    (block $done
      (loop $grow
        global.get $top
        memory.size i32.const 16 i32.shl
        i32.le_u
        br_if $done
        i32.const 1 memory.grow
        i32.const -1 i32.eq
        if unreachable end
        br $grow))
    local.get $ptr)

  (func (export "hostlink_realloc") (param $ptr i32) (param $old i32) (param $new i32) (param $align i32) (result i32)
    (local $fresh i32)
    local.get $new local.get $align call $malloc
    local.set $fresh
    local.get $fresh
    local.get $ptr
    local.get $old local.get $new
    local.get $old local.get $new i32.lt_u
    select
    memory.copy
    local.get $fresh)

  (func (export "hostlink_free") (param i32 i32 i32))

  (func (export "hostlink_start") call $init)

  (func $dtor (param $a i32) (param $b i32)
    i32.const 0 call $bump
    i32.const 4 local.get $a i32.store)

  (func $invoke (param $a i32) (param $b i32) (param $h i32)
    i32.const 12 call $bump
    i32.const 4 local.get $a i32.store
    i32.const 8 local.get $h i32.store)

  (func (export "make_closure") (result i32)
    i32.const 111 i32.const 222 i32.const 1 i32.const 2 i32.const 1
    call $closure_new)
  (func (export "drop_closure") (param i32) (result i32)
    local.get 0 call $cb_drop)
  (func (export "release") (param i32)
    local.get 0 call $drop)
  (func (export "make_string") (param i32 i32) (result i32)
    local.get 0 local.get 1 call $string_new)
  (func (export "read_string") (param i32 i32)
    local.get 0 local.get 1 call $string_get)
  (func (export "read_number") (param i32 i32)
    local.get 0 local.get 1 call $number_get)
  (func (export "fail") (param i32 i32)
    local.get 0 local.get 1 call $throw)
  (func (export "parse") (param i32) (result i32)
    local.get 0 call $host_parse)
  (func (export "take_exn") (result i32)
    call $exn_take)
  (func (export "word") (param i32) (result i32)
    local.get 0 i32.load)
  (func (export "debug") (param i32 i32)
    local.get 0 local.get 1 call $debug_string)
  ;; bit 0 function, 1 null, 2 object, 3 undefined
  (func (export "type_bits") (param $h i32) (result i32)
    local.get $h call $is_function
    local.get $h call $is_null i32.const 1 i32.shl i32.or
    local.get $h call $is_object i32.const 2 i32.shl i32.or
    local.get $h call $is_undefined i32.const 3 i32.shl i32.or)
  (func (export "make_number") (param f64) (result i32)
    local.get 0 call $number_new)
  (func (export "read_bool") (param i32) (result i32)
    local.get 0 call $boolean_get)
  (func (export "clone") (param i32) (result i32)
    local.get 0 call $clone_ref)
)
"#;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn runtime_with(config: BridgeConfig) -> HostlinkRuntime {
    init_tracing();
    let mut rt = HostlinkRuntime::new(config).unwrap();
    rt.register_host_fn("host_parse", 1, |_: &mut dyn Sandbox, args: &[HostValue]| {
        let text = args[0].as_str().unwrap_or_default();
        text.trim()
            .parse::<f64>()
            .map(HostValue::Number)
            .map_err(|e| HostValue::error("SyntaxError", format!("{text:?}: {e}")))
    });
    let module = rt.load(GUEST.as_bytes()).unwrap();
    rt.instantiate(&module).unwrap();
    rt
}

fn runtime() -> HostlinkRuntime {
    runtime_with(BridgeConfig::default())
}

fn word(rt: &mut HostlinkRuntime, addr: i32) -> i32 {
    rt.call_export::<i32, i32>("word", addr).unwrap()
}

fn memory_bytes(rt: &HostlinkRuntime, ptr: u32, len: u32) -> Vec<u8> {
    let memory = rt.state().exports().unwrap().memory;
    memory.data(&rt.store)[ptr as usize..(ptr + len) as usize].to_vec()
}

#[test]
fn reserved_handles_after_start() {
    let rt = runtime();
    assert!(rt.value(SLOT_UNDEFINED).unwrap().is_undefined());
    assert!(rt.value(SLOT_NULL).unwrap().is_null());
    assert_eq!(rt.value(SLOT_TRUE).unwrap().as_bool(), Some(true));
    assert_eq!(rt.value(SLOT_FALSE).unwrap().as_bool(), Some(false));
}

#[test]
fn strings_round_trip_through_guest_memory() {
    let mut rt = runtime();
    for s in ["", "plain ascii", "héllo wörld", "日本語 😀 mixed"] {
        let t = rt.encode_string(s).unwrap();
        assert_eq!(rt.decode_string(t.ptr, t.len).unwrap(), s);

        let h = rt
            .call_export::<(i32, i32), i32>("make_string", (t.ptr as i32, t.len as i32))
            .unwrap();
        assert_eq!(rt.take_value(h as u32).unwrap().as_str(), Some(s));
    }
}

#[test]
fn encoding_past_the_first_page_grows_memory() {
    let mut rt = runtime();
    let before = rt.state().exports().unwrap().memory.data_size(&rt.store);
    let big = "añb".repeat(40_000);
    let t = rt.encode_string(&big).unwrap();
    let after = rt.state().exports().unwrap().memory.data_size(&rt.store);
    assert!(after > before);
    assert_eq!(rt.decode_string(t.ptr, t.len).unwrap(), big);
    assert!(rt.state().views.stats().invalidations > 0);
}

#[test]
fn string_and_number_out_params() {
    let mut rt = runtime();
    let h = rt.insert_value(HostValue::from("from host"));
    rt.call_export::<(i32, i32), ()>("read_string", (64, h as i32))
        .unwrap();
    let out = memory_bytes(&rt, 64, 8);
    let ptr = u32::from_le_bytes(out[0..4].try_into().unwrap());
    let len = u32::from_le_bytes(out[4..8].try_into().unwrap());
    assert_eq!(rt.decode_string(ptr, len).unwrap(), "from host");

    let n = rt.insert_value(HostValue::Number(-3.25));
    rt.call_export::<(i32, i32), ()>("read_number", (96, n as i32))
        .unwrap();
    let out = memory_bytes(&rt, 96, 16);
    assert_eq!(i32::from_le_bytes(out[0..4].try_into().unwrap()), 1);
    assert_eq!(f64::from_le_bytes(out[8..16].try_into().unwrap()), -3.25);

    rt.call_export::<(i32, i32), ()>("read_number", (96, h as i32))
        .unwrap();
    let out = memory_bytes(&rt, 96, 4);
    assert_eq!(i32::from_le_bytes(out[0..4].try_into().unwrap()), 0);
}

#[test]
fn debug_string_lands_in_the_out_area() {
    let mut rt = runtime();
    let h = rt.insert_value(HostValue::error("RangeError", "too big"));
    rt.call_export::<(i32, i32), ()>("debug", (64, h as i32)).unwrap();
    let out = memory_bytes(&rt, 64, 8);
    let ptr = u32::from_le_bytes(out[0..4].try_into().unwrap());
    let len = u32::from_le_bytes(out[4..8].try_into().unwrap());
    assert_eq!(rt.decode_string(ptr, len).unwrap(), "RangeError: too big");

    let n = rt.insert_value(HostValue::Number(1e20));
    rt.call_export::<(i32, i32), ()>("debug", (64, n as i32)).unwrap();
    let out = memory_bytes(&rt, 64, 8);
    let ptr = u32::from_le_bytes(out[0..4].try_into().unwrap());
    let len = u32::from_le_bytes(out[4..8].try_into().unwrap());
    assert_eq!(rt.decode_string(ptr, len).unwrap(), "100000000000000000000");
}

#[test]
fn type_tests_match_the_value() {
    let mut rt = runtime();
    let f = rt.insert_value(HostValue::native_fn("tick", |_| Ok(HostValue::Undefined)));
    let o = rt.insert_value(HostValue::array([HostValue::Null]));
    let s = rt.insert_value(HostValue::from("text"));

    let mut bits = |h: u32| rt.call_export::<i32, i32>("type_bits", h as i32).unwrap();
    assert_eq!(bits(f), 0b0001);
    assert_eq!(bits(SLOT_NULL), 0b0010);
    assert_eq!(bits(o), 0b0100);
    assert_eq!(bits(SLOT_UNDEFINED), 0b1000);
    assert_eq!(bits(s), 0);

    let err = rt.call_export::<i32, i32>("type_bits", 4000).unwrap_err();
    assert!(matches!(err, BridgeError::InvalidHandle(4000)));
}

#[test]
fn numbers_and_booleans_cross_by_handle() {
    let mut rt = runtime();
    let h = rt.call_export::<f64, i32>("make_number", 2.5).unwrap();
    assert!(h as u32 >= 4);
    assert_eq!(rt.take_value(h as u32).unwrap().as_f64(), Some(2.5));

    let s = rt.insert_value(HostValue::from("true"));
    assert_eq!(rt.call_export::<i32, i32>("read_bool", SLOT_TRUE as i32).unwrap(), 1);
    assert_eq!(rt.call_export::<i32, i32>("read_bool", SLOT_FALSE as i32).unwrap(), 0);
    assert_eq!(rt.call_export::<i32, i32>("read_bool", s as i32).unwrap(), 2);
}

#[test]
fn cloned_handle_outlives_the_original() {
    let mut rt = runtime();
    let h = rt.insert_value(HostValue::from("shared"));
    let c = rt.call_export::<i32, i32>("clone", h as i32).unwrap() as u32;
    assert_ne!(c, h);

    rt.call_export::<i32, ()>("release", h as i32).unwrap();
    assert!(rt.value(h).is_err());
    assert_eq!(rt.value(c).unwrap().as_str(), Some("shared"));
}

#[test]
fn closure_invoked_then_dropped_by_guest() {
    let mut rt = runtime();
    let h = rt.call_export::<(), i32>("make_closure", ()).unwrap() as u32;
    let closure = rt.value(h).unwrap().as_closure().cloned().unwrap();

    rt.invoke_closure(&closure, &[HostValue::from("click")]).unwrap();
    assert_eq!(word(&mut rt, 12), 1);
    assert_eq!(word(&mut rt, 4), 111);
    let arg = word(&mut rt, 8) as u32;
    assert_eq!(rt.value(arg).unwrap().as_str(), Some("click"));

    // No invocation in flight: the guest destroys its own capture.
    assert_eq!(rt.call_export::<i32, i32>("drop_closure", h as i32).unwrap(), 1);
    rt.call_export::<i32, ()>("release", h as i32).unwrap();

    let err = rt.invoke_closure(&closure, &[]).unwrap_err();
    assert!(matches!(err, BridgeError::ClosureDropped(_)));

    drop(closure);
    assert_eq!(rt.run_finalizers().unwrap(), 0);
    assert_eq!(word(&mut rt, 0), 0);
}

#[test]
fn unreferenced_closure_is_finalized_once() {
    let mut rt = runtime();
    let h = rt.call_export::<(), i32>("make_closure", ()).unwrap();
    rt.call_export::<i32, ()>("release", h).unwrap();

    assert_eq!(rt.run_finalizers().unwrap(), 1);
    assert_eq!(rt.run_finalizers().unwrap(), 0);
    assert_eq!(word(&mut rt, 0), 1);
    assert_eq!(word(&mut rt, 4), 111);
}

#[test]
fn guest_throw_surfaces_as_thrown_error() {
    let mut rt = runtime();
    let t = rt.encode_string("boom").unwrap();
    let err = rt
        .call_export::<(i32, i32), ()>("fail", (t.ptr as i32, t.len as i32))
        .unwrap_err();
    match err {
        BridgeError::Thrown(value) => assert_eq!(value.debug_string(), "Error: boom"),
        other => panic!("expected a thrown error, got {other}"),
    }
}

#[test]
fn host_fn_exception_goes_through_the_slot() {
    let mut rt = runtime();
    let good = rt.insert_value(HostValue::from(" 42.5 "));
    let ret = rt.call_export::<i32, i32>("parse", good as i32).unwrap();
    assert_eq!(rt.value(ret as u32).unwrap().as_f64(), Some(42.5));
    assert_eq!(rt.call_export::<(), i32>("take_exn", ()).unwrap(), 0);

    let bad = rt.insert_value(HostValue::from("forty"));
    let ret = rt.call_export::<i32, i32>("parse", bad as i32).unwrap();
    assert_eq!(ret, 0);
    let exn = rt.call_export::<(), i32>("take_exn", ()).unwrap();
    assert_ne!(exn, 0);
    assert!(rt.value(exn as u32).unwrap().debug_string().starts_with("SyntaxError"));
    assert_eq!(rt.call_export::<(), i32>("take_exn", ()).unwrap(), 0);

    // A later successful call does not resurface the old exception.
    rt.call_export::<i32, i32>("parse", bad as i32).unwrap();
    rt.call_export::<i32, i32>("parse", good as i32).unwrap();
    assert!(rt.take_exception().is_none());
}

#[test]
fn bad_handle_traps_the_guest() {
    let mut rt = runtime();
    let err = rt.call_export::<i32, ()>("release", 5000).unwrap_err();
    assert!(matches!(err, BridgeError::InvalidHandle(5000)));
}

#[test]
fn missing_allocator_export_is_rejected() {
    init_tracing();
    let mut rt = HostlinkRuntime::new(BridgeConfig::default()).unwrap();
    let module = rt.load(b"(module (memory (export \"memory\") 1))").unwrap();
    let err = rt.instantiate(&module).unwrap_err();
    assert!(matches!(err, BridgeError::MissingExport("hostlink_malloc")));
}

#[test]
fn fuel_is_metered_when_configured() {
    let mut rt = runtime_with(BridgeConfig::default().fuel_limit(Some(10_000_000)));
    let before = rt.fuel_remaining().unwrap();
    rt.encode_string("metered").unwrap();
    assert!(rt.fuel_remaining().unwrap() < before);
}
