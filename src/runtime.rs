//! The augmentum runtime: extension points, advice, listeners.
//!
//! The rewriter turns every instrumented function into a named extension
//! point whose public entry dispatches through a writable function-pointer
//! slot. This module owns the registry of those points, the per-point
//! before/around/after advice chains, and the evaluator that weaves advice
//! around the preserved original.
//!
//! Lifecycle contract (see also the crate docs): extension points are
//! registered by module constructors at load time; advice and listener
//! mutation is expected during single-threaded initialization and shutdown
//! phases; any number of threads may *invoke* instrumented functions
//! concurrently while no mutation is in flight. The evaluator snapshots a
//! point's advice state once per call, so advice may synchronously re-enter
//! the same point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::types::{FnType, TypeDesc};

// ─── Raw entries ────────────────────────────────────────────────────────────

/// An opaque function handle. The loader assigns these; 0 is null.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFn(pub u64);

impl RawFn {
    pub const NULL: RawFn = RawFn(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// The writable function-pointer slot of one extension point: the address
/// of the module-private global every public call loads its target from.
#[derive(Debug, Clone, Copy)]
pub struct FnSlot(*mut u64);

// The slot points into loaded-program global storage that outlives the
// registry; mutation follows the single-threaded lifecycle contract.
unsafe impl Send for FnSlot {}
unsafe impl Sync for FnSlot {}

impl FnSlot {
    /// The caller guarantees `ptr` stays valid for the life of the
    /// extension point.
    pub fn new(ptr: *mut u64) -> Self {
        FnSlot(ptr)
    }

    fn load(&self) -> RawFn {
        RawFn(unsafe { self.0.read() })
    }

    fn store(&self, f: RawFn) {
        unsafe { self.0.write(f.0) }
    }
}

/// Pointer to return-value storage (null for void returns).
pub type RetVal = *mut u8;
/// Pointer to an N-element array of argument pointers.
pub type ArgVals = *mut *mut u8;

/// The `i`-th argument slot, reinterpreted. For ordinary parameters this
/// points at a stack cell holding the value; for by-value aggregate
/// parameters it points directly at the caller-owned aggregate.
pub unsafe fn arg_ptr<T>(args: ArgVals, i: usize) -> *mut T {
    unsafe { *args.add(i) as *mut T }
}

/// Invokes the compiler-generated reflect entry of one function: the thunk
/// that unpacks `(ret, args)` and calls the preserved original directly.
///
/// Built by the loader (`ctx` is its re-entry context) or from a plain
/// function for runtime-level tests.
pub struct ReflectThunk {
    ctx: *const (),
    func: RawFn,
    invoke: unsafe fn(*const (), RawFn, RetVal, ArgVals),
}

// `ctx` belongs to the loaded program, which owns the registry; see the
// lifecycle contract above.
unsafe impl Send for ReflectThunk {}
unsafe impl Sync for ReflectThunk {}

impl ReflectThunk {
    pub fn new(ctx: *const (), func: RawFn, invoke: unsafe fn(*const (), RawFn, RetVal, ArgVals)) -> Self {
        ReflectThunk { ctx, func, invoke }
    }

    /// Wrap a plain reflect function. Used by tests that exercise the
    /// runtime without a loaded program.
    pub fn native(f: unsafe fn(RetVal, ArgVals)) -> Self {
        unsafe fn call_native(ctx: *const (), _func: RawFn, ret: RetVal, args: ArgVals) {
            let f: unsafe fn(RetVal, ArgVals) = unsafe { std::mem::transmute(ctx) };
            unsafe { f(ret, args) }
        }
        ReflectThunk {
            ctx: f as *const (),
            func: RawFn::NULL,
            invoke: call_native,
        }
    }

    pub unsafe fn invoke(&self, ret: RetVal, args: ArgVals) {
        unsafe { (self.invoke)(self.ctx, self.func, ret, args) }
    }
}

// ─── Advice ─────────────────────────────────────────────────────────────────

/// Caller-provided advice tag; 0 means "no identifier".
pub type AdviceId = u32;

static NEXT_ADVICE_ID: AtomicU32 = AtomicU32::new(1);

/// A process-wide unique, non-zero advice identifier. Advice installed
/// under an id can be removed by that id without keeping the handle.
pub fn unique_advice_id() -> AdviceId {
    NEXT_ADVICE_ID.fetch_add(1, Ordering::Relaxed)
}

pub type BeforeAdvice = Arc<dyn Fn(&ExtensionPoint, ArgVals) + Send + Sync>;
pub type AroundAdvice = Arc<dyn Fn(&ExtensionPoint, AroundHandle, RetVal, ArgVals) + Send + Sync>;
pub type AfterAdvice = Arc<dyn Fn(&ExtensionPoint, RetVal, ArgVals) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeforeHandle(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AroundHandle(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AfterHandle(u32);

/// One advice chain: a singly linked list threaded through a stable arena.
/// Insertion is at the head (latest first). Removal unlinks but keeps the
/// node slot, so handles stay stable indices for the life of the point.
struct Chain<F> {
    nodes: Vec<ChainNode<F>>,
    head: Option<u32>,
}

struct ChainNode<F> {
    advice: F,
    id: AdviceId,
    next: Option<u32>,
    removed: bool,
}

impl<F: Clone> Clone for Chain<F> {
    fn clone(&self) -> Self {
        Chain {
            nodes: self
                .nodes
                .iter()
                .map(|n| ChainNode {
                    advice: n.advice.clone(),
                    id: n.id,
                    next: n.next,
                    removed: n.removed,
                })
                .collect(),
            head: self.head,
        }
    }
}

impl<F> Default for Chain<F> {
    fn default() -> Self {
        Chain {
            nodes: Vec::new(),
            head: None,
        }
    }
}

impl<F> Chain<F> {
    fn push_front(&mut self, advice: F, id: AdviceId) -> u32 {
        let idx = self.nodes.len() as u32;
        self.nodes.push(ChainNode {
            advice,
            id,
            next: self.head,
            removed: false,
        });
        self.head = Some(idx);
        idx
    }

    fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    fn node(&self, idx: u32) -> &ChainNode<F> {
        &self.nodes[idx as usize]
    }

    /// Unlink one node by identity. Unknown or already-removed nodes are
    /// left alone.
    fn unlink(&mut self, idx: u32) {
        let mut cursor = self.head;
        let mut prev: Option<u32> = None;
        while let Some(cur) = cursor {
            let next = self.nodes[cur as usize].next;
            if cur == idx {
                match prev {
                    None => self.head = next,
                    Some(p) => self.nodes[p as usize].next = next,
                }
                self.nodes[cur as usize].removed = true;
                return;
            }
            prev = Some(cur);
            cursor = next;
        }
    }

    /// Unlink every node carrying `id`. The caller has already rejected
    /// id 0.
    fn remove_id(&mut self, id: AdviceId) {
        debug_assert_ne!(id, 0);
        let mut cursor = self.head;
        let mut prev: Option<u32> = None;
        while let Some(cur) = cursor {
            let next = self.nodes[cur as usize].next;
            if self.nodes[cur as usize].id == id {
                match prev {
                    None => self.head = next,
                    Some(p) => self.nodes[p as usize].next = next,
                }
                self.nodes[cur as usize].removed = true;
            } else {
                prev = Some(cur);
            }
            cursor = next;
        }
    }

    fn iter(&self) -> ChainIter<'_, F> {
        ChainIter {
            chain: self,
            cursor: self.head,
        }
    }
}

struct ChainIter<'a, F> {
    chain: &'a Chain<F>,
    cursor: Option<u32>,
}

impl<'a, F> Iterator for ChainIter<'a, F> {
    type Item = &'a ChainNode<F>;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.cursor?;
        let node = self.chain.node(idx);
        self.cursor = node.next;
        Some(node)
    }
}

/// Advice state of an extended point. Present exactly while the point is in
/// the Extended state.
#[derive(Default)]
struct AdviceState {
    befores: Chain<BeforeAdvice>,
    arounds: Chain<AroundAdvice>,
    afters: Chain<AfterAdvice>,
}

impl Clone for AdviceState {
    fn clone(&self) -> Self {
        AdviceState {
            befores: self.befores.clone(),
            arounds: self.arounds.clone(),
            afters: self.afters.clone(),
        }
    }
}

impl AdviceState {
    fn is_empty(&self) -> bool {
        self.befores.is_empty() && self.arounds.is_empty() && self.afters.is_empty()
    }
}

// ─── Extension point ────────────────────────────────────────────────────────

/// A named, typed, dynamically re-routable call site for one instrumented
/// function.
///
/// Exactly one of three states holds at any time:
/// - **Original**: the slot targets the preserved original; no advice state.
/// - **Extended**: the slot targets the generated extended entry; advice
///   state present.
/// - **Replaced**: the slot targets a caller-supplied function; no advice
///   state.
pub struct ExtensionPoint {
    module_name: String,
    name: String,
    type_desc: &'static TypeDesc,
    slot: FnSlot,
    original: RawFn,
    extended: RawFn,
    reflect: ReflectThunk,
    state: RwLock<Option<Arc<AdviceState>>>,
}

impl ExtensionPoint {
    // ─── Queries ────────────────────────────────────────────────────────

    /// The mangled function name, as the frontend knew it.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub(crate) fn key(&self) -> String {
        format!("{}::{}", self.module_name, self.name)
    }

    pub fn fn_type(&self) -> &'static FnType {
        self.type_desc
            .as_function()
            .expect("extension point type is a function descriptor")
    }

    pub fn type_desc(&self) -> &'static TypeDesc {
        self.type_desc
    }

    pub fn signature(&self) -> String {
        self.type_desc.signature()
    }

    pub fn return_type(&self) -> &'static TypeDesc {
        self.fn_type().return_type()
    }

    pub fn num_args(&self) -> usize {
        self.fn_type().num_args()
    }

    pub fn arg_type(&self, i: usize) -> &'static TypeDesc {
        self.fn_type().arg_type(i)
    }

    pub fn arg_types(&self) -> &[&'static TypeDesc] {
        self.fn_type().arg_types()
    }

    /// The function the public entry currently dispatches to.
    pub fn current_fn(&self) -> RawFn {
        self.slot.load()
    }

    /// Direct handle of the preserved original. Low-level; most callers
    /// want [`ExtensionPoint::call_original`].
    pub fn original_direct(&self) -> RawFn {
        self.original
    }

    pub fn is_original(&self) -> bool {
        self.slot.load() == self.original
    }

    pub fn is_extended(&self) -> bool {
        self.slot.load() == self.extended
    }

    pub fn is_replaced(&self) -> bool {
        !self.is_original() && !self.is_extended()
    }

    // ─── Mutation ───────────────────────────────────────────────────────

    /// Install advice to run before the function. Latest installed runs
    /// first.
    pub fn extend_before(&self, advice: BeforeAdvice, id: AdviceId) -> BeforeHandle {
        let mut guard = self.state.write().unwrap();
        let mut st = self.prepare_for_extend(&guard);
        let idx = st.befores.push_front(advice, id);
        *guard = Some(Arc::new(st));
        BeforeHandle(idx)
    }

    /// Install advice to run around the function. The latest installed is
    /// outermost; it decides whether to call inward via
    /// [`ExtensionPoint::call_previous`].
    pub fn extend_around(&self, advice: AroundAdvice, id: AdviceId) -> AroundHandle {
        let mut guard = self.state.write().unwrap();
        let mut st = self.prepare_for_extend(&guard);
        let idx = st.arounds.push_front(advice, id);
        *guard = Some(Arc::new(st));
        AroundHandle(idx)
    }

    /// Install advice to run after the function. Latest installed runs
    /// first.
    pub fn extend_after(&self, advice: AfterAdvice, id: AdviceId) -> AfterHandle {
        let mut guard = self.state.write().unwrap();
        let mut st = self.prepare_for_extend(&guard);
        let idx = st.afters.push_front(advice, id);
        *guard = Some(Arc::new(st));
        AfterHandle(idx)
    }

    pub fn remove_before(&self, handle: BeforeHandle) {
        self.mutate_if_extended(|st| st.befores.unlink(handle.0));
    }

    /// Remove all before advice installed under `id`. No effect if `id`
    /// is 0.
    pub fn remove_before_id(&self, id: AdviceId) {
        if id != 0 {
            self.mutate_if_extended(|st| st.befores.remove_id(id));
        }
    }

    pub fn remove_around(&self, handle: AroundHandle) {
        self.mutate_if_extended(|st| st.arounds.unlink(handle.0));
    }

    /// Remove all around advice installed under `id`. No effect if `id`
    /// is 0.
    pub fn remove_around_id(&self, id: AdviceId) {
        if id != 0 {
            self.mutate_if_extended(|st| st.arounds.remove_id(id));
        }
    }

    pub fn remove_after(&self, handle: AfterHandle) {
        self.mutate_if_extended(|st| st.afters.unlink(handle.0));
    }

    /// Remove all after advice installed under `id`. No effect if `id`
    /// is 0.
    pub fn remove_after_id(&self, id: AdviceId) {
        if id != 0 {
            self.mutate_if_extended(|st| st.afters.remove_id(id));
        }
    }

    /// Remove advice installed under `id` from all three chains. No effect
    /// if `id` is 0.
    pub fn remove(&self, id: AdviceId) {
        if id != 0 {
            self.mutate_if_extended(|st| {
                st.befores.remove_id(id);
                st.arounds.remove_id(id);
                st.afters.remove_id(id);
            });
        }
    }

    /// Fully replace the function. Existing advice is removed first; the
    /// replacement must match the original's signature.
    pub fn replace(&self, f: RawFn) {
        self.reset();
        self.slot.store(f);
    }

    /// Return to the original implementation, dropping all advice.
    pub fn reset(&self) {
        let mut guard = self.state.write().unwrap();
        *guard = None;
        self.slot.store(self.original);
    }

    /// Allocate (or clone) advice state; flips the slot to the extended
    /// entry on the Original → Extended transition.
    fn prepare_for_extend(&self, guard: &Option<Arc<AdviceState>>) -> AdviceState {
        match guard {
            Some(arc) => (**arc).clone(),
            None => {
                self.slot.store(self.extended);
                AdviceState::default()
            }
        }
    }

    fn mutate_if_extended(&self, f: impl FnOnce(&mut AdviceState)) {
        if !self.is_extended() {
            return;
        }
        let mut guard = self.state.write().unwrap();
        let Some(arc) = &*guard else { return };
        let mut st = (**arc).clone();
        f(&mut st);
        if st.is_empty() {
            *guard = None;
            self.slot.store(self.original);
        } else {
            *guard = Some(Arc::new(st));
        }
    }

    fn snapshot(&self) -> Option<Arc<AdviceState>> {
        self.state.read().unwrap().clone()
    }

    // ─── Reflection ─────────────────────────────────────────────────────

    /// Call the original implementation reflectively, bypassing the around
    /// stack. `ret` must point at storage of the return type (null for
    /// void); `args` at an array of argument pointers per the evaluator
    /// contract.
    pub unsafe fn call_original(&self, ret: RetVal, args: ArgVals) {
        unsafe { self.reflect.invoke(ret, args) }
    }

    /// Call the advice one step inward from `handle`; the innermost step
    /// invokes the original.
    pub unsafe fn call_previous(&self, handle: AroundHandle, ret: RetVal, args: ArgVals) {
        let next = {
            let state = self
                .snapshot()
                .expect("call_previous on a point with no advice state");
            state.arounds.node(handle.0).next
        };
        unsafe { self.call_current(next.map(AroundHandle), ret, args) }
    }

    /// Call the around advice at `handle`, or the original when `handle`
    /// is `None`.
    pub unsafe fn call_current(&self, handle: Option<AroundHandle>, ret: RetVal, args: ArgVals) {
        match handle {
            Some(h) => {
                let state = self
                    .snapshot()
                    .expect("call_current on a point with no advice state");
                let node = state.arounds.node(h.0);
                debug_assert!(!node.removed, "around advice called through a removed handle");
                (node.advice.as_ref())(self, h, ret, args);
            }
            None => unsafe { self.reflect.invoke(ret, args) },
        }
    }

    /// The evaluator: entered from the generated extended entry.
    ///
    /// Runs the before chain head-to-tail, the around chain from the
    /// outermost node (or the original when there is none), then the after
    /// chain head-to-tail. Operates on one snapshot of the advice state.
    pub unsafe fn eval(&self, ret: RetVal, args: ArgVals) {
        let state = self
            .snapshot()
            .expect("eval on a point that is not extended");
        for node in state.befores.iter() {
            (node.advice.as_ref())(self, args);
        }
        unsafe { self.call_current(state.arounds.head.map(AroundHandle), ret, args) };
        for node in state.afters.iter() {
            (node.advice.as_ref())(self, ret, args);
        }
    }
}

// ─── Listeners ──────────────────────────────────────────────────────────────

/// Observer of extension-point lifecycle events.
pub trait Listener: Send + Sync {
    fn on_register(&self, _pt: &ExtensionPoint) {}
    fn on_unregister(&self, _pt: &ExtensionPoint) {}
}

// ─── Registry ───────────────────────────────────────────────────────────────

/// The set of registered extension points and attached listeners for one
/// loaded program.
pub struct Runtime {
    points: Mutex<HashMap<String, Arc<ExtensionPoint>>>,
    listeners: Mutex<Vec<Arc<dyn Listener>>>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Runtime {
            points: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Create and register an extension point. Called by generated module
    /// constructors through the load-time ABI; the slot must already hold
    /// the original entry.
    pub fn create_extension_point(
        &self,
        module_name: &str,
        name: &str,
        type_desc: &'static TypeDesc,
        slot: FnSlot,
        original: RawFn,
        extended: RawFn,
        reflect: ReflectThunk,
    ) -> Arc<ExtensionPoint> {
        assert!(
            slot.load() == original,
            "fn slot of {module_name}::{name} must be initialised to the original entry"
        );
        assert!(
            type_desc.as_function().is_some(),
            "extension point {module_name}::{name} requires a function type descriptor"
        );
        let pt = Arc::new(ExtensionPoint {
            module_name: module_name.to_string(),
            name: name.to_string(),
            type_desc,
            slot,
            original,
            extended,
            reflect,
            state: RwLock::new(None),
        });
        self.points.lock().unwrap().insert(pt.key(), pt.clone());
        for listener in self.listeners_snapshot() {
            listener.on_register(&pt);
        }
        pt
    }

    /// Look up a registered point by module and mangled name.
    pub fn get_extension_point(&self, module_name: &str, name: &str) -> Option<Arc<ExtensionPoint>> {
        self.points
            .lock()
            .unwrap()
            .get(&format!("{module_name}::{name}"))
            .cloned()
    }

    /// All registered points, in no particular order.
    pub fn extension_points(&self) -> Vec<Arc<ExtensionPoint>> {
        self.points.lock().unwrap().values().cloned().collect()
    }

    /// Attach a listener. With `replay`, it receives a synthetic
    /// `on_register` for every currently-registered point.
    pub fn attach(&self, listener: Arc<dyn Listener>, replay: bool) {
        self.listeners.lock().unwrap().push(listener.clone());
        if replay {
            for pt in self.extension_points() {
                listener.on_register(&pt);
            }
        }
    }

    /// Detach a listener. With `replay`, it receives `on_unregister` for
    /// every currently-registered point so it can clean up its own advice.
    pub fn detach(&self, listener: &Arc<dyn Listener>, replay: bool) {
        let mut removed = false;
        self.listeners.lock().unwrap().retain(|l| {
            let matches = Arc::ptr_eq(l, listener);
            removed |= matches;
            !matches
        });
        if removed && replay {
            for pt in self.extension_points() {
                listener.on_unregister(&pt);
            }
        }
    }

    /// Unregister everything: notify listeners, reset every point to its
    /// original entry, drop the registry contents. Idempotent; invoked at
    /// program teardown while global storage is still alive.
    pub fn shutdown(&self) {
        let points: Vec<Arc<ExtensionPoint>> =
            self.points.lock().unwrap().drain().map(|(_, pt)| pt).collect();
        let listeners = self.listeners_snapshot();
        for pt in &points {
            for listener in &listeners {
                listener.on_unregister(pt);
            }
            pt.reset();
        }
    }

    fn listeners_snapshot(&self) -> Vec<Arc<dyn Listener>> {
        self.listeners.lock().unwrap().clone()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // add(i32, i32) -> i32, as its reflect entry would marshal it.
    unsafe fn add_reflect(ret: RetVal, args: ArgVals) {
        unsafe {
            let a = *arg_ptr::<i32>(args, 0);
            let b = *arg_ptr::<i32>(args, 1);
            *(ret as *mut i32) = a + b;
        }
    }

    unsafe fn noop_reflect(_ret: RetVal, _args: ArgVals) {}

    const ORIGINAL: RawFn = RawFn(0x10);
    const EXTENDED: RawFn = RawFn(0x20);
    const REPLACEMENT: RawFn = RawFn(0x30);

    fn test_point(runtime: &Runtime, name: &str) -> Arc<ExtensionPoint> {
        let slot: &'static mut u64 = Box::leak(Box::new(ORIGINAL.0));
        let ty = TypeDesc::function(TypeDesc::int(32), vec![TypeDesc::int(32), TypeDesc::int(32)]);
        runtime.create_extension_point(
            "runtime.test",
            name,
            ty,
            FnSlot::new(slot),
            ORIGINAL,
            EXTENDED,
            ReflectThunk::native(add_reflect),
        )
    }

    /// Drive the evaluator the way a generated extended entry would.
    fn eval_add(pt: &ExtensionPoint, a: i32, b: i32) -> i32 {
        let mut ret = 0i32;
        let mut a = a;
        let mut b = b;
        let mut args: [*mut u8; 2] = [&mut a as *mut i32 as *mut u8, &mut b as *mut i32 as *mut u8];
        unsafe { pt.eval(&mut ret as *mut i32 as *mut u8, args.as_mut_ptr()) };
        ret
    }

    #[test]
    fn unique_ids_are_nonzero_and_distinct() {
        let a = unique_advice_id();
        let b = unique_advice_id();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn state_transitions_are_exclusive() {
        let runtime = Runtime::new();
        let pt = test_point(&runtime, "transitions");

        assert!(pt.is_original() && !pt.is_extended() && !pt.is_replaced());

        let h = pt.extend_before(Arc::new(|_, _| {}), 0);
        assert!(!pt.is_original() && pt.is_extended() && !pt.is_replaced());
        assert_eq!(pt.current_fn(), EXTENDED);

        pt.remove_before(h);
        assert!(pt.is_original() && !pt.is_extended() && !pt.is_replaced());
        assert_eq!(pt.current_fn(), ORIGINAL);

        pt.replace(REPLACEMENT);
        assert!(!pt.is_original() && !pt.is_extended() && pt.is_replaced());
        assert_eq!(pt.current_fn(), REPLACEMENT);

        pt.reset();
        assert!(pt.is_original());
    }

    #[test]
    fn replace_drops_existing_advice() {
        let runtime = Runtime::new();
        let pt = test_point(&runtime, "replace_drops");
        pt.extend_around(Arc::new(|_, _, _, _| {}), 7);
        pt.replace(REPLACEMENT);
        assert!(pt.is_replaced());
        // Removing by id on a replaced point is a no-op.
        pt.remove(7);
        assert!(pt.is_replaced());
    }

    #[test]
    fn eval_with_no_around_calls_reflect() {
        let runtime = Runtime::new();
        let pt = test_point(&runtime, "no_around");
        pt.extend_before(Arc::new(|_, _| {}), 0);
        assert_eq!(eval_add(&pt, 10, 20), 30);
    }

    #[test]
    fn around_stacking_and_removal() {
        let runtime = Runtime::new();
        let pt = test_point(&runtime, "around_stack");

        let add_one: AroundAdvice = Arc::new(|pt, handle, ret, args| unsafe {
            pt.call_previous(handle, ret, args);
            *(ret as *mut i32) += 1;
        });

        let h1 = pt.extend_around(add_one.clone(), 0);
        assert_eq!(eval_add(&pt, 10, 20), 31);

        let h2 = pt.extend_around(add_one.clone(), 0);
        assert_eq!(eval_add(&pt, 10, 20), 32);

        pt.remove_around(h2);
        assert_eq!(eval_add(&pt, 10, 20), 31);

        pt.remove_around(h1);
        assert!(pt.is_original());
    }

    #[test]
    fn around_order_is_latest_outermost() {
        let runtime = Runtime::new();
        let pt = test_point(&runtime, "around_order");

        // A doubles after inner, B adds one after inner. With B outermost:
        // B(A(original)) = (a+b)*2 + 1.
        let double: AroundAdvice = Arc::new(|pt, handle, ret, args| unsafe {
            pt.call_previous(handle, ret, args);
            *(ret as *mut i32) *= 2;
        });
        let add_one: AroundAdvice = Arc::new(|pt, handle, ret, args| unsafe {
            pt.call_previous(handle, ret, args);
            *(ret as *mut i32) += 1;
        });

        let h_a = pt.extend_around(double, 0);
        let h_b = pt.extend_around(add_one, 0);
        assert_eq!(eval_add(&pt, 10, 20), 61);

        // Removing the outer layer leaves only the doubler.
        pt.remove_around(h_b);
        assert_eq!(eval_add(&pt, 10, 20), 60);
        pt.remove_around(h_a);
    }

    #[test]
    fn around_can_skip_the_original() {
        let runtime = Runtime::new();
        let pt = test_point(&runtime, "short_circuit");
        pt.extend_around(
            Arc::new(|_, _, ret, _| unsafe {
                *(ret as *mut i32) = -1;
            }),
            0,
        );
        assert_eq!(eval_add(&pt, 10, 20), -1);
        pt.reset();
    }

    #[test]
    fn before_and_after_run_latest_first() {
        let runtime = Runtime::new();
        let pt = test_point(&runtime, "phase_order");
        let order = Arc::new(Mutex::new(Vec::<&'static str>::new()));

        for label in ["b1", "b2"] {
            let order = order.clone();
            pt.extend_before(
                Arc::new(move |_, _| order.lock().unwrap().push(label)),
                0,
            );
        }
        for label in ["a1", "a2"] {
            let order = order.clone();
            pt.extend_after(
                Arc::new(move |_, _, _| order.lock().unwrap().push(label)),
                0,
            );
        }

        eval_add(&pt, 1, 2);
        assert_eq!(*order.lock().unwrap(), vec!["b2", "b1", "a2", "a1"]);
    }

    #[test]
    fn id_removal_spans_all_chains() {
        let runtime = Runtime::new();
        let pt = test_point(&runtime, "id_removal");
        let id = unique_advice_id();

        pt.extend_before(Arc::new(|_, _| {}), id);
        pt.extend_around(Arc::new(|_, _, _, _| {}), id);
        pt.extend_after(Arc::new(|_, _, _| {}), id);
        pt.extend_after(Arc::new(|_, _, _| {}), 0);
        assert!(pt.is_extended());

        pt.remove(id);
        // The id-less after advice keeps the point extended.
        assert!(pt.is_extended());

        // id 0 never matches anything.
        pt.remove(0);
        pt.remove_after_id(0);
        assert!(pt.is_extended());

        pt.reset();
        assert!(pt.is_original());
    }

    #[test]
    fn call_original_bypasses_around() {
        let runtime = Runtime::new();
        let pt = test_point(&runtime, "call_original");
        pt.extend_around(
            Arc::new(|_, _, ret, _| unsafe {
                *(ret as *mut i32) = 999;
            }),
            0,
        );

        let mut ret = 0i32;
        let mut a = 3i32;
        let mut b = 4i32;
        let mut args: [*mut u8; 2] = [&mut a as *mut i32 as *mut u8, &mut b as *mut i32 as *mut u8];
        unsafe { pt.call_original(&mut ret as *mut i32 as *mut u8, args.as_mut_ptr()) };
        assert_eq!(ret, 7);
        pt.reset();
    }

    #[test]
    fn reentrant_eval_from_advice() {
        let runtime = Runtime::new();
        let pt = test_point(&runtime, "reentrant");
        let depth = Arc::new(AtomicUsize::new(0));

        let d = depth.clone();
        pt.extend_around(
            Arc::new(move |pt, handle, ret, args| unsafe {
                if d.fetch_add(1, Ordering::SeqCst) == 0 {
                    // Synchronously re-enter the same point.
                    let mut inner_ret = 0i32;
                    let mut x = 1i32;
                    let mut y = 2i32;
                    let mut inner: [*mut u8; 2] =
                        [&mut x as *mut i32 as *mut u8, &mut y as *mut i32 as *mut u8];
                    pt.eval(&mut inner_ret as *mut i32 as *mut u8, inner.as_mut_ptr());
                    assert_eq!(inner_ret, 3);
                }
                pt.call_previous(handle, ret, args);
            }),
            0,
        );

        assert_eq!(eval_add(&pt, 10, 20), 30);
        assert_eq!(depth.load(Ordering::SeqCst), 2);
    }

    struct CountingListener {
        registers: AtomicUsize,
        unregisters: AtomicUsize,
    }

    impl Listener for CountingListener {
        fn on_register(&self, _pt: &ExtensionPoint) {
            self.registers.fetch_add(1, Ordering::SeqCst);
        }
        fn on_unregister(&self, _pt: &ExtensionPoint) {
            self.unregisters.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn listener_replay_on_attach_and_detach() {
        let runtime = Runtime::new();
        let _a = test_point(&runtime, "replay_a");
        let _b = test_point(&runtime, "replay_b");

        let listener = Arc::new(CountingListener {
            registers: AtomicUsize::new(0),
            unregisters: AtomicUsize::new(0),
        });
        let as_dyn: Arc<dyn Listener> = listener.clone();

        runtime.attach(as_dyn.clone(), true);
        assert_eq!(listener.registers.load(Ordering::SeqCst), 2);

        // A fresh registration is broadcast live.
        let _c = test_point(&runtime, "replay_c");
        assert_eq!(listener.registers.load(Ordering::SeqCst), 3);

        runtime.detach(&as_dyn, true);
        assert_eq!(listener.unregisters.load(Ordering::SeqCst), 3);

        // Detached listeners hear nothing further.
        let _d = test_point(&runtime, "replay_d");
        assert_eq!(listener.registers.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn shutdown_resets_points_and_notifies() {
        let runtime = Runtime::new();
        let pt = test_point(&runtime, "shutdown");
        pt.extend_around(Arc::new(|_, _, _, _| {}), 0);

        let listener = Arc::new(CountingListener {
            registers: AtomicUsize::new(0),
            unregisters: AtomicUsize::new(0),
        });
        runtime.attach(listener.clone() as Arc<dyn Listener>, false);

        runtime.shutdown();
        assert_eq!(listener.unregisters.load(Ordering::SeqCst), 1);
        assert!(pt.is_original());
        assert!(runtime.get_extension_point("runtime.test", "shutdown").is_none());

        // Idempotent.
        runtime.shutdown();
        assert_eq!(listener.unregisters.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn void_points_accept_null_ret() {
        let runtime = Runtime::new();
        let slot: &'static mut u64 = Box::leak(Box::new(ORIGINAL.0));
        let ty = TypeDesc::function(TypeDesc::void_type(), vec![]);
        let pt = runtime.create_extension_point(
            "runtime.test",
            "void_fn",
            ty,
            FnSlot::new(slot),
            ORIGINAL,
            EXTENDED,
            ReflectThunk::native(noop_reflect),
        );
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        pt.extend_around(
            Arc::new(move |pt, handle, ret, args| unsafe {
                h.fetch_add(1, Ordering::SeqCst);
                pt.call_previous(handle, ret, args);
            }),
            0,
        );
        unsafe { pt.eval(std::ptr::null_mut(), std::ptr::null_mut()) };
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
