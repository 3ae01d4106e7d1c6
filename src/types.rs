//! Runtime type descriptors.
//!
//! Every extension point carries a descriptor tree for its function
//! signature so advice can reflect over argument and return storage without
//! compile-time knowledge of the instrumented function. Descriptors are
//! interned: constructors hand out `&'static TypeDesc` and two structurally
//! equal requests return the same pointer, so descriptor equality is pointer
//! equality.
//!
//! Named structs are the one source of cycles in the descriptor graph. They
//! can be created in a *forward* state (no element types) and completed
//! exactly once; completing with different elements than a previous complete
//! definition is a fatal programming error in the generated code.
//!
//! Descriptors live from first creation to process teardown; the interning
//! tables are never freed.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, OnceLock};

/// A runtime descriptor for one lowered type.
#[derive(Debug)]
pub enum TypeDesc {
    Void,
    Int(IntType),
    Float(FloatType),
    Pointer(PointerType),
    Array(SequentialType),
    Vector(SequentialType),
    Struct(StructType),
    Function(FnType),
    /// Opaque fallback for lowered types the descriptor vocabulary cannot
    /// express. Keyed by the serialized textual form.
    Unknown(UnknownType),
}

#[derive(Debug)]
pub struct IntType {
    bits: u32,
}

impl IntType {
    pub fn bits(&self) -> u32 {
        self.bits
    }
}

#[derive(Debug)]
pub struct FloatType {
    bits: u32,
}

impl FloatType {
    pub fn bits(&self) -> u32 {
        self.bits
    }
}

#[derive(Debug)]
pub struct PointerType {
    element: &'static TypeDesc,
}

impl PointerType {
    pub fn element(&self) -> &'static TypeDesc {
        self.element
    }
}

/// Shared shape of arrays and vectors.
#[derive(Debug)]
pub struct SequentialType {
    element: &'static TypeDesc,
    num_elems: u64,
}

impl SequentialType {
    pub fn element(&self) -> &'static TypeDesc {
        self.element
    }

    pub fn num_elems(&self) -> u64 {
        self.num_elems
    }
}

#[derive(Debug)]
pub struct StructType {
    /// `None` for literal (anonymous) structs.
    name: Option<StructName>,
    elems: OnceLock<Box<[&'static TypeDesc]>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StructName {
    module: String,
    name: String,
}

impl StructType {
    pub fn is_anonymous(&self) -> bool {
        self.name.is_none()
    }

    /// A named struct is forward until its elements are set.
    pub fn is_forward(&self) -> bool {
        self.elems.get().is_none()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_ref().map(|n| n.name.as_str())
    }

    pub fn module(&self) -> Option<&str> {
        self.name.as_ref().map(|n| n.module.as_str())
    }

    pub fn elem_types(&self) -> &[&'static TypeDesc] {
        self.elems.get().map(|e| &**e).unwrap_or(&[])
    }

    pub fn num_elems(&self) -> usize {
        self.elem_types().len()
    }

    pub fn elem_type(&self, i: usize) -> &'static TypeDesc {
        self.elem_types()[i]
    }

    /// Complete a forward struct, or check a complete one. Setting element
    /// types that disagree with a previous complete definition is a hard
    /// error.
    pub fn set_elem_types(&self, elems: Vec<&'static TypeDesc>) {
        match self.elems.get() {
            None => {
                // A racing second definition with equal elements is fine;
                // the loser falls through to the equality check.
                let _ = self.elems.set(elems.clone().into_boxed_slice());
                self.check_elems(&elems);
            }
            Some(_) => self.check_elems(&elems),
        }
    }

    fn check_elems(&self, elems: &[&'static TypeDesc]) {
        let current = self.elem_types();
        let equal = current.len() == elems.len()
            && current
                .iter()
                .zip(elems)
                .all(|(a, b)| std::ptr::eq(*a, *b));
        assert!(
            equal,
            "cannot set element types of struct {} to a different value",
            self.name().unwrap_or("<anon>")
        );
    }
}

#[derive(Debug)]
pub struct FnType {
    return_type: &'static TypeDesc,
    args: Box<[&'static TypeDesc]>,
}

impl FnType {
    pub fn return_type(&self) -> &'static TypeDesc {
        self.return_type
    }

    pub fn num_args(&self) -> usize {
        self.args.len()
    }

    pub fn arg_type(&self, i: usize) -> &'static TypeDesc {
        self.args[i]
    }

    pub fn arg_types(&self) -> &[&'static TypeDesc] {
        &self.args
    }
}

#[derive(Debug)]
pub struct UnknownType {
    module: String,
    signature: String,
}

impl UnknownType {
    pub fn module(&self) -> &str {
        &self.module
    }
}

// ─── Primitive singletons ───────────────────────────────────────────────────

static VOID_TYPE: TypeDesc = TypeDesc::Void;
static I1_TYPE: TypeDesc = TypeDesc::Int(IntType { bits: 1 });
static I8_TYPE: TypeDesc = TypeDesc::Int(IntType { bits: 8 });
static I16_TYPE: TypeDesc = TypeDesc::Int(IntType { bits: 16 });
static I32_TYPE: TypeDesc = TypeDesc::Int(IntType { bits: 32 });
static I64_TYPE: TypeDesc = TypeDesc::Int(IntType { bits: 64 });
static F32_TYPE: TypeDesc = TypeDesc::Float(FloatType { bits: 32 });
static F64_TYPE: TypeDesc = TypeDesc::Float(FloatType { bits: 64 });

// ─── Interning tables ───────────────────────────────────────────────────────

// Keys on descriptor addresses are sound because descriptors are interned
// and never freed.

type Table<K> = LazyLock<Mutex<HashMap<K, &'static TypeDesc>>>;

static POINTER_TYPES: Table<usize> = LazyLock::new(Default::default);
static ARRAY_TYPES: Table<(usize, u64)> = LazyLock::new(Default::default);
static VECTOR_TYPES: Table<(usize, u64)> = LazyLock::new(Default::default);
static ANON_STRUCT_TYPES: Table<String> = LazyLock::new(Default::default);
static NAMED_STRUCT_TYPES: Table<StructName> = LazyLock::new(Default::default);
static FN_TYPES: Table<String> = LazyLock::new(Default::default);
static UNKNOWN_TYPES: Table<String> = LazyLock::new(Default::default);

fn addr(desc: &'static TypeDesc) -> usize {
    desc as *const TypeDesc as usize
}

impl TypeDesc {
    // ─── Constructors ───────────────────────────────────────────────────

    pub fn void_type() -> &'static TypeDesc {
        &VOID_TYPE
    }

    /// Integer descriptor for a supported width. Generated code only ever
    /// requests the five supported widths; anything else is a contract
    /// violation.
    pub fn int(bits: u32) -> &'static TypeDesc {
        match bits {
            1 => &I1_TYPE,
            8 => &I8_TYPE,
            16 => &I16_TYPE,
            32 => &I32_TYPE,
            64 => &I64_TYPE,
            _ => panic!("no descriptor for i{bits}"),
        }
    }

    pub fn float(bits: u32) -> &'static TypeDesc {
        match bits {
            32 => &F32_TYPE,
            64 => &F64_TYPE,
            _ => panic!("no descriptor for f{bits}"),
        }
    }

    /// The canonical pointer descriptor for an element: at most one pointer
    /// node exists per element.
    pub fn pointer(element: &'static TypeDesc) -> &'static TypeDesc {
        let mut table = POINTER_TYPES.lock().unwrap();
        *table
            .entry(addr(element))
            .or_insert_with(|| Box::leak(Box::new(TypeDesc::Pointer(PointerType { element }))))
    }

    /// Convenience: `T.pointer_to()` ≡ `TypeDesc::pointer(T)`.
    pub fn pointer_to(&'static self) -> &'static TypeDesc {
        TypeDesc::pointer(self)
    }

    pub fn array(element: &'static TypeDesc, num_elems: u64) -> &'static TypeDesc {
        let mut table = ARRAY_TYPES.lock().unwrap();
        *table.entry((addr(element), num_elems)).or_insert_with(|| {
            Box::leak(Box::new(TypeDesc::Array(SequentialType {
                element,
                num_elems,
            })))
        })
    }

    pub fn vector(element: &'static TypeDesc, num_elems: u64) -> &'static TypeDesc {
        let mut table = VECTOR_TYPES.lock().unwrap();
        *table.entry((addr(element), num_elems)).or_insert_with(|| {
            Box::leak(Box::new(TypeDesc::Vector(SequentialType {
                element,
                num_elems,
            })))
        })
    }

    /// Anonymous struct, interned by signature.
    pub fn anon_struct(elems: Vec<&'static TypeDesc>) -> &'static TypeDesc {
        let key = anon_struct_signature(&elems);
        let mut table = ANON_STRUCT_TYPES.lock().unwrap();
        *table.entry(key).or_insert_with(|| {
            let cell = OnceLock::new();
            cell.set(elems.into_boxed_slice()).unwrap();
            Box::leak(Box::new(TypeDesc::Struct(StructType {
                name: None,
                elems: cell,
            })))
        })
    }

    /// The named struct for (module, name), forward if it does not exist
    /// yet.
    pub fn forward_struct(module: &str, name: &str) -> &'static TypeDesc {
        let key = StructName {
            module: module.to_string(),
            name: name.to_string(),
        };
        let mut table = NAMED_STRUCT_TYPES.lock().unwrap();
        *table.entry(key.clone()).or_insert_with(|| {
            Box::leak(Box::new(TypeDesc::Struct(StructType {
                name: Some(key),
                elems: OnceLock::new(),
            })))
        })
    }

    /// The complete named struct for (module, name). An existing forward
    /// descriptor is completed; an existing complete one must match.
    pub fn named_struct(
        module: &str,
        name: &str,
        elems: Vec<&'static TypeDesc>,
    ) -> &'static TypeDesc {
        let desc = TypeDesc::forward_struct(module, name);
        desc.as_struct()
            .expect("forward_struct returns a struct descriptor")
            .set_elem_types(elems);
        desc
    }

    /// Function type descriptor, interned by signature.
    pub fn function(
        return_type: &'static TypeDesc,
        args: Vec<&'static TypeDesc>,
    ) -> &'static TypeDesc {
        let key = fn_signature(return_type, &args);
        let mut table = FN_TYPES.lock().unwrap();
        *table.entry(key).or_insert_with(|| {
            Box::leak(Box::new(TypeDesc::Function(FnType {
                return_type,
                args: args.into_boxed_slice(),
            })))
        })
    }

    /// Opaque fallback, interned by (module, signature).
    pub fn unknown(module: &str, signature: &str) -> &'static TypeDesc {
        let key = format!("{module}::{signature}");
        let mut table = UNKNOWN_TYPES.lock().unwrap();
        *table.entry(key).or_insert_with(|| {
            Box::leak(Box::new(TypeDesc::Unknown(UnknownType {
                module: module.to_string(),
                signature: signature.to_string(),
            })))
        })
    }

    // ─── Accessors ──────────────────────────────────────────────────────

    pub fn as_int(&self) -> Option<&IntType> {
        match self {
            TypeDesc::Int(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<&FloatType> {
        match self {
            TypeDesc::Float(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_pointer(&self) -> Option<&PointerType> {
        match self {
            TypeDesc::Pointer(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&SequentialType> {
        match self {
            TypeDesc::Array(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&SequentialType> {
        match self {
            TypeDesc::Vector(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&StructType> {
        match self {
            TypeDesc::Struct(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FnType> {
        match self {
            TypeDesc::Function(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, TypeDesc::Void)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, TypeDesc::Unknown(_))
    }

    /// The stable signature string. Cycles through named structs terminate
    /// because named structs render in name form.
    pub fn signature(&self) -> String {
        match self {
            TypeDesc::Void => "void".to_string(),
            TypeDesc::Int(t) => format!("int{}", t.bits),
            TypeDesc::Float(t) => {
                if t.bits == 32 {
                    "float".to_string()
                } else {
                    "double".to_string()
                }
            }
            TypeDesc::Pointer(t) => format!("{}*", t.element.signature()),
            TypeDesc::Array(t) => format!("[{} x {}]", t.num_elems, t.element.signature()),
            TypeDesc::Vector(t) => format!("<{} x {}>", t.num_elems, t.element.signature()),
            TypeDesc::Struct(t) => match &t.name {
                Some(n) => format!("'{}::{}' ", n.module, n.name),
                None => anon_struct_signature(t.elem_types()),
            },
            TypeDesc::Function(t) => fn_signature(t.return_type, &t.args),
            TypeDesc::Unknown(t) => t.signature.clone(),
        }
    }
}

fn anon_struct_signature(elems: &[&'static TypeDesc]) -> String {
    let mut sig = String::from("{");
    for (i, elem) in elems.iter().enumerate() {
        if i > 0 {
            sig.push_str(", ");
        }
        sig.push_str(&elem.signature());
    }
    sig.push('}');
    sig
}

fn fn_signature(return_type: &'static TypeDesc, args: &[&'static TypeDesc]) -> String {
    let mut sig = format!("{} (", return_type.signature());
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            sig.push_str(", ");
        }
        sig.push_str(&arg.signature());
    }
    sig.push(')');
    sig
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_are_singletons() {
        assert!(std::ptr::eq(TypeDesc::int(32), TypeDesc::int(32)));
        assert!(!std::ptr::eq(TypeDesc::int(32), TypeDesc::int(64)));
        assert!(std::ptr::eq(TypeDesc::void_type(), TypeDesc::void_type()));
        assert!(std::ptr::eq(TypeDesc::float(64), TypeDesc::float(64)));
    }

    #[test]
    fn pointer_canonicalization() {
        let i32t = TypeDesc::int(32);
        let p = TypeDesc::pointer(i32t);
        let pp = TypeDesc::pointer(p);
        assert!(std::ptr::eq(p, i32t.pointer_to()));
        assert!(std::ptr::eq(pp, TypeDesc::pointer(TypeDesc::pointer(i32t))));
        assert!(std::ptr::eq(p.as_pointer().unwrap().element(), i32t));
    }

    #[test]
    fn sequential_interning() {
        let a1 = TypeDesc::array(TypeDesc::int(8), 10);
        let a2 = TypeDesc::array(TypeDesc::int(8), 10);
        let a3 = TypeDesc::array(TypeDesc::int(8), 11);
        assert!(std::ptr::eq(a1, a2));
        assert!(!std::ptr::eq(a1, a3));

        let v = TypeDesc::vector(TypeDesc::float(32), 4);
        assert!(std::ptr::eq(v, TypeDesc::vector(TypeDesc::float(32), 4)));
        assert!(!std::ptr::eq(v as *const _, a1 as *const _));
    }

    #[test]
    fn anon_struct_interned_by_signature() {
        let s1 = TypeDesc::anon_struct(vec![TypeDesc::int(64), TypeDesc::float(64)]);
        let s2 = TypeDesc::anon_struct(vec![TypeDesc::int(64), TypeDesc::float(64)]);
        assert!(std::ptr::eq(s1, s2));
        assert_eq!(s1.signature(), "{int64, double}");
    }

    #[test]
    fn function_type_interned_by_signature() {
        let f1 = TypeDesc::function(TypeDesc::int(32), vec![TypeDesc::int(32), TypeDesc::int(32)]);
        let f2 = TypeDesc::function(TypeDesc::int(32), vec![TypeDesc::int(32), TypeDesc::int(32)]);
        assert!(std::ptr::eq(f1, f2));
        assert_eq!(f1.signature(), "int32 (int32, int32)");
    }

    #[test]
    fn named_struct_cycle_is_finite() {
        // %Node = { i32, %Node* } — one descriptor for the struct, one for
        // the pointer to it.
        let node = TypeDesc::forward_struct("types.test.cycle", "Node");
        let st = node.as_struct().unwrap();
        assert!(st.is_forward());

        st.set_elem_types(vec![TypeDesc::int(32), node.pointer_to()]);
        assert!(!st.is_forward());

        let again = TypeDesc::forward_struct("types.test.cycle", "Node");
        assert!(std::ptr::eq(node, again));
        assert!(std::ptr::eq(st.elem_type(1).as_pointer().unwrap().element(), node));
        assert_eq!(node.signature(), "'types.test.cycle::Node' ");
    }

    #[test]
    fn named_struct_redefinition_equal_is_noop() {
        let a = TypeDesc::named_struct(
            "types.test.redef",
            "Pair",
            vec![TypeDesc::int(32), TypeDesc::int(32)],
        );
        let b = TypeDesc::named_struct(
            "types.test.redef",
            "Pair",
            vec![TypeDesc::int(32), TypeDesc::int(32)],
        );
        assert!(std::ptr::eq(a, b));
    }

    #[test]
    #[should_panic(expected = "different value")]
    fn named_struct_mismatch_is_fatal() {
        TypeDesc::named_struct("types.test.bad", "S", vec![TypeDesc::int(32)]);
        TypeDesc::named_struct("types.test.bad", "S", vec![TypeDesc::int(64)]);
    }

    #[test]
    fn unknown_interned_by_module_and_signature() {
        let u1 = TypeDesc::unknown("m.c", "[ 50 x i8 ]");
        let u2 = TypeDesc::unknown("m.c", "[ 50 x i8 ]");
        let u3 = TypeDesc::unknown("other.c", "[ 50 x i8 ]");
        assert!(std::ptr::eq(u1, u2));
        assert!(!std::ptr::eq(u1, u3));
        assert!(u1.is_unknown());
        assert_eq!(u1.signature(), "[ 50 x i8 ]");
    }
}
