//! Instrumentation statistics.
//!
//! Collected per module during a pass run (always for transformed
//! functions; for every function in dry-run mode) and emitted as
//! semicolon-delimited CSV files, appended so repeated compiler invocations
//! accumulate into one data set.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::Path;

use crate::gate::CanInstrument;
use crate::ir::{Func, Module};
use crate::serialize::{SerContext, TypeSerializer};

const FUNCTION_STATS_FILE: &str = "function_stats.csv";
const NAMED_STRUCT_STATS_FILE: &str = "named_struct_stats.csv";

const DELIM: char = ';';
const FUNCTION_STATS_HEADER: &str = "MODULE;FNAME;ICOUNT;PCOUNT;FUNCTIONTY;CAN_INSTR;SHOULD_INSTR";
const NAMED_STRUCT_STATS_HEADER: &str = "MODULE;STRUCT_NAME;TYPE;ELEMENTS";

struct FunctionRecord {
    module_name: String,
    function_name: String,
    /// -1 marks "not collected" in reduced mode.
    instruction_count: i64,
    parameter_count: i64,
    type_serialization: String,
    can_instrument: String,
    should_instrument: String,
}

struct NamedStructRecord {
    module_name: String,
    /// The bare struct name, without module qualification.
    struct_name: String,
    /// The serialized name form used in type encodings.
    type_form: String,
    elements: String,
}

/// Accumulates per-function and per-named-struct rows for one pass run.
pub struct InstrumentationStats {
    functions: BTreeMap<String, FunctionRecord>,
    named_structs: BTreeMap<String, NamedStructRecord>,
    serializer: TypeSerializer,
    full_stats: bool,
}

impl Default for InstrumentationStats {
    fn default() -> Self {
        Self::new()
    }
}

impl InstrumentationStats {
    pub fn new() -> Self {
        InstrumentationStats {
            functions: BTreeMap::new(),
            named_structs: BTreeMap::new(),
            serializer: TypeSerializer::new(),
            full_stats: false,
        }
    }

    /// Collect everything, including serialized types and instruction
    /// counts. Dry runs turn this on.
    pub fn collect_full_stats(&mut self) {
        self.full_stats = true;
    }

    pub fn record_function(
        &mut self,
        module: &Module,
        func: &Func,
        can: CanInstrument,
        should: String,
    ) {
        if self.functions.contains_key(&func.name) {
            return;
        }
        let record = if self.full_stats {
            FunctionRecord {
                module_name: module.name.clone(),
                function_name: func.name.clone(),
                instruction_count: count_instructions(func) as i64,
                parameter_count: func.ty.params.len() as i64,
                type_serialization: self.serializer.serialize_fn(module, &func.ty),
                can_instrument: can.as_str().to_string(),
                should_instrument: should,
            }
        } else {
            FunctionRecord {
                module_name: module.name.clone(),
                function_name: func.name.clone(),
                instruction_count: -1,
                parameter_count: -1,
                type_serialization: "NA".to_string(),
                can_instrument: can.as_str().to_string(),
                should_instrument: should,
            }
        };
        self.functions.insert(func.name.clone(), record);
    }

    /// Record one row per named struct the serializer has seen for this
    /// module's functions.
    pub fn record_named_structs(&mut self, module: &Module) {
        for (name_form, elements) in self.serializer.named_structs().clone() {
            self.named_structs
                .entry(name_form.clone())
                .or_insert_with(|| NamedStructRecord {
                    module_name: module.name.clone(),
                    struct_name: bare_struct_name(&name_form, &module.name),
                    type_form: name_form,
                    elements,
                });
        }
    }

    /// Serialize a type through the shared serializer (so named structs
    /// land in the side table).
    pub fn serialize_type(&mut self, module: &Module, ty: &crate::ir::Ty) -> String {
        self.serializer.serialize(module, ty, SerContext::Na)
    }

    /// Append the collected rows to `<prefix>_function_stats.csv` and
    /// `<prefix>_named_struct_stats.csv` under `out_dir`, writing headers
    /// for fresh files. Emission failures are logged, not fatal.
    pub fn emit(&self, out_dir: &Path, prefix: &str) {
        if !out_dir.exists() {
            log::error!(
                "statistics output directory not found: {}",
                out_dir.display()
            );
            return;
        }

        let mut function_rows = String::new();
        for record in self.functions.values() {
            let icount = optional_count(record.instruction_count);
            let pcount = optional_count(record.parameter_count);
            let _ = writeln!(
                function_rows,
                "{}{DELIM}{}{DELIM}{}{DELIM}{}{DELIM}{}{DELIM}{}{DELIM}{}",
                escape(&record.module_name),
                escape(&record.function_name),
                escape(&icount),
                escape(&pcount),
                escape(&record.type_serialization),
                escape(&record.can_instrument),
                escape(&record.should_instrument),
            );
        }
        append_stats(
            &out_dir.join(format!("{prefix}_{FUNCTION_STATS_FILE}")),
            FUNCTION_STATS_HEADER,
            &function_rows,
        );

        let mut struct_rows = String::new();
        for record in self.named_structs.values() {
            let _ = writeln!(
                struct_rows,
                "{}{DELIM}{}{DELIM}{}{DELIM}{}",
                escape(&record.module_name),
                escape(&record.struct_name),
                escape(&record.type_form),
                escape(&record.elements),
            );
        }
        append_stats(
            &out_dir.join(format!("{prefix}_{NAMED_STRUCT_STATS_FILE}")),
            NAMED_STRUCT_STATS_HEADER,
            &struct_rows,
        );
    }
}

fn count_instructions(func: &Func) -> usize {
    func.body
        .as_ref()
        .map(|body| body.blocks.iter().map(|(_, b)| b.insts.len()).sum())
        .unwrap_or(0)
}

fn optional_count(count: i64) -> String {
    if count >= 0 {
        count.to_string()
    } else {
        "NA".to_string()
    }
}

/// Recover the bare struct name from its serialized name form,
/// `@% <module>::<name> %@`. Falls back to the full form if the shape is
/// unexpected.
fn bare_struct_name(name_form: &str, module_name: &str) -> String {
    name_form
        .strip_prefix("@% ")
        .and_then(|s| s.strip_suffix(" %@"))
        .and_then(|s| s.strip_prefix(module_name))
        .and_then(|s| s.strip_prefix("::"))
        .unwrap_or(name_form)
        .to_string()
}

/// Quote a field, replacing embedded double quotes with single quotes.
fn escape(field: &str) -> String {
    let cleaned: String = field
        .chars()
        .map(|c| if c == '"' { '\'' } else { c })
        .collect();
    format!("\"{cleaned}\"")
}

fn append_stats(path: &Path, header: &str, rows: &str) {
    let file = OpenOptions::new().create(true).append(true).open(path);
    match file {
        Ok(mut out) => {
            let fresh = out.metadata().map(|m| m.len() == 0).unwrap_or(false);
            let mut text = String::new();
            if fresh {
                text.push_str(header);
                text.push('\n');
            }
            text.push_str(rows);
            if let Err(err) = out.write_all(text.as_bytes()) {
                log::error!("failed to write statistics to {}: {err}", path.display());
            }
        }
        Err(err) => {
            log::error!(
                "failed to open statistics output {}: {err}",
                path.display()
            );
        }
    }
}

/// Replace path separators and dots so a module path becomes a usable file
/// name prefix.
pub fn sanitize_module_name(name: &str) -> String {
    name.chars()
        .map(|c| if c == '/' || c == '.' || c == '\\' { '_' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BodyBuilder, FnTy, Linkage, Param, Ty};

    fn add_func() -> Func {
        let mut b = BodyBuilder::new(2);
        let sum = b.bin(
            crate::ir::BinOp::Add,
            Ty::Int(32),
            b.param(0),
            b.param(1),
        );
        b.ret(Some(sum));
        Func {
            name: "add".into(),
            ty: FnTy::new(
                Ty::Int(32),
                vec![Param::new(Ty::Int(32)), Param::new(Ty::Int(32))],
            ),
            linkage: Linkage::Public,
            body: Some(b.finish()),
        }
    }

    #[test]
    fn full_stats_emit_and_append() {
        let dir = tempfile::tempdir().unwrap();
        let module = Module::new("src/test.c");

        let mut stats = InstrumentationStats::new();
        stats.collect_full_stats();
        stats.record_function(&module, &add_func(), CanInstrument::Yes, "NA".into());
        stats.emit(dir.path(), "src_test_c");
        stats.emit(dir.path(), "src_test_c");

        let text =
            std::fs::read_to_string(dir.path().join("src_test_c_function_stats.csv")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        // One header even after two emissions, one row per emission.
        assert_eq!(lines[0], FUNCTION_STATS_HEADER);
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains("\"add\""));
        assert!(lines[1].contains("\"@$ i32, i32, i32 $@\""));
        assert!(lines[1].contains("\"instrument\""));
    }

    #[test]
    fn reduced_stats_use_na_markers() {
        let dir = tempfile::tempdir().unwrap();
        let module = Module::new("m.c");
        let mut stats = InstrumentationStats::new();
        stats.record_function(&module, &add_func(), CanInstrument::Yes, "NA".into());
        stats.emit(dir.path(), "m_c");

        let text = std::fs::read_to_string(dir.path().join("m_c_function_stats.csv")).unwrap();
        assert!(text.lines().nth(1).unwrap().contains("\"NA\";\"NA\";\"NA\""));
    }

    #[test]
    fn named_struct_rows_come_from_the_serializer() {
        let dir = tempfile::tempdir().unwrap();
        let mut module = Module::new("m.c");
        module.define_struct("Node", Some(vec![Ty::Int(32)]));

        let mut stats = InstrumentationStats::new();
        stats.serialize_type(&module, &Ty::Named("Node".into()));
        stats.record_named_structs(&module);
        stats.emit(dir.path(), "m_c");

        let text =
            std::fs::read_to_string(dir.path().join("m_c_named_struct_stats.csv")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], NAMED_STRUCT_STATS_HEADER);

        // STRUCT_NAME carries the bare name; TYPE carries the serialized
        // name form. They must not collapse into one value.
        let columns: Vec<&str> = lines[1].split(DELIM).collect();
        assert_eq!(
            columns,
            vec!["\"m.c\"", "\"Node\"", "\"@% m.c::Node %@\"", "\"{ i32 }\""]
        );
        assert_ne!(columns[1], columns[2]);
    }

    #[test]
    fn sanitized_prefixes() {
        assert_eq!(sanitize_module_name("src/test.c"), "src_test_c");
    }
}
