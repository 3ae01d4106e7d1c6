//! Eligibility gate: which functions get rewritten.
//!
//! Two layers decide. `can_instrument` is structural and non-negotiable —
//! only definitions with a fixed argument list can be wrapped. On top of
//! that, a pluggable [`InstrumentPredicate`] accepts or rejects at module
//! and function granularity; the default accepts everything eligible, and
//! [`TargetedInstrument`] restricts rewriting to an allow-list loaded from
//! a CSV file.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::ir::{Func, Module};

/// Structural eligibility of one function, with the reason when rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanInstrument {
    Yes,
    /// Declarations have no body to preserve.
    NotDefinition,
    /// Variadic calling conventions cannot be thunked.
    Variadic,
}

impl CanInstrument {
    /// Stable label used in statistics output.
    pub fn as_str(self) -> &'static str {
        match self {
            CanInstrument::Yes => "instrument",
            CanInstrument::NotDefinition => "not_decl",
            CanInstrument::Variadic => "not_varargs",
        }
    }
}

/// A function is eligible iff it is a definition and not variadic.
/// Everything else is accepted; types the descriptor vocabulary cannot
/// express degrade to unknown descriptors later.
pub fn can_instrument(func: &Func) -> CanInstrument {
    if func.is_declaration() {
        CanInstrument::NotDefinition
    } else if func.ty.variadic {
        CanInstrument::Variadic
    } else {
        CanInstrument::Yes
    }
}

/// Policy callback deciding whether to instrument modules and functions.
pub trait InstrumentPredicate {
    fn module(&self, module: &Module) -> bool;
    fn function(&self, module: &Module, func: &Func) -> bool;

    /// Free-form decision information for statistics output.
    fn decision_info(&self, _module: &Module, _func: &Func) -> String {
        "NA".to_string()
    }
}

/// Instrument everything eligible.
pub struct AlwaysInstrument;

impl InstrumentPredicate for AlwaysInstrument {
    fn module(&self, _module: &Module) -> bool {
        true
    }

    fn function(&self, _module: &Module, _func: &Func) -> bool {
        true
    }
}

#[derive(Debug, Error)]
pub enum TargetFileError {
    #[error("failed to read target functions from {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Instrument only an allow-list of modules and mangled function names.
///
/// The list is a semicolon-delimited CSV: first column module path, second
/// column mangled function name. The first line is a header and is
/// skipped; trailing carriage returns are stripped.
pub struct TargetedInstrument {
    target_modules: HashSet<String>,
    target_functions: HashSet<String>,
}

impl TargetedInstrument {
    const DELIMITER: char = ';';

    /// Load targets from `path`. A missing file logs a warning and matches
    /// nothing, so an instrumented build without targets degrades to a
    /// plain build.
    pub fn from_csv(path: &Path) -> Result<Self, TargetFileError> {
        let mut targets = TargetedInstrument {
            target_modules: HashSet::new(),
            target_functions: HashSet::new(),
        };
        if !path.exists() {
            log::warn!("target function file not found: {}", path.display());
            return Ok(targets);
        }
        let text = std::fs::read_to_string(path).map_err(|source| TargetFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        for line in text.lines().skip(1) {
            let line = line.strip_suffix('\r').unwrap_or(line);
            for (column, token) in line.split(Self::DELIMITER).enumerate() {
                match column {
                    0 => targets.target_modules.insert(token.to_string()),
                    1 => targets.target_functions.insert(token.to_string()),
                    _ => continue,
                };
            }
        }
        Ok(targets)
    }

    pub fn is_empty(&self) -> bool {
        self.target_modules.is_empty() && self.target_functions.is_empty()
    }
}

impl InstrumentPredicate for TargetedInstrument {
    fn module(&self, module: &Module) -> bool {
        self.target_modules.contains(&module.name)
    }

    fn function(&self, _module: &Module, func: &Func) -> bool {
        self.target_functions.contains(&func.name)
    }

    fn decision_info(&self, module: &Module, func: &Func) -> String {
        format!(
            "module:{}#function:{}",
            self.module(module),
            self.function(module, func)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BodyBuilder, FnTy, Linkage, Param, Ty};
    use std::io::Write;

    fn definition(name: &str, variadic: bool) -> Func {
        let mut ty = FnTy::new(Ty::Void, vec![Param::new(Ty::Int(32))]);
        ty.variadic = variadic;
        let mut b = BodyBuilder::new(1);
        b.ret(None);
        Func {
            name: name.into(),
            ty,
            linkage: Linkage::Public,
            body: Some(b.finish()),
        }
    }

    #[test]
    fn definitions_only_and_no_variadics() {
        let def = definition("f", false);
        assert_eq!(can_instrument(&def), CanInstrument::Yes);

        let variadic = definition("g", true);
        assert_eq!(can_instrument(&variadic), CanInstrument::Variadic);

        let decl = Func {
            name: "h".into(),
            ty: FnTy::new(Ty::Void, vec![]),
            linkage: Linkage::Public,
            body: None,
        };
        assert_eq!(can_instrument(&decl), CanInstrument::NotDefinition);
    }

    #[test]
    fn targeted_instrument_parses_csv() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "MODULE;FNAME").unwrap();
        writeln!(file, "src/a.c;add\r").unwrap();
        writeln!(file, "src/b.c;mul").unwrap();
        file.flush().unwrap();

        let targets = TargetedInstrument::from_csv(file.path()).unwrap();
        assert!(!targets.is_empty());

        let module_a = Module::new("src/a.c");
        let module_c = Module::new("src/c.c");
        assert!(targets.module(&module_a));
        assert!(!targets.module(&module_c));

        let add = definition("add", false);
        let sub = definition("sub", false);
        assert!(targets.function(&module_a, &add));
        assert!(!targets.function(&module_a, &sub));
    }

    #[test]
    fn missing_target_file_matches_nothing() {
        let targets =
            TargetedInstrument::from_csv(Path::new("/nonexistent/targets.csv")).unwrap();
        assert!(targets.is_empty());
        assert!(!targets.module(&Module::new("src/a.c")));
    }
}
