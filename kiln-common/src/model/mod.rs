// kiln-common/src/model/mod.rs
pub mod formula;

pub use formula::{
    BottleFileSpec, BottleSpec, BuildStep, Caveat, CompilerFailure, Formula, FormulaOption,
    OptionConflict, OptionEffects, PatchSource, PatchSpec, UnsupportedOption,
};
