//! Optimizing-tier lowering for the silt bytecode interpreter.
//!
//! The optimizer hands us SSA IR: basic blocks, phis, typed values, explicit
//! environment operands. The interpreter consumes stack-plus-locals bytecode.
//! This crate is the pass between the two: it decides, for every SSA value,
//! whether it can flow on the evaluation stack or needs a numbered local
//! slot, and emits bytecode whose stack discipline matches that decision at
//! every instruction boundary.
//!
//! The pipeline, in order: [`cssa`] breaks phi semantics into explicit
//! copies, [`liveness`] computes per-block live intervals, [`alloc`] runs a
//! stack pre-coloring pass followed by dominance-ordered slot coloring,
//! [`verify`] symbolically executes every path to check the assignment, and
//! [`emit`] walks the blocks issuing bytecode through [`bc::CodeStream`].
//!
//! Entry point: [`emit::Lowering::compile`].

pub mod alloc;
pub mod bc;
pub mod cfg;
pub mod cssa;
pub mod emit;
pub mod ir;
pub mod ir_parse;
pub mod liveness;
pub mod verify;

use std::sync::OnceLock;

/// Debug switches recognized by the lowering tier. Each flag is independent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugFlags {
    /// Dump the IR after CSSA construction.
    pub print_cssa: bool,
    /// Verbose liveness trace while the intervals are computed.
    pub trace_liveness: bool,
    /// Dump the allocation map.
    pub print_allocation: bool,
    /// Dump the IR right before emission.
    pub print_final_ir: bool,
    /// Disassemble the emitted bytecode.
    pub print_bytecode: bool,
    /// Run the whole pipeline but do not install the result.
    pub dry_run: bool,
}

impl DebugFlags {
    fn parse_env(value: &str) -> Self {
        let mut flags = DebugFlags::default();
        for name in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match name {
                "print-cssa" => flags.print_cssa = true,
                "trace-liveness" => flags.trace_liveness = true,
                "print-allocation" => flags.print_allocation = true,
                "print-final-ir" => flags.print_final_ir = true,
                "print-bytecode" => flags.print_bytecode = true,
                "dry-run" => flags.dry_run = true,
                other => panic!(
                    "invalid SILT_DEBUG flag {other:?}; expected one of print-cssa, \
                     trace-liveness, print-allocation, print-final-ir, print-bytecode, dry-run"
                ),
            }
        }
        flags
    }

    /// The flags configured for this process.
    ///
    /// Read once from `SILT_DEBUG` (a comma-separated flag list), then cached.
    /// When unset, all flags are off.
    pub fn from_env() -> Self {
        static FLAGS: OnceLock<DebugFlags> = OnceLock::new();
        *FLAGS.get_or_init(|| match std::env::var("SILT_DEBUG") {
            Ok(value) => DebugFlags::parse_env(&value),
            Err(std::env::VarError::NotPresent) => DebugFlags::default(),
            Err(std::env::VarError::NotUnicode(_)) => {
                panic!("SILT_DEBUG must be valid UTF-8")
            }
        })
    }
}
