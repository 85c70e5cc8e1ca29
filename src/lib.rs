//! A compiler for JLite, a small class-based teaching language.
//!
//! Source is parsed and type checked, lowered to the three-address IR3,
//! optionally optimized, then register-allocated and emitted as ARM assembly.

pub mod analysis;
pub mod backend;
pub mod frontend;
pub mod ir;

use analysis::semantic::SemanticError;
use backend::EmitError;
use frontend::parser::ParseError;
use ir::lower::{LowerError, OperandOrder};
use ir::Program3;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    pub optimize: bool,
    pub operand_order: OperandOrder,
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("{0}")]
    Parse(#[from] ParseError),

    #[error("{}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("\n"))]
    Semantic(Vec<SemanticError>),

    #[error(transparent)]
    Lower(#[from] LowerError),

    #[error(transparent)]
    Emit(#[from] EmitError),
}

impl From<Vec<SemanticError>> for CompileError {
    fn from(errors: Vec<SemanticError>) -> Self {
        CompileError::Semantic(errors)
    }
}

/// Runs everything up to and including IR3 optimization.
pub fn build_ir(source: &str, options: &Options) -> Result<Program3, CompileError> {
    let mut ast = frontend::parser::parse(source)?;
    analysis::semantic::check(&mut ast)?;

    let program = ir::lower::lower(&ast, options.operand_order)?;
    log::info!("lowered {} classes, {} methods", program.classes.len(), program.methods.len());

    if options.optimize {
        Ok(ir::optimize::optimize(&program))
    } else {
        Ok(program)
    }
}

/// Compiles JLite source to ARM assembly.
pub fn compile(source: &str, options: &Options) -> Result<String, CompileError> {
    let program = build_ir(source, options)?;
    Ok(backend::generate(&program)?)
}
