pub mod generator;
pub mod regalloc;

use crate::ir::Program3;
pub use generator::EmitError;

/// Allocates registers for every method and emits one ARM assembly file.
pub fn generate(program: &Program3) -> Result<String, EmitError> {
    let mut methods = Vec::with_capacity(program.methods.len());

    for method in &program.methods {
        let allocation = regalloc::allocate(method);
        methods.push((method, allocation));
    }

    let assembly = generator::generate_program(program, &methods)?;
    log::info!("emitted {} methods, {} bytes of assembly", methods.len(), assembly.len());
    Ok(assembly)
}
