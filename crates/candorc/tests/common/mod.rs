//! Shared helpers for the compiler test suite.

use anyhow::Result;

use candorc::hir::Hir;
use candorc::CompileOptions;

/// Build HIR for a source snippet, suppressing diagnostics.
pub fn hir_for(src: &str) -> Result<Hir> {
    let _guard = candorc::diagnostics::suppress();
    candorc::build_hir(src, &CompileOptions::default())
}

/// Printed HIR, panicking on compile errors.
#[allow(dead_code)]
pub fn print_hir(src: &str) -> String {
    hir_for(src).expect("source should compile").print()
}
